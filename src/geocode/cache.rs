use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use super::client::Coordinates;
use super::query_key;

/// Outcome of a past lookup. A query with no entry has never been tried.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEntry {
    Resolved(Coordinates),
    /// The service answered but had no match.
    Empty,
    /// The request failed; kept so reruns don't hammer the service.
    Errored(String),
}

// On disk: [lat, lon] | null | {"error": "..."}
impl Serialize for CacheEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CacheEntry::Resolved(c) => [c.lat, c.lon].serialize(serializer),
            CacheEntry::Empty => serializer.serialize_none(),
            CacheEntry::Errored(message) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("error", message)?;
                map.end()
            }
        }
    }
}

enum Decoded {
    Current(CacheEntry),
    Migrated(CacheEntry),
}

impl CacheEntry {
    fn decode(value: &Value) -> Option<Decoded> {
        match value {
            Value::Null => Some(Decoded::Current(CacheEntry::Empty)),
            Value::Array(items) if items.len() == 2 => {
                let lat = coordinate(&items[0])?;
                let lon = coordinate(&items[1])?;
                Some(Decoded::Current(CacheEntry::Resolved(Coordinates { lat, lon })))
            }
            Value::Object(map) => {
                let legacy = map
                    .get("latitude")
                    .and_then(coordinate)
                    .zip(map.get("longitude").and_then(coordinate));
                if let Some((lat, lon)) = legacy {
                    return Some(Decoded::Migrated(CacheEntry::Resolved(Coordinates {
                        lat,
                        lon,
                    })));
                }
                // Older runs stored raw service payloads under "result"; their
                // content was never inspected, so they count as "no match".
                if map.contains_key("result") {
                    return Some(Decoded::Migrated(CacheEntry::Empty));
                }
                let message = match map.get("error")? {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                Some(Decoded::Current(CacheEntry::Errored(message)))
            }
            _ => None,
        }
    }
}

fn coordinate(value: &Value) -> Option<f64> {
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    parsed.filter(|v| v.is_finite())
}

/// Persistent query → result table, keyed by normalized query.
#[derive(Debug, Default)]
pub struct GeocodeCache {
    entries: BTreeMap<String, CacheEntry>,
    migrated: usize,
}

impl GeocodeCache {
    /// Read the cache file. A missing file is an empty cache.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("Invalid JSON in {}", path.display()))?;
        let cache = Self::from_json(value)
            .with_context(|| format!("Invalid geocode cache {}", path.display()))?;
        if cache.migrated > 0 {
            info!(
                "Migrated {} legacy geocode cache entries from {}",
                cache.migrated,
                path.display()
            );
        }
        Ok(cache)
    }

    pub fn from_json(value: Value) -> Result<Self> {
        let Value::Object(map) = value else {
            bail!("expected a JSON object at the top level");
        };
        let mut cache = Self::default();
        for (key, value) in map {
            match CacheEntry::decode(&value) {
                Some(Decoded::Current(entry)) => {
                    cache.entries.insert(query_key(&key), entry);
                }
                Some(Decoded::Migrated(entry)) => {
                    cache.entries.insert(query_key(&key), entry);
                    cache.migrated += 1;
                }
                None => warn!("Dropping unrecognized geocode cache entry {:?}: {}", key, value),
            }
        }
        Ok(cache)
    }

    pub fn get(&self, query: &str) -> Option<&CacheEntry> {
        self.entries.get(&query_key(query))
    }

    pub fn put(&mut self, query: &str, entry: CacheEntry) {
        self.entries.insert(query_key(query), entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries rewritten from a legacy shape during load.
    pub fn migrated(&self) -> usize {
        self.migrated
    }

    /// Write the whole table, sorted by key, replacing `path` atomically.
    pub fn save(&self, path: &Path) -> Result<()> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        let mut out = BufWriter::new(tmp);
        serde_json::to_writer_pretty(&mut out, &self.entries)?;
        out.write_all(b"\n")?;
        let tmp = out.into_inner().map_err(|e| e.into_error())?;
        tmp.as_file().sync_all()?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}
