pub mod cache;
pub mod client;
pub mod throttle;

use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::parser::fields::is_unknown_place;
use crate::parser::text::collapse_whitespace;
use crate::record::FanzineRow;
use cache::{CacheEntry, GeocodeCache};
use client::Geocoder;
use throttle::Throttle;

/// Cache key for a query: collapsed whitespace, lower-cased.
pub fn query_key(query: &str) -> String {
    collapse_whitespace(query).to_lowercase()
}

/// Free-text query for a row's place, or None for placeholder places.
pub fn place_query(city: Option<&str>, country: &str) -> Option<String> {
    let city = city.filter(|c| !is_unknown_place(c))?;
    let city = collapse_whitespace(city);
    let country = collapse_whitespace(country);
    if country.is_empty() {
        Some(city)
    } else {
        Some(format!("{}, {}", city, country))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaceQuery {
    pub key: String,
    /// As first seen; this is what gets sent to the service.
    pub query: String,
}

/// Distinct queries across all rows, in first-seen order.
pub fn unique_queries(rows: &[FanzineRow]) -> Vec<PlaceQuery> {
    let mut seen = HashSet::new();
    rows.iter()
        .filter_map(|row| place_query(row.city.as_deref(), &row.country))
        .filter_map(|query| {
            let key = query_key(&query);
            seen.insert(key.clone()).then_some(PlaceQuery { key, query })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct GeocodeOptions {
    pub min_delay: Duration,
    /// Ceiling on completed queries for the whole phase, cache hits
    /// included.
    pub max_queries: Option<usize>,
    pub continue_on_error: bool,
    pub retry_errored: bool,
}

impl Default for GeocodeOptions {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1100),
            max_queries: None,
            continue_on_error: false,
            retry_errored: false,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GeocodeStats {
    pub unique: usize,
    pub cached: usize,
    pub requests: usize,
    pub resolved: usize,
    pub empty: usize,
    pub errors: usize,
    /// Queries left untouched because the query ceiling was hit.
    pub skipped: usize,
}

/// Resolve every query not yet in the cache, one request at a time.
///
/// Stops at the first failure unless `continue_on_error` is set, in which
/// case the failure is recorded as an `Errored` entry.
pub async fn geocode_queries<G>(
    geocoder: &G,
    cache: &mut GeocodeCache,
    queries: &[PlaceQuery],
    options: &GeocodeOptions,
) -> Result<GeocodeStats>
where
    G: Geocoder + ?Sized,
{
    let mut stats = GeocodeStats {
        unique: queries.len(),
        ..Default::default()
    };
    let mut throttle = Throttle::new(options.min_delay);

    for (idx, item) in queries.iter().enumerate() {
        let completed = stats.cached + stats.requests;
        if options.max_queries.is_some_and(|max| completed >= max) {
            stats.skipped = queries.len() - idx;
            info!("Reached geocode query limit ({})", completed);
            break;
        }

        let cached = match cache.get(&item.key) {
            Some(CacheEntry::Errored(_)) if options.retry_errored => false,
            Some(_) => true,
            None => false,
        };
        if cached {
            stats.cached += 1;
            continue;
        }

        throttle.wait().await;
        info!("({}/{}) Querying: {}", idx + 1, queries.len(), item.query);
        let outcome = geocoder.lookup(&item.query).await;
        throttle.record_call(Instant::now());
        stats.requests += 1;

        match outcome {
            Ok(Some(coords)) => {
                info!("  found {:.4}, {:.4}", coords.lat, coords.lon);
                cache.put(&item.key, CacheEntry::Resolved(coords));
                stats.resolved += 1;
            }
            Ok(None) => {
                info!("  no results");
                cache.put(&item.key, CacheEntry::Empty);
                stats.empty += 1;
            }
            Err(err) if options.continue_on_error => {
                warn!("Geocode error for {:?}: {}", item.query, err);
                cache.put(&item.key, CacheEntry::Errored(err.to_string()));
                stats.errors += 1;
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Geocoding failed for {:?}", item.query));
            }
        }
    }

    Ok(stats)
}

/// Copy resolved coordinates onto rows. Returns the number of rows updated.
pub fn apply_coordinates(rows: &mut [FanzineRow], cache: &GeocodeCache) -> usize {
    let mut updated = 0;
    for row in rows.iter_mut() {
        let Some(query) = place_query(row.city.as_deref(), &row.country) else {
            continue;
        };
        if let Some(CacheEntry::Resolved(coords)) = cache.get(&query) {
            row.latitude = Some(coords.lat);
            row.longitude = Some(coords.lon);
            updated += 1;
        }
    }
    updated
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::client::{Coordinates, GeocodeError};
    use super::*;

    /// Replays scripted answers and records every query it receives.
    struct ScriptedGeocoder {
        answers: Mutex<VecDeque<Result<Option<Coordinates>, GeocodeError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedGeocoder {
        fn new(answers: Vec<Result<Option<Coordinates>, GeocodeError>>) -> Self {
            Self {
                answers: Mutex::new(answers.into()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Geocoder for ScriptedGeocoder {
        async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
            self.calls.lock().unwrap().push(query.to_string());
            self.answers.lock().unwrap().pop_front().unwrap_or(Ok(None))
        }
    }

    fn at(lat: f64, lon: f64) -> Option<Coordinates> {
        Some(Coordinates { lat, lon })
    }

    fn row(city: Option<&str>, country: &str) -> FanzineRow {
        FanzineRow {
            source_file: "x.html".into(),
            city: city.map(str::to_string),
            country: country.into(),
            ..Default::default()
        }
    }

    fn fast() -> GeocodeOptions {
        GeocodeOptions {
            min_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn place_query_composition() {
        assert_eq!(place_query(Some("Roma"), ""), Some("Roma".into()));
        assert_eq!(place_query(Some(" Roma "), "Italia"), Some("Roma, Italia".into()));
        assert_eq!(place_query(Some("???"), "Italia"), None);
        assert_eq!(place_query(Some("n/a"), ""), None);
        assert_eq!(place_query(None, "Italia"), None);
    }

    #[test]
    fn unique_queries_first_seen_order() {
        let rows = vec![
            row(Some("Roma"), ""),
            row(Some("Milano"), ""),
            row(Some("  roma "), ""),
            row(Some("???"), ""),
            row(None, ""),
            row(Some("ROMA"), ""),
            row(Some("Bari"), ""),
        ];
        let queries = unique_queries(&rows);
        let keys: Vec<&str> = queries.iter().map(|q| q.key.as_str()).collect();
        assert_eq!(keys, ["roma", "milano", "bari"]);
        assert_eq!(queries[0].query, "Roma");
    }

    #[tokio::test]
    async fn case_variants_hit_network_once() {
        let rows = vec![row(Some("Roma"), "Italia"), row(Some(" ROMA "), "italia")];
        let queries = unique_queries(&rows);
        let geocoder = ScriptedGeocoder::new(vec![Ok(at(41.9, 12.5))]);
        let mut cache = GeocodeCache::default();

        let stats = geocode_queries(&geocoder, &mut cache, &queries, &fast())
            .await
            .unwrap();

        assert_eq!(geocoder.calls(), ["Roma, Italia"]);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.resolved, 1);
    }

    #[tokio::test]
    async fn cached_entries_skip_network() {
        let mut cache = GeocodeCache::default();
        cache.put("roma", CacheEntry::Resolved(Coordinates { lat: 41.9, lon: 12.5 }));
        cache.put("atlantide", CacheEntry::Empty);
        cache.put("milano", CacheEntry::Errored("timeout".into()));
        let rows = vec![
            row(Some("Roma"), ""),
            row(Some("Atlantide"), ""),
            row(Some("Milano"), ""),
            row(Some("Bari"), ""),
        ];
        let geocoder = ScriptedGeocoder::new(vec![Ok(None)]);

        let stats = geocode_queries(&geocoder, &mut cache, &unique_queries(&rows), &fast())
            .await
            .unwrap();

        assert_eq!(geocoder.calls(), ["Bari"]);
        assert_eq!(stats.cached, 3);
        assert_eq!(stats.empty, 1);
        assert_eq!(cache.get("bari"), Some(&CacheEntry::Empty));
    }

    #[tokio::test]
    async fn retry_errored_requeries_failures() {
        let mut cache = GeocodeCache::default();
        cache.put("milano", CacheEntry::Errored("timeout".into()));
        let geocoder = ScriptedGeocoder::new(vec![Ok(at(45.46, 9.19))]);
        let options = GeocodeOptions {
            retry_errored: true,
            ..fast()
        };

        let queries = unique_queries(&[row(Some("Milano"), "")]);
        geocode_queries(&geocoder, &mut cache, &queries, &options)
            .await
            .unwrap();

        assert_eq!(geocoder.calls(), ["Milano"]);
        assert!(matches!(cache.get("milano"), Some(CacheEntry::Resolved(_))));
    }

    #[tokio::test]
    async fn failure_aborts_by_default() {
        let geocoder = ScriptedGeocoder::new(vec![
            Ok(at(41.9, 12.5)),
            Err(GeocodeError::Response("boom".into())),
            Ok(at(45.46, 9.19)),
        ]);
        let rows = vec![row(Some("Roma"), ""), row(Some("Napoli"), ""), row(Some("Milano"), "")];
        let mut cache = GeocodeCache::default();

        let err = geocode_queries(&geocoder, &mut cache, &unique_queries(&rows), &fast())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("Napoli"));
        assert_eq!(geocoder.calls(), ["Roma", "Napoli"]);
        // Entries written before the failure stay valid in memory.
        assert!(matches!(cache.get("roma"), Some(CacheEntry::Resolved(_))));
        assert_eq!(cache.get("napoli"), None);
    }

    #[tokio::test]
    async fn failure_recorded_when_continuing() {
        let geocoder = ScriptedGeocoder::new(vec![
            Err(GeocodeError::Response("boom".into())),
            Ok(at(45.46, 9.19)),
        ]);
        let rows = vec![row(Some("Napoli"), ""), row(Some("Milano"), "")];
        let mut cache = GeocodeCache::default();
        let options = GeocodeOptions {
            continue_on_error: true,
            ..fast()
        };

        let stats = geocode_queries(&geocoder, &mut cache, &unique_queries(&rows), &options)
            .await
            .unwrap();

        assert_eq!(stats.errors, 1);
        assert_eq!(stats.resolved, 1);
        assert!(matches!(cache.get("napoli"), Some(CacheEntry::Errored(m)) if m.contains("boom")));
    }

    #[tokio::test]
    async fn query_ceiling_stops_phase() {
        let mut cache = GeocodeCache::default();
        cache.put("bari", CacheEntry::Empty);
        let rows = vec![
            row(Some("Roma"), ""),
            row(Some("Bari"), ""),
            row(Some("Milano"), ""),
            row(Some("Napoli"), ""),
        ];
        let geocoder = ScriptedGeocoder::new(vec![Ok(at(41.9, 12.5)), Ok(at(45.46, 9.19))]);
        let options = GeocodeOptions {
            max_queries: Some(2),
            ..fast()
        };

        let stats = geocode_queries(&geocoder, &mut cache, &unique_queries(&rows), &options)
            .await
            .unwrap();

        assert_eq!(geocoder.calls(), ["Roma"]);
        assert_eq!((stats.requests, stats.cached), (1, 1));
        assert_eq!(stats.skipped, 2);
        assert_eq!(cache.get("milano"), None);
    }

    #[tokio::test]
    async fn cache_hits_count_toward_ceiling() {
        let mut cache = GeocodeCache::default();
        cache.put("bari", CacheEntry::Empty);
        let rows = vec![row(Some("Bari"), ""), row(Some("Roma"), "")];
        let geocoder = ScriptedGeocoder::new(vec![Ok(at(41.9, 12.5))]);
        let options = GeocodeOptions {
            max_queries: Some(1),
            ..fast()
        };

        let stats = geocode_queries(&geocoder, &mut cache, &unique_queries(&rows), &options)
            .await
            .unwrap();

        assert!(geocoder.calls().is_empty());
        assert_eq!(stats.requests, 0);
        assert_eq!(stats.cached, 1);
        assert_eq!(stats.skipped, 1);
        assert_eq!(cache.get("roma"), None);
    }

    #[test]
    fn coordinates_only_for_resolved() {
        let mut cache = GeocodeCache::default();
        cache.put("roma, italia", CacheEntry::Resolved(Coordinates { lat: 41.9, lon: 12.5 }));
        cache.put("atlantide, italia", CacheEntry::Empty);
        cache.put("milano, italia", CacheEntry::Errored("timeout".into()));
        let mut rows = vec![
            row(Some("Roma"), "Italia"),
            row(Some("Atlantide"), "Italia"),
            row(Some("Milano"), "Italia"),
            row(Some("???"), "Italia"),
            row(Some("roma"), "Italia"),
        ];

        assert_eq!(apply_coordinates(&mut rows, &cache), 2);
        assert_eq!((rows[0].latitude, rows[0].longitude), (Some(41.9), Some(12.5)));
        assert_eq!(rows[1].latitude, None);
        assert_eq!(rows[2].latitude, None);
        assert_eq!(rows[3].latitude, None);
        assert_eq!(rows[4].longitude, Some(12.5));
    }

    #[tokio::test]
    async fn end_to_end_example_document() {
        let html = r#"<html><head><title>Example</title></head><body>
            <div class="project-info"><h4>Fanzine:</h4><p>Cosmic Rays</p><h4>Città</h4><p>Roma</p></div>
            </body></html>"#;
        let mut rows = vec![crate::parser::process_page("example.html", html, "")];
        let geocoder = ScriptedGeocoder::new(vec![Ok(at(41.8933, 12.4829))]);
        let mut cache = GeocodeCache::default();

        geocode_queries(&geocoder, &mut cache, &unique_queries(&rows), &fast())
            .await
            .unwrap();
        apply_coordinates(&mut rows, &cache);

        assert_eq!(geocoder.calls(), ["Roma"]);
        assert_eq!(rows[0].fanzine.as_deref(), Some("Cosmic Rays"));
        assert_eq!(rows[0].title.as_deref(), Some("Example"));
        assert_eq!(rows[0].latitude, Some(41.8933));
        assert_eq!(rows[0].longitude, Some(12.4829));
    }
}
