use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;

/// One output row per HTML document. Field order is the CSV column order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FanzineRow {
    pub source_file: String,
    pub canonical_url: Option<String>,
    pub title: Option<String>,
    pub fanzine: Option<String>,
    pub city: Option<String>,
    pub country: String,
    pub activity: Option<String>,
    pub year_start: Option<i32>,
    pub year_end: Option<i32>,
    pub genre: Option<String>,
    pub pdf_href: Option<String>,
    pub og_image: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

pub fn write_csv(path: &Path, rows: &[FanzineRow]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    if rows.is_empty() {
        writer.write_record(column_names())?;
    }
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

fn column_names() -> [&'static str; 14] {
    [
        "source_file",
        "canonical_url",
        "title",
        "fanzine",
        "city",
        "country",
        "activity",
        "year_start",
        "year_end",
        "genre",
        "pdf_href",
        "og_image",
        "latitude",
        "longitude",
    ]
}
