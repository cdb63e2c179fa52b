mod discover;
mod geocode;
mod parser;
mod record;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{error, info};

use geocode::cache::GeocodeCache;
use geocode::client::{NominatimClient, NOMINATIM_SEARCH_URL};
use geocode::GeocodeOptions;
use record::FanzineRow;

#[derive(Parser)]
#[command(
    name = "fanzine_extract",
    about = "Extract fanzine records from saved HTML pages into a CSV"
)]
struct Cli {
    /// Directory containing the saved HTML pages
    #[arg(long, default_value = "data")]
    input: PathBuf,

    /// File pattern, relative to --input
    #[arg(long, default_value = "*.html")]
    glob: String,

    /// Output CSV path
    #[arg(long, default_value = "fanzines.csv")]
    output: PathBuf,

    /// Country appended to geocoding queries and written to every row
    #[arg(long, default_value = "")]
    default_country: String,

    /// Look up city coordinates with Nominatim
    #[arg(long)]
    geocode: bool,

    #[arg(long, default_value = ".cache/geocode_cache.json")]
    geocode_cache: PathBuf,

    /// Minimum pause between geocoding requests
    #[arg(long, default_value_t = 1.1)]
    geocode_delay_seconds: f64,

    #[arg(long, default_value_t = 20.0)]
    geocode_timeout_seconds: f64,

    #[arg(long, default_value = "fanzinet-extract/1.0 (local script)")]
    geocode_user_agent: String,

    /// Max places to process this run, cache hits included (0 = no limit)
    #[arg(long, default_value_t = 0)]
    geocode_max_queries: usize,

    #[arg(long, default_value = NOMINATIM_SEARCH_URL)]
    geocode_endpoint: String,

    /// Query again places whose last lookup failed
    #[arg(long)]
    geocode_retry_errors: bool,

    /// Record failed lookups in the cache instead of aborting
    #[arg(long)]
    continue_on_geocode_error: bool,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let files = discover::find_input_files(&cli.input, &cli.glob)?;
    if files.is_empty() {
        error!(
            "No files matching {:?} in {}",
            cli.glob,
            cli.input.display()
        );
        return Ok(ExitCode::from(2));
    }

    info!("Parsing {} files from {}", files.len(), cli.input.display());
    let mut rows = extract_rows(&files, &cli.default_country)?;

    if cli.geocode {
        run_geocoding(&cli, &mut rows).await?;
    }

    record::write_csv(&cli.output, &rows)?;
    let with_city = rows.iter().filter(|r| r.city.is_some()).count();
    let with_coords = rows.iter().filter(|r| r.latitude.is_some()).count();
    info!(
        "Wrote {} rows to {} ({} with city, {} with coordinates)",
        rows.len(),
        cli.output.display(),
        with_city,
        with_coords
    );
    info!("Done in {}", format_duration(t0.elapsed()));

    Ok(ExitCode::SUCCESS)
}

fn extract_rows(files: &[PathBuf], country: &str) -> Result<Vec<FanzineRow>> {
    let pb = ProgressBar::new(files.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")?
            .progress_chars("#>-"),
    );

    let mut rows = Vec::with_capacity(files.len());
    for path in files {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        let html = String::from_utf8_lossy(&bytes);
        rows.push(parser::process_page(&display_path(path), &html, country));
        pb.inc(1);
    }

    pb.finish_and_clear();
    Ok(rows)
}

async fn run_geocoding(cli: &Cli, rows: &mut [FanzineRow]) -> Result<()> {
    let delay = seconds("--geocode-delay-seconds", cli.geocode_delay_seconds)?;
    let timeout = seconds("--geocode-timeout-seconds", cli.geocode_timeout_seconds)?;

    let mut cache = GeocodeCache::load(&cli.geocode_cache)?;
    if cache.is_empty() {
        info!("Starting with an empty geocode cache at {}", cli.geocode_cache.display());
    } else {
        info!(
            "Loaded {} cached geocode entries from {}",
            cache.len(),
            cli.geocode_cache.display()
        );
    }

    let client = NominatimClient::new(&cli.geocode_endpoint, &cli.geocode_user_agent, timeout)
        .context("Failed to build HTTP client")?;
    let options = GeocodeOptions {
        min_delay: delay,
        max_queries: (cli.geocode_max_queries > 0).then_some(cli.geocode_max_queries),
        continue_on_error: cli.continue_on_geocode_error,
        retry_errored: cli.geocode_retry_errors,
    };

    let queries = geocode::unique_queries(rows);
    info!("Geocoding {} unique places", queries.len());
    let t_geo = Instant::now();
    let stats = geocode::geocode_queries(&client, &mut cache, &queries, &options).await?;
    info!(
        "Geocoded in {}: {} cached, {} requests ({} found, {} empty, {} errors), {} skipped",
        format_duration(t_geo.elapsed()),
        stats.cached,
        stats.requests,
        stats.resolved,
        stats.empty,
        stats.errors,
        stats.skipped
    );

    // Rewrites migrated legacy entries too, even when nothing new was fetched.
    if stats.requests > 0 || cache.migrated() > 0 {
        cache.save(&cli.geocode_cache)?;
    }

    let updated = geocode::apply_coordinates(rows, &cache);
    info!("Coordinates set on {} rows", updated);
    Ok(())
}

fn seconds(flag: &str, value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .with_context(|| format!("{} must be a finite, non-negative number, got {}", flag, value))
}

/// Source path as written to the CSV, always with `/` separators.
fn display_path(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
