use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

pub const NOMINATIM_SEARCH_URL: &str = "https://nominatim.openstreetmap.org/search";

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum GeocodeError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected geocoder response: {0}")]
    Response(String),
}

/// A remote service that turns a free-text place into at most one best match.
#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError>;
}

/// Nominatim (OpenStreetMap) search client.
pub struct NominatimClient {
    http: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct SearchHit {
    lat: String,
    lon: String,
}

impl NominatimClient {
    pub fn new(endpoint: &str, user_agent: &str, timeout: Duration) -> Result<Self, GeocodeError> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimClient {
    async fn lookup(&self, query: &str) -> Result<Option<Coordinates>, GeocodeError> {
        let hits: Vec<SearchHit> = self
            .http
            .get(&self.endpoint)
            .query(&[("format", "jsonv2"), ("limit", "1"), ("q", query)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        debug!("{} hit(s) for {:?}", hits.len(), query);
        best_match(hits)
    }
}

fn best_match(hits: Vec<SearchHit>) -> Result<Option<Coordinates>, GeocodeError> {
    let Some(hit) = hits.into_iter().next() else {
        return Ok(None);
    };
    let parse = |raw: &str| {
        raw.trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| GeocodeError::Response(format!("invalid coordinate {:?}", raw)))
    };
    Ok(Some(Coordinates {
        lat: parse(&hit.lat)?,
        lon: parse(&hit.lon)?,
    }))
}
