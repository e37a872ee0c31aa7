//! Pulls the raw drivable street graph for a coverage boundary from an
//! Overpass endpoint, applies the drivable filter, and caches the result
//! keyed by (area, boundary hash).

#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::time::Duration;

use geo::MultiPolygon;
use thiserror::Error;

use street_coverage::RawWay;

pub mod cache;
pub mod filter;
pub mod overpass;

pub const DEFAULT_OVERPASS_URL: &str = "https://overpass-api.de/api/interpreter";

/// Street-provider fetches are slow; the subsystem timeout is generous.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Error, Debug)]
pub enum FetchError {
    /// The provider could not be reached or answered with a server error.
    /// Callers may retry with backoff.
    #[error("street provider unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("street provider response unusable: {0}")]
    BadResponse(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug)]
pub struct FetcherConfig {
    pub overpass_url: String,
    pub timeout: Duration,
    /// Cache directory; `None` disables caching.
    pub cache_dir: Option<PathBuf>,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            overpass_url: DEFAULT_OVERPASS_URL.to_string(),
            timeout: DEFAULT_FETCH_TIMEOUT,
            cache_dir: None,
        }
    }
}

pub struct StreetFetcher {
    http: reqwest::Client,
    config: FetcherConfig,
}

impl StreetFetcher {
    pub fn new(config: FetcherConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self { http, config }
    }

    /// Fetch the drivable way set for a boundary. On a cache hit no network
    /// I/O happens at all.
    pub async fn fetch_drivable(
        &self,
        display_name: &str,
        boundary: &MultiPolygon<f64>,
    ) -> Result<Vec<RawWay>, FetchError> {
        let cache_path = self
            .config
            .cache_dir
            .as_ref()
            .map(|dir| cache::cache_path(dir, display_name, boundary));
        if let Some(path) = &cache_path {
            if let Some(ways) = cache::load(path) {
                info!(
                    "street cache hit for {display_name}: {} drivable ways",
                    ways.len()
                );
                return Ok(ways);
            }
        }

        let query = overpass::build_query(boundary, self.config.timeout.as_secs());
        let ways = self.run_query(&query).await?;
        info!(
            "fetched {} drivable ways for {display_name} from {}",
            ways.len(),
            self.config.overpass_url
        );

        if let Some(path) = &cache_path {
            cache::save(path, &ways)?;
        }
        Ok(ways)
    }

    /// Bounding-box fallback for callers without a polygon boundary.
    pub async fn fetch_drivable_bbox(&self, bbox: [f64; 4]) -> Result<Vec<RawWay>, FetchError> {
        let query = overpass::build_bbox_query(bbox, self.config.timeout.as_secs());
        self.run_query(&query).await
    }

    async fn run_query(&self, query: &str) -> Result<Vec<RawWay>, FetchError> {
        debug!("overpass query: {query}");
        let response = self
            .http
            .post(&self.config.overpass_url)
            .form(&[("data", query)])
            .send()
            .await
            .map_err(|e| FetchError::NetworkUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FetchError::NetworkUnavailable(format!(
                "overpass returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(FetchError::BadResponse(format!(
                "overpass returned {status}"
            )));
        }

        let parsed: overpass::OverpassResponse = response
            .json()
            .await
            .map_err(|e| FetchError::BadResponse(e.to_string()))?;
        Ok(overpass::parse_ways(parsed))
    }
}
