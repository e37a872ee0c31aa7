//! Client for an external map-matching service (Mapbox-style API): chunked,
//! rate-limited POST requests with per-point radii and timestamp hints,
//! recursive subdivision of failing chunks, seam-deduplicating stitching and
//! a post-match repair pass over implausible jumps.

#[macro_use]
extern crate log;

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Semaphore;

pub mod chunking;
pub mod limiter;
pub mod retry;

use limiter::TokenBucket;
use retry::{Action, ApiEvent};

pub const DEFAULT_MATCH_URL: &str = "https://api.mapbox.com/matching/v5/mapbox/driving";

#[derive(Error, Debug)]
pub enum MatchError {
    #[error("rate limit exceeded after {0} attempts")]
    RateLimitExceeded(u32),

    #[error("matching provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("matching provider rejected the request: {0}")]
    ClientError(String),

    #[error("match canceled")]
    Canceled,
}

#[derive(Clone, Debug)]
pub struct MatcherConfig {
    pub base_url: String,
    pub access_token: String,
    /// Conservative share of the provider's requests-per-minute budget.
    pub rate_per_minute: u32,
    /// Concurrent in-flight requests, process wide.
    pub concurrency: usize,
    pub chunk_size: usize,
    pub overlap: usize,
    /// Maximum recursive subdivision depth for a failing chunk.
    pub max_retries: usize,
    /// Chunks at or below this size are not subdivided further.
    pub min_sub_chunk: usize,
    pub jump_threshold_m: f64,
    pub request_timeout: Duration,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_MATCH_URL.to_string(),
            access_token: String::new(),
            rate_per_minute: 280,
            concurrency: 10,
            chunk_size: 100,
            overlap: 15,
            max_retries: 3,
            min_sub_chunk: 20,
            jump_threshold_m: 200.0,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Matched geometry, already validated.
#[derive(Clone, Debug, PartialEq)]
pub enum MatchedGeometry {
    Point([f64; 2]),
    Line(Vec<[f64; 2]>),
}

#[derive(Clone, Debug, PartialEq)]
pub enum MatchOutcome {
    Matched(MatchedGeometry),
    Skipped(&'static str),
    NoValidGeometry,
}

#[derive(Serialize)]
struct MatchRequestBody {
    coordinates: Vec<Vec<f64>>,
    radiuses: Vec<u32>,
}

#[derive(Deserialize)]
struct MatchResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    matchings: Vec<Matching>,
}

#[derive(Deserialize)]
struct Matching {
    geometry: MatchGeometry,
}

#[derive(Deserialize)]
struct MatchGeometry {
    #[serde(rename = "type")]
    #[allow(dead_code)]
    kind: String,
    coordinates: Vec<[f64; 2]>,
}

pub struct MatchClient {
    http: reqwest::Client,
    config: MatcherConfig,
    limiter: TokenBucket,
    semaphore: Semaphore,
}

impl MatchClient {
    pub fn new(config: MatcherConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .unwrap_or_default();
        let limiter = TokenBucket::new(config.rate_per_minute, Duration::from_secs(60));
        let semaphore = Semaphore::new(config.concurrency.max(1));
        Self {
            http,
            config,
            limiter,
            semaphore,
        }
    }

    pub fn config(&self) -> &MatcherConfig {
        &self.config
    }

    /// Match a raw GPS trace against the road network. Cancellation is
    /// cooperative and observed between chunks.
    pub async fn match_trace(
        &self,
        coords: &[[f64; 2]],
        timestamps: Option<&[i64]>,
        cancel: &AtomicBool,
    ) -> Result<MatchOutcome, MatchError> {
        if coords.len() < 2 {
            return Ok(MatchOutcome::Skipped("insufficient-points"));
        }

        let chunks = chunking::plan_chunks(coords.len(), self.config.chunk_size, self.config.overlap);
        info!(
            "matching {} coords in {} chunks (chunk_size={}, overlap={})",
            coords.len(),
            chunks.len(),
            self.config.chunk_size,
            self.config.overlap
        );

        let mut stitched: Vec<[f64; 2]> = Vec::new();
        for (index, (start, end)) in chunks.iter().enumerate() {
            if cancel.load(Ordering::Relaxed) {
                return Err(MatchError::Canceled);
            }
            let chunk = coords[*start..*end].to_vec();
            let chunk_ts = timestamps
                .filter(|ts| ts.len() == coords.len())
                .map(|ts| ts[*start..*end].to_vec());
            debug!(
                "matching chunk {}/{} with {} coords",
                index + 1,
                chunks.len(),
                chunk.len()
            );
            let matched = self
                .match_chunk(chunk, chunk_ts, 0, true)
                .await
                .map_err(|e| {
                    error!("chunk {}/{} failed: {e}", index + 1, chunks.len());
                    e
                })?;
            chunking::stitch(&mut stitched, matched);
        }
        debug!("stitched {} matched points", stitched.len());

        self.repair_jumps(&mut stitched, cancel).await?;

        Ok(validate_output(&stitched))
    }

    /// Re-match small windows around implausible gaps, up to two passes.
    async fn repair_jumps(
        &self,
        coords: &mut Vec<[f64; 2]>,
        cancel: &AtomicBool,
    ) -> Result<(), MatchError> {
        const MAX_PASSES: usize = 2;
        for pass in 0..MAX_PASSES {
            let jumps = chunking::detect_big_jumps(coords, self.config.jump_threshold_m);
            if jumps.is_empty() {
                break;
            }
            info!("found {} suspicious jump(s) on pass {}", jumps.len(), pass + 1);
            let mut fixes = 0usize;
            let mut offset: isize = 0;
            for jump in jumps {
                if cancel.load(Ordering::Relaxed) {
                    return Err(MatchError::Canceled);
                }
                let i = jump as isize + offset;
                if i < 1 || i as usize >= coords.len().saturating_sub(1) {
                    continue;
                }
                let start = (i - 1) as usize;
                let end = ((i + 2) as usize).min(coords.len());
                let window = coords[start..end].to_vec();
                if window.len() < 2 {
                    continue;
                }
                match self.match_chunk(window, None, 0, true).await {
                    Ok(local) if local.len() >= 2 => {
                        let replaced = end - start;
                        coords.splice(start..end, local.iter().copied());
                        offset += local.len() as isize - replaced as isize;
                        fixes += 1;
                    }
                    Ok(_) | Err(_) => {
                        debug!("local re-match around index {i} failed, leaving as is");
                    }
                }
            }
            if fixes == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Match one chunk, recursively halving on failure while depth and size
    /// allow. `allow_refilter` grants one coordinate-filtering retry per
    /// chunk when the provider complains about invalid coordinates.
    fn match_chunk(
        &self,
        coords: Vec<[f64; 2]>,
        timestamps: Option<Vec<i64>>,
        depth: usize,
        allow_refilter: bool,
    ) -> BoxFuture<'_, Result<Vec<[f64; 2]>, MatchError>> {
        async move {
            if coords.len() < 2 {
                return Ok(Vec::new());
            }
            if coords.len() > self.config.chunk_size {
                error!("match_chunk received {} coords unexpectedly", coords.len());
                return Ok(Vec::new());
            }

            let failure = match self.call_api(&coords, timestamps.as_deref()).await {
                Ok(matched) => return Ok(matched),
                Err(e) => e,
            };

            if allow_refilter {
                if let MatchError::ClientError(message) = &failure {
                    if message.to_lowercase().contains("invalid coordinates") {
                        let (kept, kept_ts) =
                            chunking::filter_invalid(&coords, timestamps.as_deref());
                        if kept.len() >= 2 && kept.len() < coords.len() {
                            info!("retrying with {} filtered coordinates", kept.len());
                            return self.match_chunk(kept, kept_ts, depth, false).await;
                        }
                    }
                }
            }

            if depth < self.config.max_retries && coords.len() > self.config.min_sub_chunk {
                let mid = coords.len() / 2;
                info!(
                    "splitting failed chunk of {} at depth {depth} into ({mid}, {})",
                    coords.len(),
                    coords.len() - mid
                );
                let (first_ts, second_ts) = match &timestamps {
                    Some(ts) => (Some(ts[..mid].to_vec()), Some(ts[mid..].to_vec())),
                    None => (None, None),
                };
                let first = self
                    .match_chunk(coords[..mid].to_vec(), first_ts, depth + 1, true)
                    .await?;
                let mut out = first;
                let second = self
                    .match_chunk(coords[mid..].to_vec(), second_ts, depth + 1, true)
                    .await?;
                chunking::stitch(&mut out, second);
                return Ok(out);
            }

            error!(
                "chunk of {} coords failed at depth {depth}, giving up",
                coords.len()
            );
            Err(failure)
        }
        .boxed()
    }

    /// One API call under the process-wide semaphore, with the retry policy
    /// applied around it.
    async fn call_api(
        &self,
        coords: &[[f64; 2]],
        timestamps: Option<&[i64]>,
    ) -> Result<Vec<[f64; 2]>, MatchError> {
        let radiuses = chunking::adaptive_radii(coords, timestamps);
        let coordinates: Vec<Vec<f64>> = coords
            .iter()
            .enumerate()
            .map(|(i, c)| {
                let mut entry = vec![c[0], c[1]];
                if let Some(ts) = timestamps {
                    if let Some(&t) = ts.get(i) {
                        entry.push(t as f64);
                    }
                }
                entry
            })
            .collect();
        let body = MatchRequestBody {
            coordinates,
            radiuses,
        };

        let _permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| MatchError::Canceled)?;

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.limiter.acquire().await;
            let event = match self.send_once(&body).await {
                Ok(matched) => return Ok(matched),
                Err(event) => event,
            };
            match retry::next_action(event, attempt, retry::MAX_ATTEMPTS) {
                Action::Accept => continue,
                Action::RetryAfter(wait) => {
                    warn!(
                        "match attempt {attempt}/{} failed, retrying in {:.1}s",
                        retry::MAX_ATTEMPTS,
                        wait.as_secs_f64()
                    );
                    tokio::time::sleep(wait).await;
                }
                Action::Refilter => {
                    // Surfaced to the chunk matcher, which owns the filter
                    // retry.
                    return Err(MatchError::ClientError(
                        "invalid coordinates".to_string(),
                    ));
                }
                Action::Fail(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, body: &MatchRequestBody) -> Result<Vec<[f64; 2]>, ApiEvent> {
        let response = self
            .http
            .post(&self.config.base_url)
            .query(&[
                ("access_token", self.config.access_token.as_str()),
                ("geometries", "geojson"),
                ("overview", "full"),
                ("tidy", "true"),
                ("steps", "false"),
            ])
            .json(body)
            .send()
            .await
            .map_err(|e| ApiEvent::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<f64>().ok());
            return Err(ApiEvent::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Err(ApiEvent::ServerError(status.as_u16()));
        }
        if status.is_client_error() {
            let message = response.text().await.unwrap_or_default();
            return Err(ApiEvent::ClientError {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: MatchResponse = response
            .json()
            .await
            .map_err(|e| ApiEvent::Transport(format!("unparseable response: {e}")))?;
        if parsed.code == "Ok" {
            if let Some(matching) = parsed.matchings.into_iter().next() {
                return Ok(matching.geometry.coordinates);
            }
        }
        Err(ApiEvent::ClientError {
            status: status.as_u16(),
            message: parsed
                .message
                .unwrap_or_else(|| format!("match response code {}", parsed.code)),
        })
    }
}

/// Final validation of a stitched result: at least two distinct WGS84-valid
/// points make a LineString, identical points collapse to a Point, anything
/// less is unusable.
pub fn validate_output(coords: &[[f64; 2]]) -> MatchOutcome {
    let (valid, _) = chunking::filter_invalid(coords, None);
    if valid.is_empty() {
        return MatchOutcome::NoValidGeometry;
    }
    let first = valid[0];
    if valid.iter().all(|c| *c == first) {
        return MatchOutcome::Matched(MatchedGeometry::Point(first));
    }
    MatchOutcome::Matched(MatchedGeometry::Line(valid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_validation_classifies_shapes() {
        assert_eq!(validate_output(&[]), MatchOutcome::NoValidGeometry);
        assert_eq!(
            validate_output(&[[400.0, 0.0], [f64::NAN, 1.0]]),
            MatchOutcome::NoValidGeometry
        );
        assert_eq!(
            validate_output(&[[1.0, 1.0], [1.0, 1.0]]),
            MatchOutcome::Matched(MatchedGeometry::Point([1.0, 1.0]))
        );
        assert_eq!(
            validate_output(&[[1.0, 1.0], [2.0, 2.0]]),
            MatchOutcome::Matched(MatchedGeometry::Line(vec![[1.0, 1.0], [2.0, 2.0]]))
        );
        // Invalid entries are dropped, not fatal, as long as a line remains.
        assert_eq!(
            validate_output(&[[1.0, 1.0], [400.0, 0.0], [2.0, 2.0]]),
            MatchOutcome::Matched(MatchedGeometry::Line(vec![[1.0, 1.0], [2.0, 2.0]]))
        );
    }

    #[tokio::test]
    async fn short_input_is_skipped_without_io() {
        let client = MatchClient::new(MatcherConfig::default());
        let cancel = AtomicBool::new(false);
        let outcome = client
            .match_trace(&[[0.0, 0.0]], None, &cancel)
            .await
            .unwrap();
        assert_eq!(outcome, MatchOutcome::Skipped("insufficient-points"));
    }

    #[tokio::test]
    async fn cancellation_is_observed_before_first_chunk() {
        let client = MatchClient::new(MatcherConfig::default());
        let cancel = AtomicBool::new(true);
        let result = client
            .match_trace(&[[0.0, 0.0], [0.001, 0.0]], None, &cancel)
            .await;
        assert!(matches!(result, Err(MatchError::Canceled)));
    }
}
