//! Error kinds surfaced by the coverage engine. Callers branch on these; the
//! orchestration layer decides which ones map to retries, cancellation, or a
//! terminal task state.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("coordinate out of WGS84 range: [{lon}, {lat}]")]
    InvalidCoordinate { lon: f64, lat: f64 },

    #[error("coverage area {0:?} not found")]
    AreaNotFound(String),

    #[error("street segment {0:?} not found")]
    SegmentNotFound(String),

    #[error("inconsistent state: {0}")]
    InconsistentState(String),

    #[error("coverage for area {0:?} is not complete")]
    CoverageIncomplete(String),

    #[error("a task is already running for area {0:?}")]
    ResourceBusy(String),

    #[error("area {0:?} has no undriven segments")]
    NoUndrivenSegments(String),

    #[error("street graph is disconnected and bridging failed")]
    Disconnected,

    #[error("odd-node matching could not be completed")]
    MatchingFailed,

    #[error("task canceled")]
    Canceled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}
