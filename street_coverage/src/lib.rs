#[macro_use]
extern crate log;

use chrono::{DateTime, Utc};
use geo::{LineString, MultiPolygon};
use serde::{Deserialize, Serialize};

pub use self::error::CoverageError;
pub use self::segmenter::RawWay;

pub mod artifacts;
pub mod attribution;
pub mod error;
pub mod geom;
pub mod gpx_export;
pub mod progress;
pub mod segmenter;
pub mod solver;
pub mod stats;
pub mod store;
pub mod trips;

const FEET_PER_METER: f64 = 3.280_839_895;

/// Per-area tuning knobs. Both unit systems are persisted for display, but
/// the meter fields are authoritative everywhere in the engine.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CoverageParams {
    pub segment_length_m: f64,
    pub match_buffer_m: f64,
    pub min_match_length_m: f64,
    pub segment_length_ft: f64,
    pub match_buffer_ft: f64,
    pub min_match_length_ft: f64,
}

impl CoverageParams {
    pub fn from_meters(segment_length_m: f64, match_buffer_m: f64, min_match_length_m: f64) -> Self {
        Self {
            segment_length_m,
            match_buffer_m,
            min_match_length_m,
            segment_length_ft: segment_length_m * FEET_PER_METER,
            match_buffer_ft: match_buffer_m * FEET_PER_METER,
            min_match_length_ft: min_match_length_m * FEET_PER_METER,
        }
    }
}

impl Default for CoverageParams {
    fn default() -> Self {
        // 150 ft segments, 25 ft buffer, 15 ft minimum overlap
        Self::from_meters(45.72, 7.62, 4.57)
    }
}

/// Lifecycle of a coverage area. `Queued` through `Calculating` gate a second
/// task from starting on the same area.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaStatus {
    Queued,
    Processing,
    Preprocessing,
    Calculating,
    Completed,
    Error,
    Canceled,
}

impl AreaStatus {
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            AreaStatus::Queued
                | AreaStatus::Processing
                | AreaStatus::Preprocessing
                | AreaStatus::Calculating
        )
    }
}

/// Opaque area identity, derived once from the unique display name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AreaId(pub String);

impl AreaId {
    /// Slug the display name the same way artifact filenames are slugged, so
    /// the id stays filesystem-safe.
    pub fn from_display_name(display_name: &str) -> Self {
        let slug: String = display_name
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        AreaId(slug)
    }
}

impl std::fmt::Display for AreaId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub String);

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-street-type rollup, sorted by total length descending when persisted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreetTypeStats {
    pub highway_tag: String,
    pub length_m: f64,
    pub covered_length_m: f64,
    pub coverage_pct: f64,
    pub count: usize,
    pub covered_count: usize,
    pub undriveable_length_m: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OptimalRoute {
    /// Ordered WGS84 `[lon, lat]` tour, closed or near-closed.
    pub coordinates: Vec<[f64; 2]>,
    pub total_distance_m: f64,
    pub required_distance_m: f64,
    pub deadhead_distance_m: f64,
    pub deadhead_pct: f64,
    pub segment_count: usize,
    pub generated_at: DateTime<Utc>,
    pub start: [f64; 2],
}

/// A named coverage region: boundary, tuning params, lifecycle state and the
/// aggregates the stats pass maintains.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoverageArea {
    pub id: AreaId,
    pub display_name: String,
    pub boundary: MultiPolygon<f64>,
    pub params: CoverageParams,
    pub status: AreaStatus,

    pub total_length_m: f64,
    pub driveable_length_m: f64,
    pub driven_length_m: f64,
    pub coverage_percentage: f64,
    pub total_segments: usize,
    pub driveable_segments: usize,
    pub street_types: Vec<StreetTypeStats>,

    pub streets_geojson_artifact: Option<artifacts::ArtifactId>,
    pub optimal_route: Option<OptimalRoute>,
    pub last_covered_at: Option<DateTime<Utc>>,
    pub needs_stats_update: bool,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl CoverageArea {
    pub fn new(display_name: &str, boundary: MultiPolygon<f64>, params: CoverageParams) -> Self {
        let now = Utc::now();
        Self {
            id: AreaId::from_display_name(display_name),
            display_name: display_name.to_string(),
            boundary,
            params,
            status: AreaStatus::Processing,
            total_length_m: 0.0,
            driveable_length_m: 0.0,
            driven_length_m: 0.0,
            coverage_percentage: 0.0,
            total_segments: 0,
            driveable_segments: 0,
            street_types: Vec::new(),
            streets_geojson_artifact: None,
            optimal_route: None,
            last_covered_at: None,
            needs_stats_update: false,
            last_error: None,
            created_at: now,
            last_updated: now,
        }
    }
}

/// The four manual override actions a user can take on a segment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentMark {
    Driven,
    Undriven,
    Driveable,
    Undriveable,
}

impl std::str::FromStr for SegmentMark {
    type Err = CoverageError;

    fn from_str(s: &str) -> Result<Self, CoverageError> {
        match s {
            "driven" => Ok(SegmentMark::Driven),
            "undriven" => Ok(SegmentMark::Undriven),
            "driveable" => Ok(SegmentMark::Driveable),
            "undriveable" => Ok(SegmentMark::Undriveable),
            other => Err(CoverageError::Validation(format!(
                "unknown segment mark {other:?}"
            ))),
        }
    }
}

/// Mutable coverage state of one segment. All transitions go through
/// `apply_mark` / `mark_driven_auto` so the invariants hold:
/// `undriveable` forces `driven = false`, and a positive manual flag always
/// clears its opposite.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentState {
    pub driven: bool,
    pub undriveable: bool,
    pub manual_driven: bool,
    pub manual_undriven: bool,
    pub manual_undriveable: bool,
    pub manual_driveable: bool,
    pub manual_override: bool,
    pub last_manual_update: Option<DateTime<Utc>>,
    pub first_driven_at: Option<DateTime<Utc>>,
    pub last_driven_at: Option<DateTime<Utc>>,
}

impl SegmentState {
    pub fn apply_mark(&mut self, mark: SegmentMark, now: DateTime<Utc>) {
        match mark {
            SegmentMark::Driven => {
                self.driven = true;
                self.undriveable = false;
                self.manual_driven = true;
                self.manual_undriven = false;
                self.manual_undriveable = false;
                self.manual_driveable = false;
            }
            SegmentMark::Undriven => {
                // Does not change undriveable by itself.
                self.driven = false;
                self.manual_undriven = true;
                self.manual_driven = false;
            }
            SegmentMark::Undriveable => {
                self.undriveable = true;
                self.driven = false;
                self.manual_undriveable = true;
                self.manual_driveable = false;
                self.manual_driven = false;
                self.manual_undriven = false;
            }
            SegmentMark::Driveable => {
                // Does not change driven by itself.
                self.undriveable = false;
                self.manual_driveable = true;
                self.manual_undriveable = false;
            }
        }
        self.manual_override = true;
        self.last_manual_update = Some(now);
    }

    /// Automatic attribution from a matched trip. Refuses to touch segments
    /// that are undriveable or pinned undriven by hand; never clears driven.
    pub fn mark_driven_auto(&mut self, trip_start: DateTime<Utc>) -> bool {
        if self.undriveable || self.manual_undriven {
            return false;
        }
        let flipped = !self.driven;
        self.driven = true;
        self.first_driven_at = Some(match self.first_driven_at {
            Some(t) => t.min(trip_start),
            None => trip_start,
        });
        self.last_driven_at = Some(match self.last_driven_at {
            Some(t) => t.max(trip_start),
            None => trip_start,
        });
        flipped
    }
}

/// One length-bounded piece of a drivable street. Geometry is immutable once
/// issued; re-segmentation mints new ids instead of editing old segments.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: SegmentId,
    /// The owning area's display name. Stored as a lookup key only; the area
    /// itself is never held here.
    pub area_display_name: String,
    pub geometry: LineString<f64>,
    pub highway_tag: String,
    pub street_name: String,
    pub segment_length_m: f64,
    pub oneway: bool,
    #[serde(default)]
    pub state: SegmentState,
}

impl Segment {
    pub fn is_driveable(&self) -> bool {
        !self.state.undriveable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_mirror_feet() {
        let p = CoverageParams::default();
        assert!((p.segment_length_ft - 150.0).abs() < 0.01);
        assert!((p.match_buffer_ft - 25.0).abs() < 0.01);
        assert!((p.min_match_length_ft - 15.0).abs() < 0.01);
    }

    #[test]
    fn undriveable_forces_not_driven() {
        let mut s = SegmentState::default();
        s.apply_mark(SegmentMark::Driven, Utc::now());
        assert!(s.driven);
        s.apply_mark(SegmentMark::Undriveable, Utc::now());
        assert!(s.undriveable);
        assert!(!s.driven);
    }

    #[test]
    fn positive_manual_flag_clears_opposite() {
        let mut s = SegmentState::default();
        s.apply_mark(SegmentMark::Undriven, Utc::now());
        assert!(s.manual_undriven);
        s.apply_mark(SegmentMark::Driven, Utc::now());
        assert!(s.manual_driven);
        assert!(!s.manual_undriven);
        assert!(s.manual_override);
    }

    #[test]
    fn auto_attribution_respects_manual_undriven() {
        let mut s = SegmentState::default();
        s.apply_mark(SegmentMark::Undriven, Utc::now());
        assert!(!s.mark_driven_auto(Utc::now()));
        assert!(!s.driven);
    }

    #[test]
    fn auto_attribution_tracks_first_and_last() {
        let mut s = SegmentState::default();
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::hours(2);
        assert!(s.mark_driven_auto(t1));
        assert!(!s.mark_driven_auto(t0));
        assert_eq!(s.first_driven_at, Some(t0));
        assert_eq!(s.last_driven_at, Some(t1));
    }

    #[test]
    fn area_id_slug() {
        assert_eq!(
            AreaId::from_display_name("Dallas, TX").0,
            "dallas__tx".to_string()
        );
    }
}
