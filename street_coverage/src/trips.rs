//! Trip documents as the engine consumes them. Trips arrive from the
//! telematics side already validated except for geometry, which is
//! normalized here: exactly one entry type (a GeoJSON Point or LineString),
//! never a bare string or a coordinate dict.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use geojson::{Geometry, Value};
use serde::{Deserialize, Serialize};

use crate::store::{read_json, write_json_atomic};
use crate::CoverageError;
use crate::geom;

/// Validated trip geometry. The only two shapes the engine accepts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum TripGeometry {
    Point([f64; 2]),
    LineString(Vec<[f64; 2]>),
}

impl TripGeometry {
    pub fn from_geojson(geometry: &Geometry) -> Result<Self, CoverageError> {
        match &geometry.value {
            Value::Point(coords) => {
                if coords.len() != 2 {
                    return Err(CoverageError::Validation(format!(
                        "point must have exactly 2 numbers, got {}",
                        coords.len()
                    )));
                }
                let p = [coords[0], coords[1]];
                geom::validate_coord(p)?;
                Ok(TripGeometry::Point(p))
            }
            Value::LineString(coords) => {
                if coords.len() < 2 {
                    return Err(CoverageError::Validation(
                        "linestring needs at least 2 coordinate pairs".to_string(),
                    ));
                }
                let mut points = Vec::with_capacity(coords.len());
                for c in coords {
                    if c.len() < 2 {
                        return Err(CoverageError::Validation(
                            "coordinate pair must have 2 numbers".to_string(),
                        ));
                    }
                    let p = [c[0], c[1]];
                    geom::validate_coord(p)?;
                    points.push(p);
                }
                Ok(TripGeometry::LineString(points))
            }
            other => Err(CoverageError::Validation(format!(
                "unsupported trip geometry type {}",
                other.type_name()
            ))),
        }
    }

    pub fn to_geojson(&self) -> Geometry {
        match self {
            TripGeometry::Point(p) => Geometry::new(Value::Point(vec![p[0], p[1]])),
            TripGeometry::LineString(pts) => Geometry::new(Value::LineString(
                pts.iter().map(|p| vec![p[0], p[1]]).collect(),
            )),
        }
    }

    pub fn coords(&self) -> Vec<[f64; 2]> {
        match self {
            TripGeometry::Point(p) => vec![*p],
            TripGeometry::LineString(pts) => pts.clone(),
        }
    }
}

/// Outcome of the last map-match attempt on a trip, persisted as
/// `ok`, `skipped:<reason>`, `error:<reason>` or `no-valid-geometry`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchStatus {
    Ok,
    Skipped(String),
    Error(String),
    NoValidGeometry,
}

impl std::fmt::Display for MatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            MatchStatus::Ok => write!(f, "ok"),
            MatchStatus::Skipped(reason) => write!(f, "skipped:{reason}"),
            MatchStatus::Error(reason) => write!(f, "error:{reason}"),
            MatchStatus::NoValidGeometry => write!(f, "no-valid-geometry"),
        }
    }
}

impl std::str::FromStr for MatchStatus {
    type Err = CoverageError;

    fn from_str(s: &str) -> Result<Self, CoverageError> {
        if s == "ok" {
            Ok(MatchStatus::Ok)
        } else if s == "no-valid-geometry" {
            Ok(MatchStatus::NoValidGeometry)
        } else if let Some(reason) = s.strip_prefix("skipped:") {
            Ok(MatchStatus::Skipped(reason.to_string()))
        } else if let Some(reason) = s.strip_prefix("error:") {
            Ok(MatchStatus::Error(reason.to_string()))
        } else {
            Err(CoverageError::Validation(format!(
                "unknown match status {s:?}"
            )))
        }
    }
}

impl Serialize for MatchStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MatchStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trip {
    pub transaction_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub gps: TripGeometry,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_gps: Option<TripGeometry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_status: Option<MatchStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matched_at: Option<DateTime<Utc>>,
}

impl Trip {
    /// Whether the matched geometry is usable for attribution.
    pub fn has_valid_match(&self) -> bool {
        matches!(self.match_status, Some(MatchStatus::Ok)) && self.matched_gps.is_some()
    }

    /// Evenly spread per-coordinate unix timestamps over the trip's time
    /// range, used as matching hints when the device didn't record
    /// per-point times.
    pub fn interpolated_timestamps(&self, n: usize) -> Vec<i64> {
        let start = self.start_time.timestamp();
        let end = self.end_time.timestamp().max(start);
        if n == 0 {
            return Vec::new();
        }
        if n == 1 {
            return vec![start];
        }
        let span = (end - start) as f64;
        (0..n)
            .map(|i| start + (span * i as f64 / (n - 1) as f64).round() as i64)
            .collect()
    }
}

/// File-backed trip collection, keyed by transaction id.
pub struct TripStore {
    path: PathBuf,
    trips: BTreeMap<String, Trip>,
}

impl TripStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CoverageError> {
        std::fs::create_dir_all(root.as_ref())?;
        let path = root.as_ref().join("trips.json");
        let trips = if path.exists() {
            read_json(&path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self { path, trips })
    }

    pub fn insert(&mut self, trip: Trip) -> Result<(), CoverageError> {
        self.trips.insert(trip.transaction_id.clone(), trip);
        self.commit()
    }

    pub fn get(&self, transaction_id: &str) -> Option<&Trip> {
        self.trips.get(transaction_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Trip> {
        self.trips.values()
    }

    pub fn len(&self) -> usize {
        self.trips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trips.is_empty()
    }

    /// Trips that still need a map-match pass.
    pub fn unmatched(&self) -> Vec<&Trip> {
        self.trips
            .values()
            .filter(|t| t.match_status.is_none())
            .collect()
    }

    /// Record a match outcome on a trip.
    pub fn set_match_result(
        &mut self,
        transaction_id: &str,
        matched_gps: Option<TripGeometry>,
        status: MatchStatus,
        matched_at: DateTime<Utc>,
    ) -> Result<(), CoverageError> {
        let trip = self
            .trips
            .get_mut(transaction_id)
            .ok_or_else(|| CoverageError::Validation(format!("unknown trip {transaction_id:?}")))?;
        trip.matched_gps = matched_gps;
        trip.match_status = Some(status);
        trip.matched_at = Some(matched_at);
        self.commit()
    }

    /// Trips with a valid match, ordered by `matched_at` ascending so
    /// attribution sees them in completion order.
    pub fn matched_in_order(&self, after: Option<DateTime<Utc>>) -> Vec<&Trip> {
        let mut out: Vec<&Trip> = self
            .trips
            .values()
            .filter(|t| t.has_valid_match())
            .filter(|t| match (after, t.matched_at) {
                (Some(cutoff), Some(at)) => at > cutoff,
                (Some(_), None) => false,
                (None, _) => true,
            })
            .collect();
        out.sort_by_key(|t| t.matched_at);
        out
    }

    fn commit(&self) -> Result<(), CoverageError> {
        write_json_atomic(&self.path, &self.trips)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trip(id: &str) -> Trip {
        let start = Utc::now();
        Trip {
            transaction_id: id.to_string(),
            start_time: start,
            end_time: start + chrono::Duration::minutes(10),
            gps: TripGeometry::LineString(vec![[0.0, 0.0], [0.0, 0.001]]),
            matched_gps: None,
            match_status: None,
            matched_at: None,
        }
    }

    #[test]
    fn geometry_validation_rejects_bad_shapes() {
        let bad = Geometry::new(Value::LineString(vec![vec![0.0, 0.0]]));
        assert!(TripGeometry::from_geojson(&bad).is_err());

        let out_of_range = Geometry::new(Value::Point(vec![200.0, 0.0]));
        assert!(TripGeometry::from_geojson(&out_of_range).is_err());

        let polygon = Geometry::new(Value::Polygon(vec![]));
        assert!(TripGeometry::from_geojson(&polygon).is_err());

        let ok = Geometry::new(Value::LineString(vec![vec![0.0, 0.0], vec![0.0, 1.0]]));
        assert!(TripGeometry::from_geojson(&ok).is_ok());
    }

    #[test]
    fn match_status_wire_format_round_trips() {
        for status in [
            MatchStatus::Ok,
            MatchStatus::Skipped("point".to_string()),
            MatchStatus::Error("chunk 2 of 3 failed".to_string()),
            MatchStatus::NoValidGeometry,
        ] {
            let text = status.to_string();
            assert_eq!(text.parse::<MatchStatus>().unwrap(), status);
        }
        assert_eq!(MatchStatus::Ok.to_string(), "ok");
        assert_eq!(
            MatchStatus::Skipped("point".to_string()).to_string(),
            "skipped:point"
        );
    }

    #[test]
    fn interpolated_timestamps_span_the_trip() {
        let t = trip("a");
        let ts = t.interpolated_timestamps(5);
        assert_eq!(ts.len(), 5);
        assert_eq!(ts[0], t.start_time.timestamp());
        assert_eq!(ts[4], t.end_time.timestamp());
        assert!(ts.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn matched_in_order_sorts_and_cuts() {
        let dir = std::env::temp_dir().join(format!("trip_store_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut store = TripStore::open(&dir).unwrap();

        let base = Utc::now();
        for (id, offset) in [("b", 2), ("a", 1), ("c", 3)] {
            let mut t = trip(id);
            t.matched_gps = Some(t.gps.clone());
            t.match_status = Some(MatchStatus::Ok);
            t.matched_at = Some(base + chrono::Duration::minutes(offset));
            store.insert(t).unwrap();
        }
        let mut skipped = trip("d");
        skipped.match_status = Some(MatchStatus::Skipped("point".to_string()));
        store.insert(skipped).unwrap();

        let all = store.matched_in_order(None);
        let ids: Vec<&str> = all.iter().map(|t| t.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let later = store.matched_in_order(Some(base + chrono::Duration::minutes(1)));
        let ids: Vec<&str> = later.iter().map(|t| t.transaction_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }
}
