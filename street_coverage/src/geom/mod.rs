//! Geometry primitives shared by the whole engine: coordinate validation,
//! great-circle and projected distances, buffered coverage tests, and the
//! spatial index over an area's segments.

use geo::{Contains, Coord, Intersects, LineString, MultiPolygon, Point};

use crate::CoverageError;

pub mod index;
pub mod utm;

pub use index::SegmentIndex;
pub use utm::{utm_zone_for, UtmProjector};

/// WGS84 mean radius, meters.
const EARTH_RADIUS_M: f64 = 6_371_008.8;

/// Step used when sampling a segment against a buffered trace. Fine enough
/// that the minimum-match threshold (≈4.6 m) can't be stepped over.
const COVERAGE_SAMPLE_STEP_M: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DistanceUnit {
    Meters,
    Kilometers,
    Miles,
}

pub fn validate_coord(coord: [f64; 2]) -> Result<(), CoverageError> {
    let [lon, lat] = coord;
    if !lon.is_finite() || !lat.is_finite() || !(-180.0..=180.0).contains(&lon) || !(-90.0..=90.0).contains(&lat)
    {
        return Err(CoverageError::InvalidCoordinate { lon, lat });
    }
    Ok(())
}

pub fn is_valid_coord(coord: [f64; 2]) -> bool {
    validate_coord(coord).is_ok()
}

/// Great-circle distance between two `[lon, lat]` points.
pub fn haversine(a: [f64; 2], b: [f64; 2], unit: DistanceUnit) -> f64 {
    let meters = haversine_m(a, b);
    match unit {
        DistanceUnit::Meters => meters,
        DistanceUnit::Kilometers => meters / 1000.0,
        DistanceUnit::Miles => meters / 1609.344,
    }
}

pub fn haversine_m(a: [f64; 2], b: [f64; 2]) -> f64 {
    let (lon1, lat1) = (a[0].to_radians(), a[1].to_radians());
    let (lon2, lat2) = (b[0].to_radians(), b[1].to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Length of a WGS84 linestring in meters, summed edge-by-edge in projected
/// space.
pub fn linestring_length_m(line: &LineString<f64>, proj: &UtmProjector) -> f64 {
    let pts: Vec<(f64, f64)> = line.coords().map(|c| proj.project(c.x, c.y)).collect();
    pts.windows(2)
        .map(|w| {
            let (x0, y0) = w[0];
            let (x1, y1) = w[1];
            ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt()
        })
        .sum()
}

/// Drop consecutive duplicate points and reject anything that doesn't leave
/// a real line. This is the zero-width-buffer repair of the source system:
/// degenerate inputs are cleaned or discarded, never passed through.
pub fn clean_line(points: &[[f64; 2]]) -> Option<LineString<f64>> {
    let mut kept: Vec<Coord<f64>> = Vec::with_capacity(points.len());
    for p in points {
        if !is_valid_coord(*p) {
            continue;
        }
        let c = Coord { x: p[0], y: p[1] };
        if kept.last() != Some(&c) {
            kept.push(c);
        }
    }
    if kept.len() < 2 {
        return None;
    }
    Some(LineString::new(kept))
}

pub fn point_in_boundary(point: [f64; 2], boundary: &MultiPolygon<f64>) -> bool {
    boundary.contains(&Point::new(point[0], point[1]))
}

pub fn line_intersects_boundary(line: &LineString<f64>, boundary: &MultiPolygon<f64>) -> bool {
    boundary
        .0
        .iter()
        .any(|polygon| polygon.intersects(line))
}

/// Minimum planar distance from a projected point to a projected polyline.
pub fn point_to_polyline_m(point: (f64, f64), polyline: &[(f64, f64)]) -> f64 {
    let mut best = f64::INFINITY;
    if polyline.len() == 1 {
        let (x, y) = polyline[0];
        return ((point.0 - x).powi(2) + (point.1 - y).powi(2)).sqrt();
    }
    for w in polyline.windows(2) {
        best = best.min(point_to_segment_m(point, w[0], w[1]));
    }
    best
}

fn point_to_segment_m(p: (f64, f64), a: (f64, f64), b: (f64, f64)) -> f64 {
    let (px, py) = p;
    let (ax, ay) = a;
    let (bx, by) = b;
    let dx = bx - ax;
    let dy = by - ay;
    let len2 = dx * dx + dy * dy;
    let t = if len2 == 0.0 {
        0.0
    } else {
        (((px - ax) * dx + (py - ay) * dy) / len2).clamp(0.0, 1.0)
    };
    let cx = ax + t * dx;
    let cy = ay + t * dy;
    ((px - cx).powi(2) + (py - cy).powi(2)).sqrt()
}

/// Project a WGS84 line to planar meters.
pub fn project_line(line: &LineString<f64>, proj: &UtmProjector) -> Vec<(f64, f64)> {
    line.coords().map(|c| proj.project(c.x, c.y)).collect()
}

/// How much of `segment` lies within `buffer_m` of `trace`, in meters.
///
/// Walks the segment at a fixed step and measures each sample against the
/// trace, which is equivalent to intersecting the segment with the trace's
/// buffer without ever materializing the buffer polygon.
pub fn covered_length_m(
    segment: &[(f64, f64)],
    trace: &[(f64, f64)],
    buffer_m: f64,
) -> f64 {
    if segment.len() < 2 || trace.is_empty() {
        return 0.0;
    }
    let mut covered = 0.0;
    for w in segment.windows(2) {
        let (x0, y0) = w[0];
        let (x1, y1) = w[1];
        let edge_len = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
        if edge_len == 0.0 {
            continue;
        }
        let steps = (edge_len / COVERAGE_SAMPLE_STEP_M).ceil().max(1.0) as usize;
        let step_len = edge_len / steps as f64;
        for s in 0..steps {
            // Sample at the midpoint of each sub-step.
            let t = (s as f64 + 0.5) / steps as f64;
            let sample = (x0 + t * (x1 - x0), y0 + t * (y1 - y0));
            if point_to_polyline_m(sample, trace) <= buffer_m {
                covered += step_len;
            }
        }
    }
    covered
}

/// Expand a lon/lat envelope by a distance in meters, converting through the
/// local metric distortion at that latitude.
pub fn expand_envelope_deg(
    min: [f64; 2],
    max: [f64; 2],
    meters: f64,
) -> ([f64; 2], [f64; 2]) {
    let lat = ((min[1] + max[1]) / 2.0).to_radians();
    let dlat = meters / 111_320.0;
    let dlon = meters / (111_320.0 * lat.cos().abs().max(0.01));
    (
        [min[0] - dlon, min[1] - dlat],
        [max[0] + dlon, max[1] + dlat],
    )
}

/// Axis-aligned envelope of a coordinate list.
pub fn envelope(points: &[[f64; 2]]) -> Option<([f64; 2], [f64; 2])> {
    let first = points.first()?;
    let mut min = *first;
    let mut max = *first;
    for p in points {
        min[0] = min[0].min(p[0]);
        min[1] = min[1].min(p[1]);
        max[0] = max[0].max(p[0]);
        max[1] = max[1].max(p[1]);
    }
    Some((min, max))
}

/// Centroid of a boundary, used to pick the working UTM zone.
pub fn boundary_centroid(boundary: &MultiPolygon<f64>) -> Option<[f64; 2]> {
    use geo::Centroid;
    boundary.centroid().map(|p| [p.x(), p.y()])
}
