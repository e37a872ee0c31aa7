//! GPX 1.1 export of the optimal completion route: one track, one
//! `<trkseg>`, one `<trkpt>` per tour coordinate.

use geo::Point;
use gpx::{Gpx, GpxVersion, Track, TrackSegment, Waypoint};

use crate::{CoverageError, OptimalRoute};

pub fn route_to_gpx(route: &OptimalRoute, name: &str) -> Result<Vec<u8>, CoverageError> {
    let mut segment = TrackSegment::new();
    for coord in &route.coordinates {
        segment
            .points
            .push(Waypoint::new(Point::new(coord[0], coord[1])));
    }

    let mut track = Track::new();
    track.name = Some(name.to_string());
    track.description = Some(format!(
        "{:.1} km total, {:.1} km required, {:.1}% deadhead",
        route.total_distance_m / 1000.0,
        route.required_distance_m / 1000.0,
        route.deadhead_pct,
    ));
    track.segments.push(segment);

    let gpx = Gpx {
        version: GpxVersion::Gpx11,
        creator: Some("street_coverage".to_string()),
        tracks: vec![track],
        ..Default::default()
    };

    let mut out = Vec::new();
    gpx::write(&gpx, &mut out)
        .map_err(|e| CoverageError::Validation(format!("gpx serialization failed: {e}")))?;
    Ok(out)
}

/// Parse track coordinates back out of a GPX document. Used to verify the
/// export round-trips and by callers that re-import tours.
pub fn gpx_track_coords(bytes: &[u8]) -> Result<Vec<[f64; 2]>, CoverageError> {
    let gpx = gpx::read(std::io::Cursor::new(bytes))
        .map_err(|e| CoverageError::Validation(format!("gpx parse failed: {e}")))?;
    let mut coords = Vec::new();
    for track in &gpx.tracks {
        for segment in &track.segments {
            for point in &segment.points {
                let p = point.point();
                coords.push([p.x(), p.y()]);
            }
        }
    }
    Ok(coords)
}
