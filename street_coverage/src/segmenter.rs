//! Splits raw drivable ways into uniformly sized, stably identified
//! segments. Segment ids derive from (area, way, piece index) alone, so
//! re-running segmentation over the same input mints the same ids.

use geo::LineString;
use serde::{Deserialize, Serialize};

use crate::geom::{self, UtmProjector};
use crate::{AreaId, Segment, SegmentId, SegmentState};

/// A drivable way as returned by the street provider, already past the
/// drivable filter. Geometry is `[lon, lat]` WGS84.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawWay {
    pub way_id: i64,
    pub points: Vec<[f64; 2]>,
    pub highway: String,
    pub street_name: String,
    pub oneway: bool,
}

/// Cut every way into pieces near `params.segment_length_m`.
///
/// A way no longer than 1.1x the target is emitted whole. Longer ways are
/// cut at equal arc-length intervals with the piece count chosen so no piece
/// exceeds 1.1x the target; trailing remainders therefore never drop below
/// half the target.
pub fn segment_ways(
    area_id: &AreaId,
    area_display_name: &str,
    ways: &[RawWay],
    target_length_m: f64,
    proj: &UtmProjector,
) -> Vec<Segment> {
    let mut out = Vec::new();
    for way in ways {
        let Some(line) = geom::clean_line(&way.points) else {
            debug!("way {} has no usable geometry, skipping", way.way_id);
            continue;
        };
        let pieces = split_line(&line, target_length_m, proj);
        for (piece_index, piece) in pieces.into_iter().enumerate() {
            let length = geom::linestring_length_m(&piece, proj);
            if length <= 0.0 {
                continue;
            }
            out.push(Segment {
                segment_id: derive_segment_id(area_id, way.way_id, piece_index),
                area_display_name: area_display_name.to_string(),
                geometry: piece,
                highway_tag: way.highway.clone(),
                street_name: way.street_name.clone(),
                segment_length_m: length,
                oneway: way.oneway,
                state: SegmentState::default(),
            });
        }
    }
    out
}

pub fn derive_segment_id(area_id: &AreaId, way_id: i64, piece_index: usize) -> SegmentId {
    SegmentId(format!("{}-{}-{}", area_id, way_id, piece_index))
}

/// Cut one line into equal-arc-length pieces.
fn split_line(line: &LineString<f64>, target_m: f64, proj: &UtmProjector) -> Vec<LineString<f64>> {
    let total = geom::linestring_length_m(line, proj);
    if total <= 0.0 {
        return Vec::new();
    }
    if total <= 1.1 * target_m {
        return vec![line.clone()];
    }
    let pieces = (total / (1.1 * target_m)).ceil().max(2.0) as usize;
    let piece_len = total / pieces as f64;

    // Cumulative projected distance at each vertex.
    let coords: Vec<[f64; 2]> = line.coords().map(|c| [c.x, c.y]).collect();
    let projected: Vec<(f64, f64)> = coords.iter().map(|c| proj.project(c[0], c[1])).collect();
    let mut cumulative = vec![0.0];
    for w in projected.windows(2) {
        let (x0, y0) = w[0];
        let (x1, y1) = w[1];
        let d = ((x1 - x0).powi(2) + (y1 - y0).powi(2)).sqrt();
        cumulative.push(cumulative.last().unwrap() + d);
    }

    let close = |pts: &[[f64; 2]]| {
        LineString::from(pts.iter().map(|c| (c[0], c[1])).collect::<Vec<_>>())
    };

    let eps = 1e-6;
    let mut out = Vec::with_capacity(pieces);
    let mut current: Vec<[f64; 2]> = vec![coords[0]];
    let mut next_cut = piece_len;
    let mut edge = 0;
    while edge < coords.len() - 1 {
        if out.len() + 1 == pieces {
            // The last piece takes whatever remains.
            current.extend_from_slice(&coords[edge + 1..]);
            break;
        }
        let edge_start = cumulative[edge];
        let edge_end = cumulative[edge + 1];
        if next_cut <= edge_end - eps {
            // Cut mid-edge: interpolate the split point along the original
            // lon/lat edge by its projected length fraction.
            let t = ((next_cut - edge_start) / (edge_end - edge_start)).clamp(0.0, 1.0);
            let a = coords[edge];
            let b = coords[edge + 1];
            let cut = [a[0] + t * (b[0] - a[0]), a[1] + t * (b[1] - a[1])];
            current.push(cut);
            out.push(close(&current));
            current = vec![cut];
            next_cut += piece_len;
        } else if next_cut <= edge_end + eps {
            // Cut lands on the vertex itself.
            current.push(coords[edge + 1]);
            out.push(close(&current));
            current = vec![coords[edge + 1]];
            next_cut += piece_len;
            edge += 1;
        } else {
            current.push(coords[edge + 1]);
            edge += 1;
        }
    }
    if current.len() >= 2 {
        out.push(close(&current));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CoverageParams;

    fn straight_way(id: i64, length_deg: f64) -> RawWay {
        RawWay {
            way_id: id,
            points: vec![[0.0, 0.0], [0.0, length_deg]],
            highway: "residential".to_string(),
            street_name: "Main St".to_string(),
            oneway: false,
        }
    }

    fn projector() -> UtmProjector {
        UtmProjector::for_centroid(0.0, 0.0)
    }

    #[test]
    fn short_way_is_one_segment() {
        let params = CoverageParams::default();
        // About 44 m of latitude.
        let way = straight_way(1, 0.0004);
        let segs = segment_ways(
            &AreaId::from_display_name("T1"),
            "T1",
            &[way],
            params.segment_length_m,
            &projector(),
        );
        assert_eq!(segs.len(), 1);
        assert!(segs[0].segment_length_m > 0.0);
        assert_eq!(segs[0].segment_id.0, "t1-1-0");
    }

    #[test]
    fn long_way_pieces_respect_bounds() {
        let params = CoverageParams::default();
        let target = params.segment_length_m;
        // About 1.1 km of latitude.
        let way = straight_way(7, 0.01);
        let segs = segment_ways(
            &AreaId::from_display_name("T1"),
            "T1",
            &[way],
            target,
            &projector(),
        );
        assert!(segs.len() > 1);
        let total: f64 = segs.iter().map(|s| s.segment_length_m).sum();
        assert!((total - 1_105.7).abs() < 15.0, "total {total}");
        for (i, seg) in segs.iter().enumerate() {
            assert!(
                seg.segment_length_m <= 1.1 * target + 0.5,
                "piece {i} too long: {}",
                seg.segment_length_m
            );
            assert!(
                seg.segment_length_m >= 0.5 * target - 0.5,
                "piece {i} too short: {}",
                seg.segment_length_m
            );
        }
    }

    #[test]
    fn segmentation_is_idempotent() {
        let params = CoverageParams::default();
        let way = straight_way(42, 0.01);
        let area = AreaId::from_display_name("Twice");
        let a = segment_ways(&area, "Twice", &[way.clone()], params.segment_length_m, &projector());
        let b = segment_ways(&area, "Twice", &[way], params.segment_length_m, &projector());
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.segment_id, y.segment_id);
            assert_eq!(x.geometry, y.geometry);
        }
    }

    #[test]
    fn metadata_is_stamped_from_parent_way() {
        let params = CoverageParams::default();
        let mut way = straight_way(9, 0.01);
        way.oneway = true;
        way.highway = "primary".to_string();
        let segs = segment_ways(
            &AreaId::from_display_name("T1"),
            "T1",
            &[way],
            params.segment_length_m,
            &projector(),
        );
        for s in &segs {
            assert_eq!(s.highway_tag, "primary");
            assert_eq!(s.street_name, "Main St");
            assert!(s.oneway);
        }
    }

    #[test]
    fn degenerate_way_is_skipped() {
        let params = CoverageParams::default();
        let way = RawWay {
            way_id: 3,
            points: vec![[0.0, 0.0], [0.0, 0.0]],
            highway: "residential".to_string(),
            street_name: String::new(),
            oneway: false,
        };
        let segs = segment_ways(
            &AreaId::from_display_name("T1"),
            "T1",
            &[way],
            params.segment_length_m,
            &projector(),
        );
        assert!(segs.is_empty());
    }
}
