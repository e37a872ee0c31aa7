//! Pure pieces of the matching pipeline: chunk planning, adaptive radii,
//! stitching, invalid-coordinate filtering and jump detection. Everything
//! here is deterministic and tested without the network.

/// Mean-radius haversine, meters.
pub(crate) fn haversine_m(a: [f64; 2], b: [f64; 2]) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_008.8;
    let (lon1, lat1) = (a[0].to_radians(), a[1].to_radians());
    let (lon2, lat2) = (b[0].to_radians(), b[1].to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_M * h.sqrt().asin()
}

/// Slice `n` coordinates into overlapping windows, left to right. The final
/// chunk always ends at `n`.
pub fn plan_chunks(n: usize, chunk_size: usize, overlap: usize) -> Vec<(usize, usize)> {
    assert!(chunk_size > overlap, "chunk size must exceed overlap");
    let mut out = Vec::new();
    if n == 0 {
        return out;
    }
    let mut start = 0;
    loop {
        let end = (start + chunk_size).min(n);
        out.push((start, end));
        if end == n {
            break;
        }
        start = end - overlap;
    }
    out
}

/// Per-coordinate matching radius in meters: 25 for dense urban traces, 50
/// where the spacing or the implied speed says highway.
pub fn adaptive_radii(coords: &[[f64; 2]], timestamps: Option<&[i64]>) -> Vec<u32> {
    const URBAN_RADIUS: u32 = 25;
    const HIGHWAY_RADIUS: u32 = 50;
    const SPARSE_DISTANCE_M: f64 = 100.0;
    const HIGHWAY_SPEED_MPS: f64 = 25.0;

    let mut out = Vec::with_capacity(coords.len());
    for i in 0..coords.len() {
        if i == 0 {
            out.push(URBAN_RADIUS);
            continue;
        }
        let distance = haversine_m(coords[i - 1], coords[i]);
        let mut radius = if distance > SPARSE_DISTANCE_M {
            HIGHWAY_RADIUS
        } else {
            URBAN_RADIUS
        };
        if let Some(ts) = timestamps {
            if let (Some(&prev), Some(&cur)) = (ts.get(i - 1), ts.get(i)) {
                let dt = (cur - prev).abs();
                if dt > 0 && distance / dt as f64 > HIGHWAY_SPEED_MPS {
                    radius = HIGHWAY_RADIUS;
                }
            }
        }
        out.push(radius);
    }
    out
}

/// Append a chunk result, dropping the duplicated shared point at the seam.
pub fn stitch(acc: &mut Vec<[f64; 2]>, mut next: Vec<[f64; 2]>) {
    if let (Some(last), Some(first)) = (acc.last(), next.first()) {
        if last == first {
            next.remove(0);
        }
    }
    acc.append(&mut next);
}

/// Keep only WGS84-valid coordinates, and the timestamps aligned with them.
pub fn filter_invalid(
    coords: &[[f64; 2]],
    timestamps: Option<&[i64]>,
) -> (Vec<[f64; 2]>, Option<Vec<i64>>) {
    let mut kept = Vec::with_capacity(coords.len());
    let mut kept_ts = timestamps.map(|_| Vec::with_capacity(coords.len()));
    for (i, c) in coords.iter().enumerate() {
        let valid = c[0].is_finite()
            && c[1].is_finite()
            && (-180.0..=180.0).contains(&c[0])
            && (-90.0..=90.0).contains(&c[1]);
        if !valid {
            continue;
        }
        kept.push(*c);
        if let (Some(out), Some(ts)) = (kept_ts.as_mut(), timestamps) {
            if let Some(&t) = ts.get(i) {
                out.push(t);
            }
        }
    }
    (kept, kept_ts)
}

/// Indices `i` where the gap from `coords[i]` to `coords[i+1]` exceeds the
/// threshold.
pub fn detect_big_jumps(coords: &[[f64; 2]], threshold_m: f64) -> Vec<usize> {
    let mut out = Vec::new();
    for i in 0..coords.len().saturating_sub(1) {
        if haversine_m(coords[i], coords[i + 1]) > threshold_m {
            out.push(i);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_plan_covers_everything_with_overlap() {
        let chunks = plan_chunks(250, 100, 15);
        assert_eq!(chunks, vec![(0, 100), (85, 185), (170, 250)]);
        // Every coordinate is inside some chunk.
        assert_eq!(chunks.first().unwrap().0, 0);
        assert_eq!(chunks.last().unwrap().1, 250);
        for w in chunks.windows(2) {
            assert!(w[1].0 < w[0].1, "chunks must overlap");
        }
    }

    #[test]
    fn chunk_plan_small_input_is_single_chunk() {
        assert_eq!(plan_chunks(42, 100, 15), vec![(0, 42)]);
        assert_eq!(plan_chunks(100, 100, 15), vec![(0, 100)]);
        assert!(plan_chunks(0, 100, 15).is_empty());
    }

    #[test]
    fn radii_widen_on_sparse_spacing() {
        // Points ~111 m apart along the equator, then a dense pair.
        let coords = [[0.0, 0.0], [0.001, 0.0], [0.00101, 0.0]];
        let radii = adaptive_radii(&coords, None);
        assert_eq!(radii, vec![25, 50, 25]);
    }

    #[test]
    fn radii_widen_on_highway_speed() {
        // ~55 m apart, 1 s apart: 55 m/s is well past highway speed.
        let coords = [[0.0, 0.0], [0.0005, 0.0]];
        let radii = adaptive_radii(&coords, Some(&[0, 1]));
        assert_eq!(radii, vec![25, 50]);
    }

    #[test]
    fn stitch_drops_duplicate_seam_point() {
        let mut acc = vec![[0.0, 0.0], [1.0, 0.0]];
        stitch(&mut acc, vec![[1.0, 0.0], [2.0, 0.0]]);
        assert_eq!(acc, vec![[0.0, 0.0], [1.0, 0.0], [2.0, 0.0]]);

        let mut acc = vec![[0.0, 0.0]];
        stitch(&mut acc, vec![[5.0, 0.0]]);
        assert_eq!(acc, vec![[0.0, 0.0], [5.0, 0.0]]);
    }

    #[test]
    fn filter_keeps_timestamps_aligned() {
        let coords = [[0.0, 0.0], [400.0, 0.0], [1.0, 1.0]];
        let (kept, ts) = filter_invalid(&coords, Some(&[10, 20, 30]));
        assert_eq!(kept, vec![[0.0, 0.0], [1.0, 1.0]]);
        assert_eq!(ts, Some(vec![10, 30]));
    }

    #[test]
    fn jump_detection_flags_wide_gaps() {
        // Second hop is ~555 m.
        let coords = [[0.0, 0.0], [0.0001, 0.0], [0.0051, 0.0], [0.0052, 0.0]];
        assert_eq!(detect_big_jumps(&coords, 200.0), vec![1]);
        assert!(detect_big_jumps(&coords, 1000.0).is_empty());
    }
}
