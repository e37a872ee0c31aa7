//! R-tree index over an area's segments, queried with buffered trip
//! envelopes during attribution and with viewport boxes from the query API.

use rstar::{RTree, RTreeObject, AABB};

use crate::Segment;

/// Envelope entry pointing back into the segment table by position.
#[derive(Clone, Debug)]
struct SegmentEnvelope {
    idx: usize,
    env: AABB<[f64; 2]>,
}

impl RTreeObject for SegmentEnvelope {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> AABB<[f64; 2]> {
        self.env
    }
}

pub struct SegmentIndex {
    tree: RTree<SegmentEnvelope>,
    len: usize,
}

impl SegmentIndex {
    pub fn build<'a>(segments: impl Iterator<Item = &'a Segment>) -> Self {
        let mut entries = Vec::new();
        for (idx, seg) in segments.enumerate() {
            let mut min = [f64::INFINITY, f64::INFINITY];
            let mut max = [f64::NEG_INFINITY, f64::NEG_INFINITY];
            for c in seg.geometry.coords() {
                min[0] = min[0].min(c.x);
                min[1] = min[1].min(c.y);
                max[0] = max[0].max(c.x);
                max[1] = max[1].max(c.y);
            }
            if min[0].is_finite() {
                entries.push(SegmentEnvelope {
                    idx,
                    env: AABB::from_corners(min, max),
                });
            }
        }
        let len = entries.len();
        Self {
            tree: RTree::bulk_load(entries),
            len,
        }
    }

    /// Indices of segments whose envelope intersects the query box.
    pub fn query(&self, min: [f64; 2], max: [f64; 2]) -> Vec<usize> {
        let query = AABB::from_corners(min, max);
        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope_intersecting(&query)
            .map(|e| e.idx)
            .collect();
        hits.sort_unstable();
        hits
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
