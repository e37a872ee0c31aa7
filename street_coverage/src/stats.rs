//! Recomputes area aggregates and the per-street-type breakdown from the
//! segment table. Pure fold over segments; the store applies the result.

use std::collections::BTreeMap;

use itertools::Itertools;

use crate::{Segment, StreetTypeStats};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AreaTotals {
    pub total_length_m: f64,
    pub driveable_length_m: f64,
    pub driven_length_m: f64,
    pub coverage_percentage: f64,
    pub total_segments: usize,
    pub driveable_segments: usize,
    pub street_types: Vec<StreetTypeStats>,
}

pub fn aggregate<'a>(segments: impl Iterator<Item = &'a Segment>) -> AreaTotals {
    #[derive(Default)]
    struct Group {
        length: f64,
        covered_length: f64,
        undriveable_length: f64,
        count: usize,
        covered_count: usize,
    }

    let mut totals = AreaTotals::default();
    let mut groups: BTreeMap<String, Group> = BTreeMap::new();

    for seg in segments {
        let length = seg.segment_length_m;
        totals.total_segments += 1;
        totals.total_length_m += length;

        let group = groups.entry(seg.highway_tag.clone()).or_default();
        group.count += 1;
        group.length += length;

        if seg.state.undriveable {
            group.undriveable_length += length;
        } else {
            totals.driveable_segments += 1;
            totals.driveable_length_m += length;
            if seg.state.driven {
                totals.driven_length_m += length;
                group.covered_length += length;
                group.covered_count += 1;
            }
        }
    }

    totals.coverage_percentage = if totals.driveable_length_m > 0.0 {
        totals.driven_length_m / totals.driveable_length_m * 100.0
    } else {
        0.0
    };

    totals.street_types = groups
        .into_iter()
        .map(|(highway_tag, g)| {
            let driveable = g.length - g.undriveable_length;
            StreetTypeStats {
                highway_tag,
                length_m: g.length,
                covered_length_m: g.covered_length,
                coverage_pct: if driveable > 0.0 {
                    g.covered_length / driveable * 100.0
                } else {
                    0.0
                },
                count: g.count,
                covered_count: g.covered_count,
                undriveable_length_m: g.undriveable_length,
            }
        })
        .sorted_by(|a, b| b.length_m.total_cmp(&a.length_m))
        .collect();
    totals
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SegmentId, SegmentMark, SegmentState};
    use geo::LineString;

    fn seg(id: &str, highway: &str, length: f64) -> Segment {
        Segment {
            segment_id: SegmentId(id.to_string()),
            area_display_name: "test".to_string(),
            geometry: LineString::from(vec![(0.0, 0.0), (0.0, 0.001)]),
            highway_tag: highway.to_string(),
            street_name: String::new(),
            segment_length_m: length,
            oneway: false,
            state: SegmentState::default(),
        }
    }

    #[test]
    fn aggregates_driveable_and_driven() {
        let mut a = seg("a", "residential", 100.0);
        a.state.mark_driven_auto(chrono::Utc::now());
        let b = seg("b", "residential", 100.0);
        let mut c = seg("c", "primary", 50.0);
        c.state.apply_mark(SegmentMark::Undriveable, chrono::Utc::now());

        let totals = aggregate([&a, &b, &c].into_iter());
        assert_eq!(totals.total_segments, 3);
        assert_eq!(totals.driveable_segments, 2);
        assert!((totals.total_length_m - 250.0).abs() < 1e-9);
        assert!((totals.driveable_length_m - 200.0).abs() < 1e-9);
        assert!((totals.driven_length_m - 100.0).abs() < 1e-9);
        assert!((totals.coverage_percentage - 50.0).abs() < 1e-9);

        // Sorted by length descending: residential (200) before primary (50).
        assert_eq!(totals.street_types[0].highway_tag, "residential");
        assert_eq!(totals.street_types[0].covered_count, 1);
        assert!((totals.street_types[1].undriveable_length_m - 50.0).abs() < 1e-9);
        assert_eq!(totals.street_types[1].coverage_pct, 0.0);
    }

    #[test]
    fn driveable_identity_holds() {
        let mut c = seg("c", "primary", 50.0);
        c.state.apply_mark(SegmentMark::Undriveable, chrono::Utc::now());
        let d = seg("d", "primary", 70.0);
        let totals = aggregate([&c, &d].into_iter());
        let undriveable: f64 = totals
            .street_types
            .iter()
            .map(|t| t.undriveable_length_m)
            .sum();
        assert!((totals.driveable_length_m - (totals.total_length_m - undriveable)).abs() < 1e-9);
    }

    #[test]
    fn empty_area_is_all_zero() {
        let totals = aggregate(std::iter::empty());
        assert_eq!(totals, AreaTotals::default());
    }

    #[test]
    fn aggregation_is_idempotent() {
        let mut a = seg("a", "residential", 100.0);
        a.state.mark_driven_auto(chrono::Utc::now());
        let once = aggregate([&a].into_iter());
        let twice = aggregate([&a].into_iter());
        assert_eq!(once, twice);
    }

    #[test]
    fn driven_but_undriveable_does_not_count_as_covered() {
        // Can't happen through the state machine, but the fold must still
        // count conservatively if handed such a record.
        let mut a = seg("a", "residential", 100.0);
        a.state.driven = true;
        a.state.undriveable = true;
        let totals = aggregate([&a].into_iter());
        assert_eq!(totals.driven_length_m, 0.0);
    }
}
