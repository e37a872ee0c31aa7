//! Marks segments driven from matched trip geometry.
//!
//! Candidates come from the area's spatial index queried with the buffered
//! trace envelope; the precise test measures how much of each candidate lies
//! within the match buffer of the trace, in projected meters. Driven state
//! is monotonically additive here: only a manual override can clear it.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::geom::{self, UtmProjector};
use crate::store::NetworkStore;
use crate::trips::{TripGeometry, TripStore};
use crate::{AreaId, CoverageError, SegmentId};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct AttributionOutcome {
    pub trips_processed: usize,
    pub trips_skipped: usize,
    pub segments_flipped: usize,
    pub last_covered_at: Option<DateTime<Utc>>,
}

/// Rebuild driven state over every valid matched trip intersecting the
/// area's boundary.
pub fn full_calc(
    store: &mut NetworkStore,
    trips: &TripStore,
    area_id: &AreaId,
    on_progress: impl FnMut(usize, usize),
    cancel: impl Fn() -> bool,
) -> Result<AttributionOutcome, CoverageError> {
    run(store, trips, area_id, None, on_progress, cancel)
}

/// Attribute only trips matched after the area's `last_covered_at`.
/// Previously driven segments are never cleared by this pass.
pub fn incremental_calc(
    store: &mut NetworkStore,
    trips: &TripStore,
    area_id: &AreaId,
    on_progress: impl FnMut(usize, usize),
    cancel: impl Fn() -> bool,
) -> Result<AttributionOutcome, CoverageError> {
    let since = store.area(area_id)?.last_covered_at;
    run(store, trips, area_id, since, on_progress, cancel)
}

fn run(
    store: &mut NetworkStore,
    trips: &TripStore,
    area_id: &AreaId,
    since: Option<DateTime<Utc>>,
    mut on_progress: impl FnMut(usize, usize),
    cancel: impl Fn() -> bool,
) -> Result<AttributionOutcome, CoverageError> {
    let mut outcome = AttributionOutcome::default();
    let mut updates: Vec<(SegmentId, DateTime<Utc>)> = Vec::new();

    {
        let area = store.area(area_id)?;
        let boundary = &area.boundary;
        let buffer_m = area.params.match_buffer_m;
        let min_match_m = area.params.min_match_length_m;

        let Some(centroid) = geom::boundary_centroid(boundary) else {
            return Err(CoverageError::Validation(format!(
                "area {} has an empty boundary",
                area.display_name
            )));
        };
        let proj = UtmProjector::for_centroid(centroid[0], centroid[1]);

        let segments = store.segments(area_id)?;
        let index = store.segment_index(area_id)?;
        let mut projected_segments: HashMap<usize, Vec<(f64, f64)>> = HashMap::new();

        let candidates = trips.matched_in_order(since);
        let total = candidates.len();

        for (i, trip) in candidates.into_iter().enumerate() {
            if cancel() {
                return Err(CoverageError::Canceled);
            }
            on_progress(i + 1, total);

            let matched = trip.matched_gps.as_ref().unwrap();
            match matched {
                TripGeometry::LineString(points) => {
                    let Some(line) = geom::clean_line(points) else {
                        warn!(
                            "trip {} has a degenerate matched linestring, skipping",
                            trip.transaction_id
                        );
                        outcome.trips_skipped += 1;
                        continue;
                    };
                    if !geom::line_intersects_boundary(&line, boundary) {
                        outcome.trips_skipped += 1;
                        continue;
                    }
                    let Some((min, max)) = geom::envelope(points) else {
                        outcome.trips_skipped += 1;
                        continue;
                    };
                    let (min, max) = geom::expand_envelope_deg(min, max, buffer_m);
                    let trace: Vec<(f64, f64)> =
                        line.coords().map(|c| proj.project(c.x, c.y)).collect();

                    for pos in index.query(min, max) {
                        let seg = &segments[pos];
                        if seg.state.undriveable || seg.state.manual_undriven {
                            continue;
                        }
                        let seg_pts = projected_segments
                            .entry(pos)
                            .or_insert_with(|| geom::project_line(&seg.geometry, &proj));
                        let covered = geom::covered_length_m(seg_pts, &trace, buffer_m);
                        if covered >= min_match_m {
                            updates.push((seg.segment_id.clone(), trip.start_time));
                        }
                    }
                }
                TripGeometry::Point(p) => {
                    if !geom::point_in_boundary(*p, boundary) {
                        outcome.trips_skipped += 1;
                        continue;
                    }
                    let (min, max) = geom::expand_envelope_deg(*p, *p, buffer_m);
                    let point = proj.project(p[0], p[1]);
                    for pos in index.query(min, max) {
                        let seg = &segments[pos];
                        if seg.state.undriveable || seg.state.manual_undriven {
                            continue;
                        }
                        let seg_pts = projected_segments
                            .entry(pos)
                            .or_insert_with(|| geom::project_line(&seg.geometry, &proj));
                        if geom::point_to_polyline_m(point, seg_pts) <= buffer_m {
                            updates.push((seg.segment_id.clone(), trip.start_time));
                        }
                    }
                }
            }

            outcome.trips_processed += 1;
            if let Some(at) = trip.matched_at {
                outcome.last_covered_at = Some(match outcome.last_covered_at {
                    Some(prev) => prev.max(at),
                    None => at,
                });
            }
        }
    }

    outcome.segments_flipped = store.apply_driven_updates(area_id, &updates)?;
    if let Some(at) = outcome.last_covered_at {
        store.advance_last_covered_at(area_id, at)?;
    }
    info!(
        "attribution for {area_id}: {} trips, {} skipped, {} segments newly driven",
        outcome.trips_processed, outcome.trips_skipped, outcome.segments_flipped
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trips::{MatchStatus, Trip};
    use crate::{CoverageParams, SegmentMark};
    use geo::{polygon, MultiPolygon};

    fn boundary() -> MultiPolygon<f64> {
        // Square of side 0.01 degrees around the origin.
        MultiPolygon(vec![polygon![
            (x: -0.005, y: -0.005),
            (x: 0.005, y: -0.005),
            (x: 0.005, y: 0.005),
            (x: -0.005, y: 0.005),
        ]])
    }

    fn fixture(name: &str) -> (NetworkStore, TripStore, AreaId) {
        let dir = std::env::temp_dir().join(format!("attribution_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let mut store = NetworkStore::open(dir.join("net")).unwrap();
        let trips = TripStore::open(dir.join("trips")).unwrap();
        let area_id = store
            .upsert_area("T1", boundary(), CoverageParams::default())
            .unwrap();

        // One short way along the meridian, emitted as a single segment.
        let proj = UtmProjector::for_centroid(0.0, 0.0);
        let ways = vec![crate::RawWay {
            way_id: 1,
            points: vec![[0.0, 0.0], [0.0, 0.0004]],
            highway: "residential".to_string(),
            street_name: "Main St".to_string(),
            oneway: false,
        }];
        let segments = crate::segmenter::segment_ways(
            &area_id,
            "T1",
            &ways,
            CoverageParams::default().segment_length_m,
            &proj,
        );
        assert_eq!(segments.len(), 1);
        store.save_segments(&area_id, segments).unwrap();
        (store, trips, area_id)
    }

    fn matched_trip(id: &str, points: Vec<[f64; 2]>, matched_at: DateTime<Utc>) -> Trip {
        let start = matched_at - chrono::Duration::minutes(30);
        Trip {
            transaction_id: id.to_string(),
            start_time: start,
            end_time: start + chrono::Duration::minutes(10),
            gps: TripGeometry::LineString(points.clone()),
            matched_gps: Some(TripGeometry::LineString(points)),
            match_status: Some(MatchStatus::Ok),
            matched_at: Some(matched_at),
        }
    }

    fn no_progress(_: usize, _: usize) {}
    fn never_cancel() -> bool {
        false
    }

    #[test]
    fn trip_along_segment_marks_it_driven() {
        let (mut store, mut trips, area_id) = fixture("along");
        trips
            .insert(matched_trip(
                "t1",
                vec![[0.0, 0.00005], [0.0, 0.00035]],
                Utc::now(),
            ))
            .unwrap();

        let outcome =
            full_calc(&mut store, &trips, &area_id, no_progress, never_cancel).unwrap();
        assert_eq!(outcome.trips_processed, 1);
        assert_eq!(outcome.segments_flipped, 1);

        let totals = store.refresh_stats(&area_id).unwrap();
        assert!((totals.coverage_percentage - 100.0).abs() < 1e-9);
        assert!(store.area(&area_id).unwrap().last_covered_at.is_some());
    }

    #[test]
    fn trip_far_away_marks_nothing() {
        let (mut store, mut trips, area_id) = fixture("far");
        trips
            .insert(matched_trip(
                "t1",
                vec![[0.004, 0.004], [0.004, 0.0044]],
                Utc::now(),
            ))
            .unwrap();

        let outcome =
            full_calc(&mut store, &trips, &area_id, no_progress, never_cancel).unwrap();
        assert_eq!(outcome.segments_flipped, 0);
        let totals = store.refresh_stats(&area_id).unwrap();
        assert_eq!(totals.coverage_percentage, 0.0);
    }

    #[test]
    fn trip_outside_boundary_is_skipped() {
        let (mut store, mut trips, area_id) = fixture("outside");
        trips
            .insert(matched_trip(
                "t1",
                vec![[1.0, 1.0], [1.0, 1.0004]],
                Utc::now(),
            ))
            .unwrap();

        let outcome =
            full_calc(&mut store, &trips, &area_id, no_progress, never_cancel).unwrap();
        assert_eq!(outcome.trips_skipped, 1);
        assert_eq!(outcome.segments_flipped, 0);
    }

    #[test]
    fn manual_undriven_survives_full_calc() {
        let (mut store, mut trips, area_id) = fixture("manual");
        trips
            .insert(matched_trip(
                "t1",
                vec![[0.0, 0.00005], [0.0, 0.00035]],
                Utc::now(),
            ))
            .unwrap();

        full_calc(&mut store, &trips, &area_id, no_progress, never_cancel).unwrap();
        let seg_id = store.segments(&area_id).unwrap()[0].segment_id.clone();
        store.mark_segment(&seg_id, SegmentMark::Undriven).unwrap();

        full_calc(&mut store, &trips, &area_id, no_progress, never_cancel).unwrap();
        assert!(!store.segment(&seg_id).unwrap().state.driven);
    }

    #[test]
    fn incremental_only_sees_new_trips() {
        let (mut store, mut trips, area_id) = fixture("incremental");
        let t0 = Utc::now();
        trips
            .insert(matched_trip(
                "old",
                vec![[0.0, 0.00005], [0.0, 0.00035]],
                t0,
            ))
            .unwrap();

        full_calc(&mut store, &trips, &area_id, no_progress, never_cancel).unwrap();
        let driven_before: Vec<_> = store
            .segments(&area_id)
            .unwrap()
            .iter()
            .filter(|s| s.state.driven)
            .map(|s| s.segment_id.clone())
            .collect();
        assert!(!driven_before.is_empty());

        // A later trip far from the segment: nothing flips, nothing clears.
        trips
            .insert(matched_trip(
                "new",
                vec![[0.004, 0.0], [0.004, 0.0004]],
                t0 + chrono::Duration::minutes(5),
            ))
            .unwrap();
        let outcome =
            incremental_calc(&mut store, &trips, &area_id, no_progress, never_cancel).unwrap();
        assert_eq!(outcome.trips_processed, 1);

        let driven_after: Vec<_> = store
            .segments(&area_id)
            .unwrap()
            .iter()
            .filter(|s| s.state.driven)
            .map(|s| s.segment_id.clone())
            .collect();
        // Monotonic: the driven set only grows.
        for id in &driven_before {
            assert!(driven_after.contains(id));
        }
    }

    #[test]
    fn point_geometry_attributes_within_buffer() {
        let (mut store, mut trips, area_id) = fixture("point");
        let at = Utc::now();
        let start = at - chrono::Duration::minutes(30);
        trips
            .insert(Trip {
                transaction_id: "p1".to_string(),
                start_time: start,
                end_time: start + chrono::Duration::minutes(1),
                gps: TripGeometry::Point([0.0, 0.0002]),
                matched_gps: Some(TripGeometry::Point([0.0, 0.0002])),
                match_status: Some(MatchStatus::Ok),
                matched_at: Some(at),
            })
            .unwrap();

        let outcome =
            full_calc(&mut store, &trips, &area_id, no_progress, never_cancel).unwrap();
        assert_eq!(outcome.segments_flipped, 1);
    }

    #[test]
    fn cancellation_aborts_without_applying() {
        let (mut store, mut trips, area_id) = fixture("cancel");
        trips
            .insert(matched_trip(
                "t1",
                vec![[0.0, 0.00005], [0.0, 0.00035]],
                Utc::now(),
            ))
            .unwrap();

        let result = full_calc(&mut store, &trips, &area_id, no_progress, || true);
        assert!(matches!(result, Err(CoverageError::Canceled)));
        assert!(!store.segments(&area_id).unwrap()[0].state.driven);
    }
}
