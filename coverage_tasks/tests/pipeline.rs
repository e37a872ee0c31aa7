//! Offline end-to-end run of the calculation pipeline: seed an area and its
//! segments, insert matched trips, then drive `full_calc` through the task
//! runner and check every side effect a real run would leave behind.

use chrono::Utc;
use geo::{polygon, MultiPolygon};

use coverage_tasks::TaskRunner;
use street_coverage::geom::UtmProjector;
use street_coverage::progress::TaskStatus;
use street_coverage::segmenter::segment_ways;
use street_coverage::store::SegmentFilter;
use street_coverage::trips::{MatchStatus, Trip, TripGeometry};
use street_coverage::{AreaStatus, CoverageParams, RawWay, SegmentMark};
use streets_fetcher::{FetcherConfig, StreetFetcher};

fn boundary() -> MultiPolygon<f64> {
    MultiPolygon(vec![polygon![
        (x: -0.005, y: -0.005),
        (x: 0.005, y: -0.005),
        (x: 0.005, y: 0.005),
        (x: -0.005, y: 0.005),
    ]])
}

fn matched_trip(id: &str, points: Vec<[f64; 2]>) -> Trip {
    let matched_at = Utc::now();
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

fn runner(name: &str) -> TaskRunner {
    let dir = std::env::temp_dir().join(format!("pipeline_{name}_{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let fetcher = StreetFetcher::new(FetcherConfig::default());
    TaskRunner::open(dir, fetcher, None).unwrap()
}

fn seed_area(runner: &mut TaskRunner, name: &str) -> street_coverage::AreaId {
    let area_id = runner
        .network
        .upsert_area(name, boundary(), CoverageParams::default())
        .unwrap();
    let proj = UtmProjector::for_centroid(0.0, 0.0);
    let ways = vec![
        RawWay {
            way_id: 1,
            points: vec![[0.0, 0.0], [0.0, 0.0004]],
            highway: "residential".to_string(),
            street_name: "Main St".to_string(),
            oneway: false,
        },
        RawWay {
            way_id: 2,
            points: vec![[0.002, 0.0], [0.002, 0.0004]],
            highway: "primary".to_string(),
            street_name: "Elm St".to_string(),
            oneway: false,
        },
    ];
    let segments = segment_ways(&area_id, name, &ways, 45.72, &proj);
    runner.network.save_segments(&area_id, segments).unwrap();
    runner
        .network
        .set_status(&area_id, AreaStatus::Completed)
        .unwrap();
    area_id
}

#[tokio::test]
async fn full_calc_drives_segments_and_writes_artifacts() {
    let mut runner = runner("full");
    let area_id = seed_area(&mut runner, "Pipeline Town");
    runner
        .trips
        .insert(matched_trip("t1", vec![[0.0, 0.00005], [0.0, 0.00035]]))
        .unwrap();

    let task_id = runner.full_calc("Pipeline Town").await.unwrap();

    // Task record is terminal and complete.
    let record = runner.progress.get(&task_id).unwrap();
    assert_eq!(record.status, TaskStatus::Complete);
    assert_eq!(record.progress_pct, 100);

    // The trip covered one of the two streets.
    let area = runner.network.area(&area_id).unwrap();
    assert_eq!(area.status, AreaStatus::Completed);
    assert!((area.coverage_percentage - 50.0).abs() < 1.0);
    assert_eq!(area.total_segments, 2);
    assert!(area.last_covered_at.is_some());

    // The streets artifact exists and is tagged with the area.
    let artifact = area.streets_geojson_artifact.clone().unwrap();
    assert!(runner.artifacts.get_stream(&artifact).is_ok());
    let tagged = runner.artifacts.find_by_tag("Pipeline Town").unwrap();
    assert_eq!(tagged.len(), 1);

    // Street-type breakdown covers both highway classes.
    assert_eq!(area.street_types.len(), 2);
}

#[tokio::test]
async fn incremental_calc_only_adds_coverage() {
    let mut runner = runner("incremental");
    let area_id = seed_area(&mut runner, "Monotonic City");
    runner
        .trips
        .insert(matched_trip("t1", vec![[0.0, 0.00005], [0.0, 0.00035]]))
        .unwrap();
    runner.full_calc("Monotonic City").await.unwrap();

    let driven_before = runner
        .network
        .segments(&area_id)
        .unwrap()
        .iter()
        .filter(|s| s.state.driven)
        .count();

    runner
        .trips
        .insert(matched_trip("t2", vec![[0.002, 0.00005], [0.002, 0.00035]]))
        .unwrap();
    runner.incremental_calc("Monotonic City").await.unwrap();

    let driven_after = runner
        .network
        .segments(&area_id)
        .unwrap()
        .iter()
        .filter(|s| s.state.driven)
        .count();
    assert!(driven_after > driven_before);

    let area = runner.network.area(&area_id).unwrap();
    assert!((area.coverage_percentage - 100.0).abs() < 1.0);
}

#[tokio::test]
async fn busy_area_rejects_second_calculation() {
    let mut runner = runner("busy");
    let area_id = seed_area(&mut runner, "Busy Town");
    runner
        .network
        .set_status(&area_id, AreaStatus::Calculating)
        .unwrap();

    let result = runner.full_calc("Busy Town").await;
    assert!(result.is_err());
    assert_eq!(result.unwrap_err().exit_code(), 1);
}

#[tokio::test]
async fn mark_segment_refreshes_stats_and_artifact() {
    let mut runner = runner("mark");
    let area_id = seed_area(&mut runner, "Override City");
    runner.full_calc("Override City").await.unwrap();

    let segment_id = runner.network.segments(&area_id).unwrap()[0]
        .segment_id
        .clone();
    runner
        .mark_segment(&segment_id, SegmentMark::Undriveable)
        .unwrap();

    let area = runner.network.area(&area_id).unwrap();
    // One of the two segments no longer counts as driveable.
    assert_eq!(area.driveable_segments, 1);
    assert!(!area.needs_stats_update);

    let undriveable = runner
        .query_streets("Override City", None, SegmentFilter::Undriveable)
        .unwrap();
    assert_eq!(undriveable.len(), 1);
}

#[tokio::test]
async fn delete_cascades_everything() {
    let mut runner = runner("delete");
    let _area_id = seed_area(&mut runner, "Doomed Town");
    runner
        .trips
        .insert(matched_trip("t1", vec![[0.0, 0.00005], [0.0, 0.00035]]))
        .unwrap();
    runner.full_calc("Doomed Town").await.unwrap();

    runner.delete("Doomed Town").unwrap();
    assert!(runner.network.area_by_name("Doomed Town").is_err());
    assert!(runner.artifacts.find_by_tag("Doomed Town").unwrap().is_empty());
    assert!(runner.progress.for_area("Doomed Town").is_empty());
}
