//! Long-running job orchestration: the preprocess, calculation, matching
//! and route pipelines, with persisted progress, cooperative cancellation
//! and the per-area busy gate.

#[macro_use]
extern crate log;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use geo::MultiPolygon;
use thiserror::Error;

use street_coverage::artifacts::{write_streets_geojson, ArtifactStore};
use street_coverage::attribution;
use street_coverage::gpx_export;
use street_coverage::progress::{ProgressStore, Stage, TaskStatus};
use street_coverage::solver;
use street_coverage::store::{NetworkStore, SegmentFilter};
use street_coverage::trips::{MatchStatus, TripGeometry, TripStore};
use street_coverage::{
    AreaId, AreaStatus, CoverageError, CoverageParams, RawWay, Segment, SegmentId, SegmentMark,
};
use streets_fetcher::{FetchError, StreetFetcher};
use trip_matcher::{MatchClient, MatchError, MatchOutcome, MatchedGeometry};

#[derive(Error, Debug)]
pub enum TaskError {
    #[error(transparent)]
    Coverage(#[from] CoverageError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Match(#[from] MatchError),
}

impl TaskError {
    pub fn is_canceled(&self) -> bool {
        matches!(
            self,
            TaskError::Coverage(CoverageError::Canceled) | TaskError::Match(MatchError::Canceled)
        )
    }

    pub fn is_provider_unavailable(&self) -> bool {
        matches!(
            self,
            TaskError::Fetch(FetchError::NetworkUnavailable(_))
                | TaskError::Match(MatchError::ProviderUnavailable(_))
                | TaskError::Match(MatchError::RateLimitExceeded(_))
        )
    }

    /// CLI exit code contract: 0 success, 1 generic, 2 cancelled,
    /// 3 provider unavailable.
    pub fn exit_code(&self) -> i32 {
        if self.is_canceled() {
            2
        } else if self.is_provider_unavailable() {
            3
        } else {
            1
        }
    }
}

pub type TaskResult<T> = Result<T, TaskError>;

/// Owns every store plus the external clients, and runs the pipelines.
pub struct TaskRunner {
    pub network: NetworkStore,
    pub trips: TripStore,
    pub progress: ProgressStore,
    pub artifacts: ArtifactStore,
    fetcher: StreetFetcher,
    matcher: Option<Arc<MatchClient>>,
    task_seq: u64,
}

impl TaskRunner {
    pub fn open(
        data_dir: impl Into<PathBuf>,
        fetcher: StreetFetcher,
        matcher: Option<MatchClient>,
    ) -> TaskResult<Self> {
        let data_dir = data_dir.into();
        Ok(Self {
            network: NetworkStore::open(data_dir.join("network"))?,
            trips: TripStore::open(&data_dir)?,
            progress: ProgressStore::open(&data_dir)?,
            artifacts: ArtifactStore::open(data_dir.join("artifacts"))?,
            fetcher,
            matcher: matcher.map(Arc::new),
            task_seq: 0,
        })
    }

    fn next_task_id(&mut self, kind: &str) -> String {
        self.task_seq += 1;
        format!("{kind}-{}-{}", Utc::now().timestamp_millis(), self.task_seq)
    }

    fn check_cancel(&mut self, task_id: &str, area_id: &AreaId) -> TaskResult<()> {
        if self.progress.is_cancel_requested(task_id) {
            self.network.cancel_area(area_id)?;
            self.progress
                .finish(task_id, TaskStatus::Canceled, "canceled", None)?;
            return Err(CoverageError::Canceled.into());
        }
        Ok(())
    }

    fn fail_task(&mut self, task_id: &str, area_id: &AreaId, error: &TaskError) {
        if error.is_canceled() {
            // check_cancel already finalized the records.
            return;
        }
        let message = error.to_string();
        if let Err(e) = self.network.record_error(area_id, &message) {
            warn!("failed to record area error: {e}");
        }
        if let Err(e) = self
            .progress
            .finish(task_id, TaskStatus::Error, &message, Some(&message))
        {
            warn!("failed to record task error: {e}");
        }
    }

    /// Full preprocess pipeline: fetch → segment → save → full calc →
    /// stats → streets GeoJSON.
    pub async fn preprocess_area(
        &mut self,
        display_name: &str,
        boundary: MultiPolygon<f64>,
        params: CoverageParams,
    ) -> TaskResult<String> {
        let area_id = self
            .network
            .upsert_area(display_name, boundary.clone(), params)?;
        let task_id = self.next_task_id("preprocess");
        self.progress.start_task(&task_id, display_name)?;
        info!("starting preprocess task {task_id} for {display_name}");

        let result = self
            .run_preprocess(&task_id, &area_id, display_name, boundary, params)
            .await;
        if let Err(e) = &result {
            self.fail_task(&task_id, &area_id, e);
            error!("preprocess task {task_id} failed: {e}");
            return result.map(|_| task_id);
        }
        Ok(task_id)
    }

    async fn run_preprocess(
        &mut self,
        task_id: &str,
        area_id: &AreaId,
        display_name: &str,
        boundary: MultiPolygon<f64>,
        params: CoverageParams,
    ) -> TaskResult<()> {
        self.network.set_status(area_id, AreaStatus::Preprocessing)?;
        self.progress.set_stage(
            task_id,
            Stage::FetchingNetwork,
            10,
            "downloading street network",
        )?;
        let ways = self.fetcher.fetch_drivable(display_name, &boundary).await?;
        self.check_cancel(task_id, area_id)?;

        self.progress.set_stage(
            task_id,
            Stage::Segmenting,
            30,
            &format!("segmenting {} drivable ways", ways.len()),
        )?;
        let segments = self
            .segment_blocking(area_id.clone(), display_name.to_string(), ways, params)
            .await?;
        self.network.save_segments(area_id, segments)?;
        self.check_cancel(task_id, area_id)?;

        self.network.set_status(area_id, AreaStatus::Calculating)?;
        self.run_attribution(task_id, area_id, false).await?;

        self.finalize_area(task_id, area_id).await?;
        Ok(())
    }

    /// Rebuild coverage from scratch over all matched trips.
    pub async fn full_calc(&mut self, display_name: &str) -> TaskResult<String> {
        self.run_calc(display_name, false).await
    }

    /// Attribute only trips matched since the area's `last_covered_at`.
    pub async fn incremental_calc(&mut self, display_name: &str) -> TaskResult<String> {
        self.run_calc(display_name, true).await
    }

    async fn run_calc(&mut self, display_name: &str, incremental: bool) -> TaskResult<String> {
        let area_id = self.network.area_by_name(display_name)?.id.clone();
        self.network.begin_task(&area_id, AreaStatus::Calculating)?;
        let kind = if incremental { "incremental" } else { "full" };
        let task_id = self.next_task_id(kind);
        self.progress.start_task(&task_id, display_name)?;
        info!("starting {kind} calculation task {task_id} for {display_name}");

        let result = async {
            self.run_attribution(&task_id, &area_id, incremental).await?;
            self.finalize_area(&task_id, &area_id).await
        }
        .await;
        if let Err(e) = &result {
            self.fail_task(&task_id, &area_id, e);
            error!("calculation task {task_id} failed: {e}");
            return result.map(|_| task_id);
        }
        Ok(task_id)
    }

    async fn run_attribution(
        &mut self,
        task_id: &str,
        area_id: &AreaId,
        incremental: bool,
    ) -> TaskResult<()> {
        self.progress
            .set_stage(task_id, Stage::Attributing, 50, "attributing trips")?;
        let token = self.progress.cancel_token(task_id);
        let progress = &mut self.progress;
        let on_progress = |done: usize, total: usize| {
            if done % 500 == 0 || done == total {
                let pct = 50 + (done * 30 / total.max(1)) as u8;
                let _ = progress.tick(task_id, pct, &format!("trip {done}/{total}"));
            }
        };
        let outcome = if incremental {
            attribution::incremental_calc(
                &mut self.network,
                &self.trips,
                area_id,
                on_progress,
                || token.is_canceled(),
            )
        } else {
            attribution::full_calc(&mut self.network, &self.trips, area_id, on_progress, || {
                token.is_canceled()
            })
        };
        match outcome {
            Ok(outcome) => {
                info!(
                    "attribution finished: {} trips, {} newly driven segments",
                    outcome.trips_processed, outcome.segments_flipped
                );
                Ok(())
            }
            Err(CoverageError::Canceled) => {
                self.network.cancel_area(area_id)?;
                self.progress
                    .finish(task_id, TaskStatus::Canceled, "canceled", None)?;
                Err(CoverageError::Canceled.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Stats refresh, streets artifact regeneration, terminal bookkeeping.
    async fn finalize_area(&mut self, task_id: &str, area_id: &AreaId) -> TaskResult<()> {
        let totals = self.network.refresh_stats(area_id)?;
        self.progress.set_stage(
            task_id,
            Stage::GeneratingGeojson,
            90,
            "writing streets geojson",
        )?;
        self.regenerate_streets_geojson(area_id)?;

        self.network.set_status(area_id, AreaStatus::Completed)?;
        self.progress.finish(
            task_id,
            TaskStatus::Complete,
            &format!(
                "{:.1}% of {:.1} km driveable",
                totals.coverage_percentage,
                totals.driveable_length_m / 1000.0
            ),
            None,
        )?;
        Ok(())
    }

    /// Replace the area-wide streets GeoJSON artifact.
    pub fn regenerate_streets_geojson(&mut self, area_id: &AreaId) -> TaskResult<()> {
        let old = self.network.area(area_id)?.streets_geojson_artifact.clone();
        let artifact_id = {
            let area = self.network.area(area_id)?;
            let segments = self.network.segments(area_id)?;
            write_streets_geojson(&self.artifacts, area, segments.iter())?
        };
        self.network.set_streets_artifact(area_id, artifact_id)?;
        if let Some(old) = old {
            self.artifacts.delete(&old)?;
        }
        Ok(())
    }

    /// Map-match every trip that hasn't been matched yet, bounded by the
    /// matcher's semaphore and rate limiter.
    pub async fn match_trips(&mut self) -> TaskResult<String> {
        let matcher = self
            .matcher
            .clone()
            .ok_or_else(|| CoverageError::Validation("no matching provider configured".into()))?;
        let task_id = self.next_task_id("match");
        self.progress.start_task(&task_id, "trips")?;

        let pending: Vec<(String, TripGeometry, Vec<i64>)> = self
            .trips
            .unmatched()
            .into_iter()
            .map(|t| {
                let n = t.gps.coords().len();
                (
                    t.transaction_id.clone(),
                    t.gps.clone(),
                    t.interpolated_timestamps(n),
                )
            })
            .collect();
        let total = pending.len();
        self.progress.set_stage(
            task_id.as_str(),
            Stage::ComputingMatching,
            5,
            &format!("matching {total} trips"),
        )?;
        info!("matching {total} unmatched trips");

        // Bridge the persisted cancel flag into the matcher's atomic.
        let cancel = Arc::new(AtomicBool::new(false));
        let token = self.progress.cancel_token(&task_id);
        let poller = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                loop {
                    if token.is_canceled() {
                        cancel.store(true, Ordering::Relaxed);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        });

        let jobs = pending.into_iter().map(|(id, gps, timestamps)| {
            let matcher = matcher.clone();
            let cancel = cancel.clone();
            async move {
                let result = match &gps {
                    TripGeometry::Point(_) => Ok(MatchOutcome::Skipped("point")),
                    TripGeometry::LineString(coords) => {
                        matcher
                            .match_trace(coords, Some(&timestamps), &cancel)
                            .await
                    }
                };
                (id, result)
            }
        });
        let results = futures::future::join_all(jobs).await;
        poller.abort();

        let mut matched = 0usize;
        let mut failed = 0usize;
        let mut canceled = false;
        for (transaction_id, result) in results {
            let (geometry, status) = match result {
                Ok(MatchOutcome::Matched(MatchedGeometry::Line(points))) => (
                    Some(TripGeometry::LineString(points)),
                    MatchStatus::Ok,
                ),
                Ok(MatchOutcome::Matched(MatchedGeometry::Point(p))) => {
                    (Some(TripGeometry::Point(p)), MatchStatus::Ok)
                }
                Ok(MatchOutcome::Skipped(reason)) => (None, MatchStatus::Skipped(reason.into())),
                Ok(MatchOutcome::NoValidGeometry) => (None, MatchStatus::NoValidGeometry),
                Err(MatchError::Canceled) => {
                    canceled = true;
                    continue;
                }
                Err(e) => {
                    // A failed trip never takes the batch down.
                    warn!("trip {transaction_id} failed to match: {e}");
                    failed += 1;
                    (None, MatchStatus::Error(e.to_string()))
                }
            };
            if matches!(status, MatchStatus::Ok) {
                matched += 1;
            }
            self.trips
                .set_match_result(&transaction_id, geometry, status, Utc::now())?;
        }

        if canceled {
            self.progress
                .finish(&task_id, TaskStatus::Canceled, "canceled", None)?;
            return Err(MatchError::Canceled.into());
        }
        self.progress.finish(
            &task_id,
            TaskStatus::Complete,
            &format!("{matched} matched, {failed} failed of {total}"),
            None,
        )?;
        Ok(task_id)
    }

    /// Compute and persist the optimal completion route for an area.
    pub async fn generate_route(
        &mut self,
        display_name: &str,
        start: Option<[f64; 2]>,
    ) -> TaskResult<String> {
        let (area_id, boundary, target_length, status) = {
            let area = self.network.area_by_name(display_name)?;
            (
                area.id.clone(),
                area.boundary.clone(),
                area.params.segment_length_m,
                area.status,
            )
        };
        if status != AreaStatus::Completed {
            return Err(CoverageError::CoverageIncomplete(display_name.to_string()).into());
        }

        let undriven: Vec<Segment> = self
            .network
            .segments(&area_id)?
            .iter()
            .filter(|s| !s.state.driven && !s.state.undriveable)
            .cloned()
            .collect();
        if undriven.is_empty() {
            return Err(CoverageError::NoUndrivenSegments(display_name.to_string()).into());
        }

        let task_id = self.next_task_id("route");
        self.progress.start_task(&task_id, display_name)?;
        info!(
            "routing {} undriven segments for {display_name}",
            undriven.len()
        );

        let result = async {
            self.progress.set_stage(
                &task_id,
                Stage::FetchingNetwork,
                40,
                "downloading street network",
            )?;
            let ways = self.fetcher.fetch_drivable(display_name, &boundary).await?;
            self.check_cancel(&task_id, &area_id)?;

            self.progress.set_stage(
                &task_id,
                Stage::ComputingMatching,
                65,
                &format!("solving tour over {} segments", undriven.len()),
            )?;
            let route = self
                .solve_blocking(ways, undriven, start, target_length)
                .await?;

            self.progress
                .set_stage(&task_id, Stage::BuildingCircuit, 85, "persisting route")?;
            self.network.set_optimal_route(&area_id, route)?;
            self.progress
                .finish(&task_id, TaskStatus::Complete, "route generated", None)?;
            Ok(())
        }
        .await;
        if let Err(e) = &result {
            self.fail_task(&task_id, &area_id, e);
            error!("route task {task_id} failed: {e}");
            return result.map(|_| task_id);
        }
        Ok(task_id)
    }

    /// Export the stored optimal route as GPX bytes.
    pub fn export_route_gpx(&self, display_name: &str) -> TaskResult<Vec<u8>> {
        let area = self.network.area_by_name(display_name)?;
        let route = area
            .optimal_route
            .as_ref()
            .ok_or_else(|| CoverageError::CoverageIncomplete(display_name.to_string()))?;
        Ok(gpx_export::route_to_gpx(
            route,
            &format!("{display_name} completion route"),
        )?)
    }

    /// Manual override on one segment, then stats + artifact refresh.
    pub fn mark_segment(&mut self, segment_id: &SegmentId, mark: SegmentMark) -> TaskResult<()> {
        let area_id = self.network.mark_segment(segment_id, mark)?;
        self.network.refresh_stats(&area_id)?;
        self.regenerate_streets_geojson(&area_id)?;
        Ok(())
    }

    pub fn query_streets(
        &self,
        display_name: &str,
        bbox: Option<[f64; 4]>,
        filter: SegmentFilter,
    ) -> TaskResult<Vec<&Segment>> {
        let area_id = self.network.area_by_name(display_name)?.id.clone();
        let (min, max) = match bbox {
            Some([min_lon, min_lat, max_lon, max_lat]) => {
                ([min_lon, min_lat], [max_lon, max_lat])
            }
            None => ([-180.0, -90.0], [180.0, 90.0]),
        };
        Ok(self.network.query_viewport(&area_id, min, max, filter)?)
    }

    /// Flag running tasks for cancellation; if nothing is running, just move
    /// the area to canceled.
    pub fn cancel(&mut self, display_name: &str) -> TaskResult<()> {
        let area_id = self.network.area_by_name(display_name)?.id.clone();
        let running: Vec<String> = self
            .progress
            .for_area(display_name)
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.task_id.clone())
            .collect();
        if running.is_empty() {
            self.network.cancel_area(&area_id)?;
            return Ok(());
        }
        for task_id in running {
            self.progress.request_cancel(&task_id)?;
        }
        Ok(())
    }

    /// Delete the area and everything hanging off it: segments, progress
    /// records, artifacts.
    pub fn delete(&mut self, display_name: &str) -> TaskResult<()> {
        let area_id = self.network.area_by_name(display_name)?.id.clone();
        let area = self.network.delete_area(&area_id)?;
        self.progress.delete_for_area(&area.display_name)?;
        for meta in self.artifacts.find_by_tag(&area.display_name)? {
            self.artifacts.delete(&meta.id)?;
        }
        info!("deleted coverage area {display_name}");
        Ok(())
    }

    async fn segment_blocking(
        &self,
        area_id: AreaId,
        display_name: String,
        ways: Vec<RawWay>,
        params: CoverageParams,
    ) -> TaskResult<Vec<Segment>> {
        let boundary_centroid = street_coverage::geom::boundary_centroid(
            &self.network.area(&area_id)?.boundary,
        )
        .ok_or_else(|| CoverageError::Validation("empty boundary".into()))?;
        let handle = tokio::task::spawn_blocking(move || {
            let proj = street_coverage::geom::UtmProjector::for_centroid(
                boundary_centroid[0],
                boundary_centroid[1],
            );
            street_coverage::segmenter::segment_ways(
                &area_id,
                &display_name,
                &ways,
                params.segment_length_m,
                &proj,
            )
        });
        handle
            .await
            .map_err(|e| CoverageError::InconsistentState(format!("segmenter worker died: {e}")).into())
    }

    async fn solve_blocking(
        &self,
        ways: Vec<RawWay>,
        undriven: Vec<Segment>,
        start: Option<[f64; 2]>,
        target_length: f64,
    ) -> TaskResult<street_coverage::OptimalRoute> {
        let handle = tokio::task::spawn_blocking(move || {
            let refs: Vec<&Segment> = undriven.iter().collect();
            solver::generate_route(&ways, &refs, start, target_length)
        });
        match handle.await {
            Ok(result) => Ok(result?),
            Err(e) => {
                Err(CoverageError::InconsistentState(format!("solver worker died: {e}")).into())
            }
        }
    }
}

/// Accept a GeoJSON document (geometry, feature or single-feature
/// collection) and reduce it to the boundary multipolygon.
pub fn boundary_from_geojson(doc: &geojson::GeoJson) -> Result<MultiPolygon<f64>, CoverageError> {
    let geometry = match doc {
        geojson::GeoJson::Geometry(g) => g.clone(),
        geojson::GeoJson::Feature(f) => f
            .geometry
            .clone()
            .ok_or_else(|| CoverageError::Validation("feature has no geometry".into()))?,
        geojson::GeoJson::FeatureCollection(fc) => fc
            .features
            .first()
            .and_then(|f| f.geometry.clone())
            .ok_or_else(|| CoverageError::Validation("empty feature collection".into()))?,
    };
    match geometry.value {
        value @ geojson::Value::Polygon(_) => {
            let polygon: geo::Polygon<f64> = value
                .try_into()
                .map_err(|e| CoverageError::Validation(format!("bad polygon: {e}")))?;
            Ok(MultiPolygon(vec![polygon]))
        }
        value @ geojson::Value::MultiPolygon(_) => value
            .try_into()
            .map_err(|e| CoverageError::Validation(format!("bad multipolygon: {e}"))),
        other => Err(CoverageError::Validation(format!(
            "boundary must be a polygon or multipolygon, got {}",
            other.type_name()
        ))),
    }
}
