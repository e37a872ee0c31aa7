//! File-backed document store for areas and their segment tables.
//!
//! Documents are whole-file JSON, replaced atomically (write to a temp file,
//! then rename), one file for area metadata and one segment collection per
//! area. The spatial index over each loaded area is rebuilt on
//! `save_segments` and kept in memory for attribution and viewport queries.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use geo::MultiPolygon;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::geom::SegmentIndex;
use crate::stats::{self, AreaTotals};
use crate::{
    AreaId, AreaStatus, CoverageArea, CoverageError, CoverageParams, OptimalRoute, Segment,
    SegmentId, SegmentMark,
};

/// Viewport/state filter for street queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SegmentFilter {
    All,
    Driven,
    Undriven,
    Driveable,
    Undriveable,
}

impl SegmentFilter {
    fn matches(self, seg: &Segment) -> bool {
        match self {
            SegmentFilter::All => true,
            SegmentFilter::Driven => seg.state.driven,
            SegmentFilter::Undriven => !seg.state.driven && !seg.state.undriveable,
            SegmentFilter::Driveable => !seg.state.undriveable,
            SegmentFilter::Undriveable => seg.state.undriveable,
        }
    }
}

struct SegmentTable {
    segments: Vec<Segment>,
    by_id: HashMap<SegmentId, usize>,
    index: SegmentIndex,
}

impl SegmentTable {
    fn new(segments: Vec<Segment>) -> Self {
        let by_id = segments
            .iter()
            .enumerate()
            .map(|(i, s)| (s.segment_id.clone(), i))
            .collect();
        let index = SegmentIndex::build(segments.iter());
        Self {
            segments,
            by_id,
            index,
        }
    }
}

pub struct NetworkStore {
    root: PathBuf,
    areas: BTreeMap<AreaId, CoverageArea>,
    tables: HashMap<AreaId, SegmentTable>,
}

impl NetworkStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CoverageError> {
        let root = root.into();
        fs::create_dir_all(root.join("segments"))?;

        let areas_path = root.join("areas.json");
        let areas: BTreeMap<AreaId, CoverageArea> = if areas_path.exists() {
            read_json(&areas_path)?
        } else {
            BTreeMap::new()
        };

        let mut tables = HashMap::new();
        for id in areas.keys() {
            let path = segments_path(&root, id);
            let segments: Vec<Segment> = if path.exists() {
                read_json(&path)?
            } else {
                Vec::new()
            };
            tables.insert(id.clone(), SegmentTable::new(segments));
        }

        Ok(Self {
            root,
            areas,
            tables,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn areas(&self) -> impl Iterator<Item = &CoverageArea> {
        self.areas.values()
    }

    pub fn area(&self, id: &AreaId) -> Result<&CoverageArea, CoverageError> {
        self.areas
            .get(id)
            .ok_or_else(|| CoverageError::AreaNotFound(id.to_string()))
    }

    pub fn area_by_name(&self, display_name: &str) -> Result<&CoverageArea, CoverageError> {
        self.area(&AreaId::from_display_name(display_name))
    }

    /// Create or reset an area. Refused while a task already owns the area.
    /// Aggregates are zeroed and the state goes back to `processing`.
    pub fn upsert_area(
        &mut self,
        display_name: &str,
        boundary: MultiPolygon<f64>,
        params: CoverageParams,
    ) -> Result<AreaId, CoverageError> {
        let id = AreaId::from_display_name(display_name);
        if let Some(existing) = self.areas.get(&id) {
            if existing.status.is_busy() {
                return Err(CoverageError::ResourceBusy(display_name.to_string()));
            }
            let created_at = existing.created_at;
            let mut area = CoverageArea::new(display_name, boundary, params);
            area.created_at = created_at;
            self.areas.insert(id.clone(), area);
        } else {
            let area = CoverageArea::new(display_name, boundary, params);
            self.areas.insert(id.clone(), area);
            self.tables.insert(id.clone(), SegmentTable::new(Vec::new()));
        }
        self.commit_areas()?;
        Ok(id)
    }

    /// Gate for calculation tasks on an existing area: errors with
    /// `ResourceBusy` if another task holds it, otherwise moves it to the
    /// given busy status.
    pub fn begin_task(&mut self, id: &AreaId, status: AreaStatus) -> Result<(), CoverageError> {
        let area = self.area_mut(id)?;
        if area.status.is_busy() {
            return Err(CoverageError::ResourceBusy(area.display_name.clone()));
        }
        area.status = status;
        area.last_error = None;
        self.touch_and_commit(id)
    }

    pub fn set_status(&mut self, id: &AreaId, status: AreaStatus) -> Result<(), CoverageError> {
        self.area_mut(id)?.status = status;
        self.touch_and_commit(id)
    }

    /// Terminal error: stamps `last_error`, keeps existing aggregates.
    pub fn record_error(&mut self, id: &AreaId, message: &str) -> Result<(), CoverageError> {
        let area = self.area_mut(id)?;
        area.status = AreaStatus::Error;
        area.last_error = Some(message.to_string());
        self.touch_and_commit(id)
    }

    pub fn cancel_area(&mut self, id: &AreaId) -> Result<(), CoverageError> {
        self.area_mut(id)?.status = AreaStatus::Canceled;
        self.touch_and_commit(id)
    }

    /// Cascade delete: area metadata and its segment collection. The caller
    /// cleans up artifacts and progress records, which live elsewhere.
    pub fn delete_area(&mut self, id: &AreaId) -> Result<CoverageArea, CoverageError> {
        let area = self
            .areas
            .remove(id)
            .ok_or_else(|| CoverageError::AreaNotFound(id.to_string()))?;
        self.tables.remove(id);
        let path = segments_path(&self.root, id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        self.commit_areas()?;
        Ok(area)
    }

    pub fn set_optimal_route(
        &mut self,
        id: &AreaId,
        route: OptimalRoute,
    ) -> Result<(), CoverageError> {
        self.area_mut(id)?.optimal_route = Some(route);
        self.touch_and_commit(id)
    }

    pub fn set_streets_artifact(
        &mut self,
        id: &AreaId,
        artifact: crate::artifacts::ArtifactId,
    ) -> Result<(), CoverageError> {
        self.area_mut(id)?.streets_geojson_artifact = Some(artifact);
        self.touch_and_commit(id)
    }

    pub fn advance_last_covered_at(
        &mut self,
        id: &AreaId,
        at: DateTime<Utc>,
    ) -> Result<(), CoverageError> {
        let area = self.area_mut(id)?;
        area.last_covered_at = Some(match area.last_covered_at {
            Some(prev) => prev.max(at),
            None => at,
        });
        self.touch_and_commit(id)
    }

    /// Atomically replace the area's segment set and rebuild its index.
    /// Every segment is stamped with the area's display name; geometry of
    /// previously issued ids is never edited in place.
    pub fn save_segments(
        &mut self,
        id: &AreaId,
        mut segments: Vec<Segment>,
    ) -> Result<(), CoverageError> {
        let display_name = self.area(id)?.display_name.clone();
        for seg in &mut segments {
            seg.area_display_name = display_name.clone();
        }
        write_json_atomic(&segments_path(&self.root, id), &segments)?;
        self.tables.insert(id.clone(), SegmentTable::new(segments));
        self.touch_and_commit(id)
    }

    pub fn segments(&self, id: &AreaId) -> Result<&[Segment], CoverageError> {
        Ok(&self.table(id)?.segments)
    }

    pub fn segment_index(&self, id: &AreaId) -> Result<&SegmentIndex, CoverageError> {
        Ok(&self.table(id)?.index)
    }

    /// Global lookup: segment ids are unique across areas.
    pub fn segment(&self, segment_id: &SegmentId) -> Result<&Segment, CoverageError> {
        for table in self.tables.values() {
            if let Some(&pos) = table.by_id.get(segment_id) {
                return Ok(&table.segments[pos]);
            }
        }
        Err(CoverageError::SegmentNotFound(segment_id.to_string()))
    }

    /// Apply a manual override to one segment. Stamps `last_manual_update`,
    /// flags the owning area for a stats refresh, persists both documents.
    pub fn mark_segment(
        &mut self,
        segment_id: &SegmentId,
        mark: SegmentMark,
    ) -> Result<AreaId, CoverageError> {
        let area_id = self.area_of_segment(segment_id)?;
        {
            let table = self.tables.get_mut(&area_id).unwrap();
            let pos = table.by_id[segment_id];
            table.segments[pos].state.apply_mark(mark, Utc::now());
            write_json_atomic(&segments_path(&self.root, &area_id), &table.segments)?;
        }
        let area = self.area_mut(&area_id)?;
        area.needs_stats_update = true;
        self.touch_and_commit(&area_id)?;
        Ok(area_id)
    }

    /// Batched automatic attribution results: one persist per pass. Returns
    /// how many segments flipped to driven.
    pub fn apply_driven_updates(
        &mut self,
        id: &AreaId,
        updates: &[(SegmentId, DateTime<Utc>)],
    ) -> Result<usize, CoverageError> {
        let table = self
            .tables
            .get_mut(id)
            .ok_or_else(|| CoverageError::AreaNotFound(id.to_string()))?;
        let mut flipped = 0;
        for (segment_id, trip_start) in updates {
            let Some(&pos) = table.by_id.get(segment_id) else {
                warn!("attribution update for unknown segment {segment_id}");
                continue;
            };
            if table.segments[pos].state.mark_driven_auto(*trip_start) {
                flipped += 1;
            }
        }
        if !updates.is_empty() {
            write_json_atomic(&segments_path(&self.root, id), &table.segments)?;
            let area = self.area_mut(id)?;
            area.needs_stats_update = true;
            self.touch_and_commit(id)?;
        }
        Ok(flipped)
    }

    /// Segments whose envelope intersects the viewport box, optionally
    /// filtered by coverage state.
    pub fn query_viewport(
        &self,
        id: &AreaId,
        min: [f64; 2],
        max: [f64; 2],
        filter: SegmentFilter,
    ) -> Result<Vec<&Segment>, CoverageError> {
        let table = self.table(id)?;
        Ok(table
            .index
            .query(min, max)
            .into_iter()
            .map(|pos| &table.segments[pos])
            .filter(|seg| filter.matches(seg))
            .collect())
    }

    pub fn snapshot_stats(&self, id: &AreaId) -> Result<AreaTotals, CoverageError> {
        Ok(stats::aggregate(self.table(id)?.segments.iter()))
    }

    /// Recompute aggregates from the segment table, persist them onto the
    /// area and clear `needs_stats_update`.
    pub fn refresh_stats(&mut self, id: &AreaId) -> Result<AreaTotals, CoverageError> {
        let totals = self.snapshot_stats(id)?;
        let area = self.area_mut(id)?;
        area.total_length_m = totals.total_length_m;
        area.driveable_length_m = totals.driveable_length_m;
        area.driven_length_m = totals.driven_length_m;
        area.coverage_percentage = totals.coverage_percentage;
        area.total_segments = totals.total_segments;
        area.driveable_segments = totals.driveable_segments;
        area.street_types = totals.street_types.clone();
        area.needs_stats_update = false;
        self.touch_and_commit(id)?;
        Ok(totals)
    }

    fn area_of_segment(&self, segment_id: &SegmentId) -> Result<AreaId, CoverageError> {
        for (id, table) in &self.tables {
            if table.by_id.contains_key(segment_id) {
                return Ok(id.clone());
            }
        }
        Err(CoverageError::SegmentNotFound(segment_id.to_string()))
    }

    fn table(&self, id: &AreaId) -> Result<&SegmentTable, CoverageError> {
        self.tables
            .get(id)
            .ok_or_else(|| CoverageError::AreaNotFound(id.to_string()))
    }

    fn area_mut(&mut self, id: &AreaId) -> Result<&mut CoverageArea, CoverageError> {
        self.areas
            .get_mut(id)
            .ok_or_else(|| CoverageError::AreaNotFound(id.to_string()))
    }

    fn touch_and_commit(&mut self, id: &AreaId) -> Result<(), CoverageError> {
        if let Some(area) = self.areas.get_mut(id) {
            area.last_updated = Utc::now();
        }
        self.commit_areas()
    }

    fn commit_areas(&self) -> Result<(), CoverageError> {
        write_json_atomic(&self.root.join("areas.json"), &self.areas)
    }
}

fn segments_path(root: &Path, id: &AreaId) -> PathBuf {
    root.join("segments").join(format!("{id}.json"))
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, CoverageError> {
    let file = fs::File::open(path)?;
    Ok(serde_json::from_reader(std::io::BufReader::new(file))?)
}

/// Whole-document replace: write a sibling temp file, then rename over the
/// target so readers never observe a half-written collection.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CoverageError> {
    let tmp = path.with_extension("json.tmp");
    {
        let file = fs::File::create(&tmp)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, value)?;
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
