//! Task progress records. Long-running jobs write small compare-and-set
//! style updates here; the outside world polls the record, and cancellation
//! is requested by flagging it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::store::{read_json, write_json_atomic};
use crate::CoverageError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Initializing,
    FetchingNetwork,
    Segmenting,
    MappingSegments,
    ComputingMatching,
    Attributing,
    BuildingCircuit,
    GeneratingGeojson,
    Complete,
    Error,
    Canceled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Complete,
    Error,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Complete | TaskStatus::Error | TaskStatus::Canceled
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskProgress {
    pub task_id: String,
    pub area_display_name: String,
    pub status: TaskStatus,
    pub stage: Stage,
    pub progress_pct: u8,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cancel_requested: bool,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

pub struct ProgressStore {
    path: PathBuf,
    records: BTreeMap<String, TaskProgress>,
    last_write: Option<Instant>,
}

/// Progress writes are throttled to one per second, except for stage
/// transitions and terminal states which always land.
const WRITE_INTERVAL: Duration = Duration::from_secs(1);

impl ProgressStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self, CoverageError> {
        std::fs::create_dir_all(root.as_ref())?;
        let path = root.as_ref().join("progress.json");
        let records = if path.exists() {
            read_json(&path)?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            records,
            last_write: None,
        })
    }

    pub fn start_task(
        &mut self,
        task_id: &str,
        area_display_name: &str,
    ) -> Result<(), CoverageError> {
        let now = Utc::now();
        self.records.insert(
            task_id.to_string(),
            TaskProgress {
                task_id: task_id.to_string(),
                area_display_name: area_display_name.to_string(),
                status: TaskStatus::Queued,
                stage: Stage::Initializing,
                progress_pct: 0,
                message: "queued".to_string(),
                error: None,
                cancel_requested: false,
                started_at: now,
                updated_at: now,
                finished_at: None,
            },
        );
        self.commit()
    }

    /// Stage transition: always persisted.
    pub fn set_stage(
        &mut self,
        task_id: &str,
        stage: Stage,
        progress_pct: u8,
        message: &str,
    ) -> Result<(), CoverageError> {
        if let Some(rec) = self.records.get_mut(task_id) {
            rec.status = TaskStatus::Running;
            rec.stage = stage;
            rec.progress_pct = progress_pct.min(100);
            rec.message = message.to_string();
            rec.updated_at = Utc::now();
        }
        self.commit()
    }

    /// Within-stage tick: persisted at most once per second.
    pub fn tick(
        &mut self,
        task_id: &str,
        progress_pct: u8,
        message: &str,
    ) -> Result<(), CoverageError> {
        if let Some(rec) = self.records.get_mut(task_id) {
            rec.progress_pct = progress_pct.min(100);
            rec.message = message.to_string();
            rec.updated_at = Utc::now();
        }
        if self
            .last_write
            .map(|t| t.elapsed() >= WRITE_INTERVAL)
            .unwrap_or(true)
        {
            self.commit()?;
        }
        Ok(())
    }

    pub fn finish(
        &mut self,
        task_id: &str,
        status: TaskStatus,
        message: &str,
        error: Option<&str>,
    ) -> Result<(), CoverageError> {
        if let Some(rec) = self.records.get_mut(task_id) {
            let now = Utc::now();
            rec.status = status;
            rec.stage = match status {
                TaskStatus::Complete => Stage::Complete,
                TaskStatus::Canceled => Stage::Canceled,
                _ => Stage::Error,
            };
            if status == TaskStatus::Complete {
                rec.progress_pct = 100;
            }
            rec.message = message.to_string();
            rec.error = error.map(|e| e.to_string());
            rec.updated_at = now;
            rec.finished_at = Some(now);
        }
        self.commit()
    }

    pub fn get(&self, task_id: &str) -> Option<&TaskProgress> {
        self.records.get(task_id)
    }

    pub fn for_area(&self, area_display_name: &str) -> Vec<&TaskProgress> {
        self.records
            .values()
            .filter(|r| r.area_display_name == area_display_name)
            .collect()
    }

    /// The HTTP layer cancels a task by flagging its record; the task polls
    /// this between stages and chunks.
    pub fn request_cancel(&mut self, task_id: &str) -> Result<bool, CoverageError> {
        match self.records.get_mut(task_id) {
            Some(rec) if !rec.status.is_terminal() => {
                rec.cancel_requested = true;
                rec.updated_at = Utc::now();
                self.commit()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub fn is_cancel_requested(&self, task_id: &str) -> bool {
        self.records
            .get(task_id)
            .map(|r| r.cancel_requested)
            .unwrap_or(false)
    }

    /// Cascade used by area deletion.
    pub fn delete_for_area(&mut self, area_display_name: &str) -> Result<usize, CoverageError> {
        let before = self.records.len();
        self.records
            .retain(|_, r| r.area_display_name != area_display_name);
        let removed = before - self.records.len();
        if removed > 0 {
            self.commit()?;
        }
        Ok(removed)
    }

    /// Token that re-reads the record file on every poll, so a cancel
    /// written by another process is observed too.
    pub fn cancel_token(&self, task_id: &str) -> CancelToken {
        CancelToken {
            path: self.path.clone(),
            task_id: task_id.to_string(),
        }
    }

    fn commit(&mut self) -> Result<(), CoverageError> {
        write_json_atomic(&self.path, &self.records)?;
        self.last_write = Some(Instant::now());
        Ok(())
    }
}

#[derive(Clone, Debug)]
pub struct CancelToken {
    path: PathBuf,
    task_id: String,
}

impl CancelToken {
    pub fn is_canceled(&self) -> bool {
        let Ok(records) = read_json::<BTreeMap<String, TaskProgress>>(&self.path) else {
            return false;
        };
        records
            .get(&self.task_id)
            .map(|r| r.cancel_requested)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store(name: &str) -> ProgressStore {
        let dir = std::env::temp_dir().join(format!("progress_store_{name}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        ProgressStore::open(dir).unwrap()
    }

    #[test]
    fn lifecycle_transitions() {
        let mut store = temp_store("lifecycle");
        store.start_task("t1", "T1").unwrap();
        assert_eq!(store.get("t1").unwrap().status, TaskStatus::Queued);

        store
            .set_stage("t1", Stage::FetchingNetwork, 10, "downloading")
            .unwrap();
        let rec = store.get("t1").unwrap();
        assert_eq!(rec.status, TaskStatus::Running);
        assert_eq!(rec.stage, Stage::FetchingNetwork);

        store
            .finish("t1", TaskStatus::Complete, "done", None)
            .unwrap();
        let rec = store.get("t1").unwrap();
        assert_eq!(rec.progress_pct, 100);
        assert!(rec.finished_at.is_some());
        assert_eq!(rec.stage, Stage::Complete);
    }

    #[test]
    fn cancel_flag_round_trip() {
        let mut store = temp_store("cancel");
        store.start_task("t1", "T1").unwrap();
        assert!(!store.is_cancel_requested("t1"));
        assert!(store.request_cancel("t1").unwrap());
        assert!(store.is_cancel_requested("t1"));

        store
            .finish("t1", TaskStatus::Canceled, "canceled", None)
            .unwrap();
        // Terminal tasks can't be re-canceled.
        assert!(!store.request_cancel("t1").unwrap());
    }

    #[test]
    fn delete_for_area_cascades() {
        let mut store = temp_store("delete");
        store.start_task("t1", "T1").unwrap();
        store.start_task("t2", "T2").unwrap();
        assert_eq!(store.delete_for_area("T1").unwrap(), 1);
        assert!(store.get("t1").is_none());
        assert!(store.get("t2").is_some());
    }
}
