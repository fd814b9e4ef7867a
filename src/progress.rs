//! # Progress Tracking
//!
//! Keyed store of per-job progress records, shared between the pipeline
//! driver, the segment scheduler and the HTTP pollers.
//!
//! The store enforces the progress invariants so callers cannot violate
//! them by accident:
//! - percent is monotonically non-decreasing for the life of a job
//! - a terminal record (`completed`/`error`) never changes again
//! - percent reaches 100 only through `complete()`
//!
//! Each job writes only its own key, so contention is per-entry; the map
//! itself is guarded for concurrent insert/remove from the cleanup sweep.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Lifecycle state of one transcription job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Starting,
    Transcribing,
    Completed,
    Error,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Error)
    }
}

/// Mutable progress record for one job.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub status: JobStatus,
    pub progress: u8,
    pub stage: String,
    pub current_segment: usize,
    pub total_segments: usize,
    pub processed_duration: f64,
    pub total_duration: f64,
    pub estimated_time_remaining: Option<f64>,
    pub error: Option<String>,

    /// Epoch seconds at job creation; internal, used for the cleanup
    /// cutoff and elapsed-time derivation
    #[serde(skip)]
    created_at: f64,
}

impl Progress {
    fn new() -> Self {
        Self {
            status: JobStatus::Starting,
            progress: 0,
            stage: "Starting...".to_string(),
            current_segment: 0,
            total_segments: 0,
            processed_duration: 0.0,
            total_duration: 0.0,
            estimated_time_remaining: None,
            error: None,
            created_at: now_epoch_secs(),
        }
    }
}

/// Snapshot returned to pollers; adds derived elapsed time.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressView {
    #[serde(flatten)]
    pub progress: Progress,
    pub elapsed_seconds: f64,
}

/// Result of a cleanup sweep.
#[derive(Debug, Serialize)]
pub struct CleanupReport {
    pub removed_jobs: usize,
    pub removed_job_ids: Vec<String>,
    pub remaining_jobs: usize,
}

/// Concurrency-safe progress map keyed by job id.
///
/// Cheap to clone; all clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct ProgressStore {
    inner: Arc<RwLock<HashMap<String, Progress>>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a fresh `starting` record for a job, replacing any stale
    /// record under the same id (explicit reset).
    pub fn start(&self, job_id: &str) {
        let mut map = self.inner.write().unwrap();
        map.insert(job_id.to_string(), Progress::new());
    }

    /// Apply a mutation to a live record.
    ///
    /// Terminal records are left untouched, percent can only move forward,
    /// and a record that is still running is held below 100 regardless of
    /// what the closure wrote; `complete()` is the only path to 100.
    pub fn update<F>(&self, job_id: &str, f: F)
    where
        F: FnOnce(&mut Progress),
    {
        let mut map = self.inner.write().unwrap();
        if let Some(entry) = map.get_mut(job_id) {
            if entry.status.is_terminal() {
                return;
            }
            let floor = entry.progress;
            f(entry);
            if entry.progress < floor {
                entry.progress = floor;
            }
            if !entry.status.is_terminal() && entry.progress > 99 {
                entry.progress = 99;
            }
        }
    }

    /// Convenience for the common stage-advance update.
    pub fn set_stage(&self, job_id: &str, stage: &str, percent: u8) {
        self.update(job_id, |p| {
            p.stage = stage.to_string();
            p.progress = percent;
        });
    }

    /// Mark a job finished. The only path to percent 100.
    pub fn complete(&self, job_id: &str) {
        self.update(job_id, |p| {
            p.status = JobStatus::Completed;
            p.progress = 100;
            p.stage = "Transcription completed".to_string();
            p.estimated_time_remaining = Some(0.0);
        });
    }

    /// Mark a job failed; percent freezes where it was.
    pub fn fail(&self, job_id: &str, message: &str) {
        self.update(job_id, |p| {
            p.status = JobStatus::Error;
            p.stage = format!("Error: {}", message);
            p.error = Some(message.to_string());
        });
    }

    pub fn get(&self, job_id: &str) -> Option<ProgressView> {
        let map = self.inner.read().unwrap();
        map.get(job_id).map(view)
    }

    pub fn list(&self) -> HashMap<String, ProgressView> {
        let map = self.inner.read().unwrap();
        map.iter().map(|(id, p)| (id.clone(), view(p))).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove terminal records older than the cutoff. Non-terminal jobs are
    /// never touched, which makes repeated sweeps idempotent.
    pub fn cleanup(&self, older_than_minutes: u64) -> CleanupReport {
        let cutoff = now_epoch_secs() - (older_than_minutes as f64 * 60.0);
        let mut map = self.inner.write().unwrap();

        let removed_job_ids: Vec<String> = map
            .iter()
            .filter(|(_, p)| p.status.is_terminal() && p.created_at <= cutoff)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &removed_job_ids {
            map.remove(id);
        }

        CleanupReport {
            removed_jobs: removed_job_ids.len(),
            removed_job_ids,
            remaining_jobs: map.len(),
        }
    }
}

fn view(p: &Progress) -> ProgressView {
    ProgressView {
        elapsed_seconds: (now_epoch_secs() - p.created_at).max(0.0),
        progress: p.clone(),
    }
}

fn now_epoch_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}
