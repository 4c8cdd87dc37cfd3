//! Job registry and progress tracking
//!
//! One entry per submitted document. Only the task processing a job writes
//! to its entry; status queries take cloned snapshots under the map's shard
//! lock, so they are safe alongside the writer.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;

use crate::config::FailurePolicy;
use crate::error::{Error, Result};

use super::executor::BatchOutcome;

/// Job status
///
/// Transitions only move forward: Pending → Processing → Completed | Failed.
/// Retries do not change the status; they show up in `retry_count`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Progress information for a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: Uuid,
    pub document_id: String,
    pub project_id: String,
    pub filename: String,
    pub status: JobStatus,
    /// 0-100, derived from completed / total batches
    pub progress: u8,
    pub total_batches: usize,
    pub completed_batches: usize,
    pub failed_batch_indices: BTreeSet<usize>,
    /// Retries used across all batches
    pub retry_count: u32,
    /// Retries used per batch, for batches that retried at least once
    pub batch_retries: BTreeMap<usize, u32>,
    /// Summary error once the job has failed batches
    pub error_message: Option<String>,
    /// Most recent batch failure reason
    pub last_error: Option<String>,
    /// Set when the job was cancelled by shutdown before finishing
    pub abandoned: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobProgress {
    fn new(
        job_id: Uuid,
        document_id: String,
        project_id: String,
        filename: String,
        total_batches: usize,
    ) -> Self {
        Self {
            job_id,
            document_id,
            project_id,
            filename,
            status: JobStatus::Pending,
            progress: 0,
            total_batches,
            completed_batches: 0,
            failed_batch_indices: BTreeSet::new(),
            retry_count: 0,
            batch_retries: BTreeMap::new(),
            error_message: None,
            last_error: None,
            abandoned: false,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// floor(completed / total * 100); a finished job with no batches is 100
    pub fn percent_complete(&self) -> u8 {
        if self.total_batches == 0 {
            return if self.status == JobStatus::Completed { 100 } else { 0 };
        }
        ((self.completed_batches * 100) / self.total_batches).min(100) as u8
    }

    /// Batches that have either succeeded or failed
    pub fn resolved_batches(&self) -> usize {
        self.completed_batches + self.failed_batch_indices.len()
    }

    /// Seconds between start and completion, if both are known
    pub fn duration_secs(&self) -> Option<f64> {
        let started = self.started_at?;
        let finished = self.completed_at?;
        Some((finished - started).num_milliseconds() as f64 / 1000.0)
    }
}

/// Live progress notification
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub job_id: Uuid,
    pub document_id: String,
    pub kind: ProgressEventKind,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEventKind {
    Registered { total_batches: usize },
    Started,
    BatchRetrying { batch_index: usize, retry: u32 },
    BatchSucceeded { batch_index: usize, completed_batches: usize, progress: u8 },
    BatchFailed { batch_index: usize, reason: String },
    Finished { status: JobStatus },
}

/// A job that has not reached a terminal state yet
#[derive(Debug, Clone, Serialize)]
pub struct InFlightJob {
    pub job_id: Uuid,
    pub filename: String,
    pub status: JobStatus,
    pub progress: u8,
    pub completed_batches: usize,
    pub total_batches: usize,
}

/// Aggregate job counts
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total_jobs: usize,
    pub pending_count: usize,
    pub processing_count: usize,
    pub completed_count: usize,
    pub failed_count: usize,
    /// Pending and processing jobs, oldest first
    pub in_flight: Vec<InFlightJob>,
}

struct JobEntry {
    progress: JobProgress,
    finished: Arc<Notify>,
}

/// Registry of ingestion jobs
pub struct JobRegistry {
    jobs: DashMap<Uuid, JobEntry>,
    events: broadcast::Sender<ProgressEvent>,
}

impl JobRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            jobs: DashMap::new(),
            events,
        }
    }

    /// Subscribe to live progress events
    ///
    /// Slow receivers lose the oldest events (`RecvError::Lagged`); the
    /// registry itself is always authoritative.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    fn emit(&self, progress: &JobProgress, kind: ProgressEventKind) {
        // No subscribers is fine
        let _ = self.events.send(ProgressEvent {
            job_id: progress.job_id,
            document_id: progress.document_id.clone(),
            kind,
        });
    }

    /// Register a new job in the pending state
    pub fn register(
        &self,
        document_id: &str,
        project_id: &str,
        filename: &str,
        total_batches: usize,
    ) -> Uuid {
        let job_id = Uuid::new_v4();
        let progress = JobProgress::new(
            job_id,
            document_id.to_string(),
            project_id.to_string(),
            filename.to_string(),
            total_batches,
        );
        self.jobs.insert(
            job_id,
            JobEntry {
                progress,
                finished: Arc::new(Notify::new()),
            },
        );
        if let Some(entry) = self.jobs.get(&job_id) {
            self.emit(&entry.progress, ProgressEventKind::Registered { total_batches });
        }
        job_id
    }

    /// Get job progress
    pub fn get(&self, job_id: Uuid) -> Option<JobProgress> {
        self.jobs.get(&job_id).map(|e| e.progress.clone())
    }

    /// Latest job submitted for a document
    pub fn get_by_document(&self, document_id: &str) -> Option<JobProgress> {
        self.jobs
            .iter()
            .filter(|e| e.progress.document_id == document_id)
            .max_by_key(|e| e.progress.created_at)
            .map(|e| e.progress.clone())
    }

    /// Get all jobs
    pub fn list_jobs(&self) -> Vec<JobProgress> {
        self.jobs.iter().map(|e| e.progress.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Pending → Processing, once a document slot is held
    pub fn mark_processing(&self, job_id: Uuid) {
        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            let progress = &mut entry.progress;
            if progress.status != JobStatus::Pending {
                return;
            }
            progress.status = JobStatus::Processing;
            progress.started_at = Some(Utc::now());
            self.emit(progress, ProgressEventKind::Started);
        }
    }

    /// Count one retry of a batch
    pub fn record_retry(&self, job_id: Uuid, batch_index: usize) {
        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            let progress = &mut entry.progress;
            if progress.status.is_terminal() {
                return;
            }
            progress.retry_count += 1;
            let retry = {
                let count = progress.batch_retries.entry(batch_index).or_insert(0);
                *count += 1;
                *count
            };
            self.emit(progress, ProgressEventKind::BatchRetrying { batch_index, retry });
        }
    }

    /// Fold one batch outcome into the job's counters
    pub fn record_batch_result(&self, job_id: Uuid, batch_index: usize, outcome: &BatchOutcome) {
        let Some(mut entry) = self.jobs.get_mut(&job_id) else {
            return;
        };
        let progress = &mut entry.progress;
        if progress.status.is_terminal() {
            return;
        }

        match outcome {
            BatchOutcome::Succeeded { .. } => {
                progress.completed_batches += 1;
                progress.progress = progress.percent_complete();
                let kind = ProgressEventKind::BatchSucceeded {
                    batch_index,
                    completed_batches: progress.completed_batches,
                    progress: progress.progress,
                };
                self.emit(progress, kind);
            }
            BatchOutcome::Failed { reason, .. } => {
                progress.failed_batch_indices.insert(batch_index);
                progress.last_error = Some(reason.clone());
                self.emit(
                    progress,
                    ProgressEventKind::BatchFailed {
                        batch_index,
                        reason: reason.clone(),
                    },
                );
            }
        }
    }

    /// Fail a job before any batch ran (e.g. the collection could not be created)
    pub fn fail(&self, job_id: Uuid, error: &str) -> Option<JobProgress> {
        let mut entry = self.jobs.get_mut(&job_id)?;
        if entry.progress.status.is_terminal() {
            return Some(entry.progress.clone());
        }
        let progress = &mut entry.progress;
        let total = progress.total_batches;
        progress.failed_batch_indices.extend(0..total);
        progress.last_error = Some(error.to_string());
        progress.error_message = Some(error.to_string());
        Some(self.finish(&mut entry, JobStatus::Failed))
    }

    /// Derive the terminal status once every batch has resolved
    pub fn finalize(&self, job_id: Uuid, policy: FailurePolicy) -> Option<JobProgress> {
        let mut entry = self.jobs.get_mut(&job_id)?;
        if entry.progress.status.is_terminal() {
            return Some(entry.progress.clone());
        }

        let progress = &mut entry.progress;
        let failed = progress.failed_batch_indices.len();
        let status = match policy {
            FailurePolicy::Strict if failed > 0 => JobStatus::Failed,
            FailurePolicy::ToleratePartial if failed > 0 && progress.completed_batches == 0 => {
                JobStatus::Failed
            }
            _ => JobStatus::Completed,
        };

        if failed > 0 {
            progress.error_message = Some(format!(
                "{} of {} batches failed; last error: {}",
                failed,
                progress.total_batches,
                progress.last_error.as_deref().unwrap_or("unknown")
            ));
        }

        Some(self.finish(&mut entry, status))
    }

    fn finish(&self, entry: &mut JobEntry, status: JobStatus) -> JobProgress {
        let progress = &mut entry.progress;
        progress.status = status;
        progress.completed_at = Some(Utc::now());
        progress.progress = progress.percent_complete();
        self.emit(progress, ProgressEventKind::Finished { status });
        entry.finished.notify_waiters();
        progress.clone()
    }

    /// Flag a non-terminal job as cancelled by shutdown
    ///
    /// The status is left as is: nothing is known about which batches
    /// reached the store, so the document needs a full re-ingestion.
    pub fn abandon(&self, job_id: Uuid) {
        if let Some(mut entry) = self.jobs.get_mut(&job_id) {
            if entry.progress.status.is_terminal() {
                return;
            }
            entry.progress.abandoned = true;
            entry.progress.error_message =
                Some("abandoned during shutdown; document must be re-ingested".to_string());
            entry.finished.notify_waiters();
        }
    }

    /// Wait until the job is terminal (or abandoned) and return its final state
    pub async fn wait_for_terminal(&self, job_id: Uuid) -> Result<JobProgress> {
        loop {
            let finished = {
                let entry = self.jobs.get(&job_id).ok_or(Error::JobNotFound(job_id))?;
                Arc::clone(&entry.finished)
            };

            let notified = finished.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check after registering so a concurrent finish is not missed
            let current = self.get(job_id).ok_or(Error::JobNotFound(job_id))?;
            if current.status.is_terminal() || current.abandoned {
                return Ok(current);
            }

            notified.await;
        }
    }

    /// Remove terminal jobs that finished more than `max_age` ago
    pub fn sweep(&self, max_age: Duration) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let cutoff = Utc::now() - max_age;
        let before = self.jobs.len();

        self.jobs.retain(|_, entry| {
            let progress = &entry.progress;
            let expired = progress.status.is_terminal()
                && progress.completed_at.is_some_and(|done| done <= cutoff);
            !expired
        });

        let removed = before.saturating_sub(self.jobs.len());
        if removed > 0 {
            tracing::info!("Cleaned up {} old jobs", removed);
        }
        removed
    }

    /// Aggregate counts and a snapshot of unfinished jobs
    pub fn list_stats(&self) -> RegistryStats {
        let mut stats = RegistryStats {
            total_jobs: 0,
            pending_count: 0,
            processing_count: 0,
            completed_count: 0,
            failed_count: 0,
            in_flight: Vec::new(),
        };
        let mut in_flight = Vec::new();

        for entry in self.jobs.iter() {
            let job = &entry.progress;
            stats.total_jobs += 1;
            match job.status {
                JobStatus::Pending => stats.pending_count += 1,
                JobStatus::Processing => stats.processing_count += 1,
                JobStatus::Completed => stats.completed_count += 1,
                JobStatus::Failed => stats.failed_count += 1,
            }
            if !job.status.is_terminal() {
                in_flight.push((
                    job.created_at,
                    InFlightJob {
                        job_id: job.job_id,
                        filename: job.filename.clone(),
                        status: job.status,
                        progress: job.progress,
                        completed_batches: job.completed_batches,
                        total_batches: job.total_batches,
                    },
                ));
            }
        }

        in_flight.sort_by_key(|(created_at, _)| *created_at);
        stats.in_flight = in_flight.into_iter().map(|(_, job)| job).collect();
        stats
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
