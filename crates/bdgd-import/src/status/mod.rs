//! Job status tracking
//!
//! Every (distributor, year, layer) job has at most one current status record. The tracker
//! enforces the `queued -> running -> {completed, failed}` lifecycle on top of a plain
//! upsert store.

mod memory;
mod postgres;

pub use memory::MemoryStatusStore;
pub use postgres::PgStatusStore;

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ImportError, Result};
use crate::models::{JobKey, JobRecord, JobStatus, StatusUpdate};

/// Durable storage for job status records
#[async_trait]
pub trait StatusStore: Send + Sync {
    async fn get_status(&self, key: &JobKey) -> Result<Option<JobRecord>>;

    /// Upsert by key. `None` fields keep their stored value, except `error`, which is
    /// always overwritten. No lifecycle checks happen at this level.
    async fn set_status(&self, update: StatusUpdate) -> Result<JobRecord>;

    /// All records, ordered by key
    async fn list(&self) -> Result<Vec<JobRecord>>;
}

/// Lifecycle rules over a [`StatusStore`]
#[derive(Clone)]
pub struct StatusTracker {
    store: Arc<dyn StatusStore>,
}

impl StatusTracker {
    pub fn new(store: Arc<dyn StatusStore>) -> Self {
        Self { store }
    }

    pub async fn get_status(&self, key: &JobKey) -> Result<Option<JobRecord>> {
        self.store.get_status(key).await
    }

    pub async fn list(&self) -> Result<Vec<JobRecord>> {
        self.store.list().await
    }

    /// Validated upsert.
    ///
    /// Rejects transitions the lifecycle does not allow. While a job keeps running, its row
    /// count never goes backwards.
    pub async fn set_status(&self, update: StatusUpdate) -> Result<JobRecord> {
        self.transition(update, false).await
    }

    async fn transition(&self, mut update: StatusUpdate, restart: bool) -> Result<JobRecord> {
        let current = self.store.get_status(&update.key).await?;
        let from = current.as_ref().map(|r| r.status);

        if !JobStatus::can_transition(from, update.status) {
            return Err(ImportError::InvalidTransition {
                key: update.key.to_string(),
                from: from.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()),
                to: update.status.to_string(),
            });
        }

        if let (Some(current), Some(rows), false) = (&current, update.rows, restart) {
            if current.status == JobStatus::Running && rows < current.rows_processed {
                update.rows = Some(current.rows_processed);
            }
        }

        self.store.set_status(update).await
    }

    /// Mark a job as queued. Completed and running jobs are left as they are.
    ///
    /// Returns the new record, or `None` when the job was left alone.
    pub async fn enqueue(&self, key: &JobKey) -> Result<Option<JobRecord>> {
        if let Some(current) = self.store.get_status(key).await? {
            if matches!(current.status, JobStatus::Completed | JobStatus::Running) {
                debug!(job = %key, status = %current.status, "Not re-queuing job");
                return Ok(None);
            }
        }
        let record = self
            .set_status(StatusUpdate::new(key.clone(), JobStatus::Queued).with_rows(0))
            .await?;
        Ok(Some(record))
    }

    /// Mark a job as running with reset counters and hand back a handle for progress
    pub async fn begin(&self, key: &JobKey, note: impl Into<String>) -> Result<JobHandle> {
        self.transition(
            StatusUpdate::new(key.clone(), JobStatus::Running)
                .with_rows(0)
                .with_note(note),
            true,
        )
        .await?;
        Ok(JobHandle {
            tracker: self.clone(),
            key: key.clone(),
            rows: 0,
        })
    }

    /// Record a failure for a job whatever state it was left in
    pub async fn record_failure(&self, key: &JobKey, error: &str) -> Result<JobRecord> {
        let current = self.store.get_status(key).await?;
        if current.as_ref().map(|r| r.status) != Some(JobStatus::Running) {
            self.set_status(StatusUpdate::new(key.clone(), JobStatus::Running)).await?;
        }
        warn!(job = %key, error, "Recording job failure");
        self.set_status(StatusUpdate::new(key.clone(), JobStatus::Failed).with_error(error))
            .await
    }
}

/// A job between `begin` and its terminal transition
pub struct JobHandle {
    tracker: StatusTracker,
    key: JobKey,
    rows: i64,
}

impl JobHandle {
    pub fn key(&self) -> &JobKey {
        &self.key
    }

    pub fn rows(&self) -> i64 {
        self.rows
    }

    /// Flush progress after a chunk. The recorded count never decreases.
    pub async fn progress(&mut self, rows: i64, note: impl Into<String>) -> Result<()> {
        self.rows = self.rows.max(rows);
        self.tracker
            .set_status(
                StatusUpdate::new(self.key.clone(), JobStatus::Running)
                    .with_rows(self.rows)
                    .with_note(note),
            )
            .await?;
        Ok(())
    }

    pub async fn complete(self, note: impl Into<String>) -> Result<JobRecord> {
        self.tracker
            .set_status(
                StatusUpdate::new(self.key.clone(), JobStatus::Completed)
                    .with_rows(self.rows)
                    .with_note(note),
            )
            .await
    }

    pub async fn fail(self, error: &ImportError) -> Result<JobRecord> {
        self.tracker
            .set_status(
                StatusUpdate::new(self.key.clone(), JobStatus::Failed)
                    .with_rows(self.rows)
                    .with_error(error.to_string()),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> StatusTracker {
        StatusTracker::new(Arc::new(MemoryStatusStore::new()))
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let tracker = tracker();
        let key = JobKey::new("CPFL", 2023, "UCBT");

        tracker.enqueue(&key).await.unwrap();
        let mut handle = tracker.begin(&key, "started").await.unwrap();
        handle.progress(100, "chunk 1").await.unwrap();
        handle.progress(50, "stale report").await.unwrap();
        let record = handle.complete("done").await.unwrap();

        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.rows_processed, 100);
        assert_eq!(record.note.as_deref(), Some("done"));
        assert_eq!(record.error, None);
    }

    #[tokio::test]
    async fn test_terminal_job_rejects_progress() {
        let tracker = tracker();
        let key = JobKey::new("CPFL", 2023, "UCBT");
        tracker.begin(&key, "started").await.unwrap().complete("done").await.unwrap();

        let err = tracker
            .set_status(StatusUpdate::new(key.clone(), JobStatus::Failed).with_rows(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ImportError::InvalidTransition { .. }));
        assert_eq!(tracker.get_status(&key).await.unwrap().unwrap().rows_processed, 0);
    }

    #[tokio::test]
    async fn test_running_rows_never_decrease() {
        let tracker = tracker();
        let key = JobKey::new("CPFL", 2023, "UCMT");
        tracker.begin(&key, "started").await.unwrap();
        tracker
            .set_status(StatusUpdate::new(key.clone(), JobStatus::Running).with_rows(40))
            .await
            .unwrap();
        let record = tracker
            .set_status(StatusUpdate::new(key.clone(), JobStatus::Running).with_rows(10))
            .await
            .unwrap();
        assert_eq!(record.rows_processed, 40);
    }

    #[tokio::test]
    async fn test_enqueue_never_downgrades_completed() {
        let tracker = tracker();
        let key = JobKey::new("CPFL", 2023, "UCAT");
        tracker.begin(&key, "started").await.unwrap().complete("done").await.unwrap();

        assert!(tracker.enqueue(&key).await.unwrap().is_none());
        let record = tracker.get_status(&key).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Completed);
    }

    #[tokio::test]
    async fn test_rerun_resets_counters_and_error() {
        let tracker = tracker();
        let key = JobKey::new("CPFL", 2023, "UCBT");
        let mut handle = tracker.begin(&key, "started").await.unwrap();
        handle.progress(30, "chunk 1").await.unwrap();
        handle
            .fail(&ImportError::bulk_load("lead", "boom"))
            .await
            .unwrap();

        tracker.begin(&key, "retry").await.unwrap();
        let record = tracker.get_status(&key).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.rows_processed, 0);
        assert_eq!(record.error, None);
    }

    #[tokio::test]
    async fn test_record_failure_from_any_state() {
        let tracker = tracker();
        let key = JobKey::new("CPFL", 2023, "PONNOT");
        let record = tracker.record_failure(&key, "task panicked").await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error.as_deref(), Some("task panicked"));
    }
}
