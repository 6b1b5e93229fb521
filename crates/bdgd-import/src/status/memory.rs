use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use super::StatusStore;
use crate::error::Result;
use crate::models::{JobKey, JobRecord, StatusUpdate};

/// Status records kept in process memory
#[derive(Debug, Default)]
pub struct MemoryStatusStore {
    records: Mutex<BTreeMap<JobKey, JobRecord>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a record as-is, timestamps included
    pub async fn put(&self, record: JobRecord) {
        self.records.lock().await.insert(record.key.clone(), record);
    }
}

#[async_trait]
impl StatusStore for MemoryStatusStore {
    async fn get_status(&self, key: &JobKey) -> Result<Option<JobRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn set_status(&self, update: StatusUpdate) -> Result<JobRecord> {
        let now = Utc::now();
        let mut records = self.records.lock().await;
        let record = records
            .entry(update.key.clone())
            .or_insert_with(|| JobRecord {
                key: update.key.clone(),
                status: update.status,
                rows_processed: 0,
                note: None,
                error: None,
                created_at: now,
                updated_at: now,
            });

        record.status = update.status;
        if let Some(rows) = update.rows {
            record.rows_processed = rows;
        }
        if let Some(note) = update.note {
            record.note = Some(note);
        }
        record.error = update.error;
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn list(&self) -> Result<Vec<JobRecord>> {
        Ok(self.records.lock().await.values().cloned().collect())
    }
}
