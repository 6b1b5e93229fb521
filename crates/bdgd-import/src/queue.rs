//! Job listing and enqueueing for administrative callers

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::Result;
use crate::layers::ALL_LAYERS;
use crate::models::{JobKey, JobStatus};
use crate::orchestrator::{discover_candidates, distributor_prefix};
use crate::status::StatusTracker;

/// One row of the job listing. Discovered containers that never ran have no status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobListing {
    pub prefix: String,
    pub year: i32,
    pub layer: String,
    pub status: Option<JobStatus>,
    pub rows_processed: Option<i64>,
    pub note: Option<String>,
    pub error: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl JobListing {
    fn pending(key: &JobKey) -> Self {
        Self {
            prefix: key.prefix.clone(),
            year: key.year,
            layer: key.layer.clone(),
            status: None,
            rows_processed: None,
            note: None,
            error: None,
            updated_at: None,
        }
    }
}

/// Status records merged with the containers found in the downloads directory
pub async fn list_jobs(tracker: &StatusTracker, downloads_dir: &Path) -> Result<Vec<JobListing>> {
    let mut listing: BTreeMap<JobKey, JobListing> = BTreeMap::new();

    for record in tracker.list().await? {
        listing.insert(
            record.key.clone(),
            JobListing {
                prefix: record.key.prefix,
                year: record.key.year,
                layer: record.key.layer,
                status: Some(record.status),
                rows_processed: Some(record.rows_processed),
                note: record.note,
                error: record.error,
                updated_at: Some(record.updated_at),
            },
        );
    }

    match discover_candidates(downloads_dir) {
        Ok(candidates) => {
            for candidate in candidates {
                for spec in ALL_LAYERS {
                    let key = JobKey::new(candidate.prefix.clone(), candidate.year, spec.code);
                    listing
                        .entry(key)
                        .or_insert_with_key(JobListing::pending);
                }
            }
        },
        Err(e) => warn!(dir = %downloads_dir.display(), error = %e, "Could not scan downloads directory"),
    }

    Ok(listing.into_values().collect())
}

/// Queue every layer of the given distributors and years. Completed and running jobs are
/// left untouched. Returns the keys actually queued.
pub async fn enqueue(
    tracker: &StatusTracker,
    distributors: &[String],
    years: &[i32],
) -> Result<Vec<JobKey>> {
    let mut queued = Vec::new();
    for distributor in distributors {
        let prefix = distributor_prefix(distributor);
        for &year in years {
            for spec in ALL_LAYERS {
                let key = JobKey::new(prefix.clone(), year, spec.code);
                if tracker.enqueue(&key).await?.is_some() {
                    queued.push(key);
                }
            }
        }
    }
    info!(queued = queued.len(), "Enqueued jobs");
    Ok(queued)
}
