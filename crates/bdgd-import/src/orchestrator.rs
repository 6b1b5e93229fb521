//! Import orchestrator
//!
//! Turns (distributor, year) candidates into layer jobs, skips work that is already done,
//! and runs every job in its own task so one failure never stops the queue.

use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::config::ImportConfig;
use crate::error::{ImportError, Result};
use crate::jobs::{JobOutcome, RunSummary};
use crate::layers::ALL_LAYERS;
use crate::models::{JobKey, JobStatus};
use crate::pipeline::{JobRequest, LayerPipeline};

/// Conventional container suffix for regulator extracts
pub const CONTAINER_EXTENSION: &str = "gdb";

/// One (distributor, year) extract
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Candidate {
    pub prefix: String,
    pub year: i32,
    pub container: PathBuf,
}

/// Map a distributor display name to its file prefix: `"CPFL Paulista"` -> `"CPFL_Paulista"`
pub fn distributor_prefix(display_name: &str) -> String {
    display_name.split_whitespace().collect::<Vec<_>>().join("_")
}

/// Split `{distributor}_{year}` on the last underscore. `None` when the last segment is
/// not a year.
pub fn parse_prefix(stem: &str) -> Option<(String, i32)> {
    let (prefix, year) = stem.rsplit_once('_')?;
    if prefix.is_empty() || year.len() != 4 || !year.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((prefix.to_string(), year.parse().ok()?))
}

/// Container name without its `.gdb` suffix
fn container_stem(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext)) if ext.eq_ignore_ascii_case(CONTAINER_EXTENSION) => stem,
        _ => name,
    }
}

/// Containers in the downloads directory named `{prefix}_{year}` (optionally `.gdb`)
pub fn discover_candidates(downloads_dir: &Path) -> Result<Vec<Candidate>> {
    let entries = std::fs::read_dir(downloads_dir).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ImportError::SourceUnavailable(downloads_dir.to_path_buf())
        } else {
            ImportError::Io(e)
        }
    })?;

    let mut candidates = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        match parse_prefix(container_stem(name)) {
            Some((prefix, year)) => candidates.push(Candidate {
                prefix,
                year,
                container: path.clone(),
            }),
            None => warn!(name, "Skipping container without a {{prefix}}_{{year}} name"),
        }
    }
    candidates.sort();
    Ok(candidates)
}

/// Candidates for explicit distributors and years. A container that is not on disk still
/// yields a candidate; its jobs then fail as `SourceUnavailable`.
pub fn candidates_for(downloads_dir: &Path, distributors: &[String], years: &[i32]) -> Vec<Candidate> {
    let discovered = discover_candidates(downloads_dir).unwrap_or_default();
    let mut candidates = Vec::new();
    for distributor in distributors {
        let prefix = distributor_prefix(distributor);
        for &year in years {
            let container = discovered
                .iter()
                .find(|c| c.year == year && c.prefix.eq_ignore_ascii_case(&prefix))
                .map(|c| c.container.clone())
                .unwrap_or_else(|| {
                    downloads_dir.join(format!("{}_{}.{}", prefix, year, CONTAINER_EXTENSION))
                });
            candidates.push(Candidate {
                prefix: prefix.clone(),
                year,
                container,
            });
        }
    }
    candidates
}

pub struct Orchestrator {
    pipeline: LayerPipeline,
    config: ImportConfig,
}

impl Orchestrator {
    pub fn new(pipeline: LayerPipeline, config: ImportConfig) -> Self {
        Self { pipeline, config }
    }

    /// Discover containers in the downloads directory and import them
    pub async fn run_discovered(&self) -> Result<RunSummary> {
        let candidates = discover_candidates(&self.config.downloads_dir)?;
        info!(
            dir = %self.config.downloads_dir.display(),
            candidates = candidates.len(),
            "Discovered containers"
        );
        Ok(self.run(candidates).await)
    }

    /// Run every layer of every candidate, in the fixed layer order
    pub async fn run(&self, candidates: Vec<Candidate>) -> RunSummary {
        info!(candidates = candidates.len(), dry_run = self.pipeline.is_dry_run(), "Starting import run");
        let mut summary = RunSummary::default();

        for candidate in candidates {
            for spec in ALL_LAYERS.iter().copied() {
                let request = JobRequest::new(&candidate.prefix, candidate.year, &candidate.container, spec);
                if let Some(skipped) = self.skip_reason(&request.key).await {
                    summary.push(skipped);
                    continue;
                }
                let outcome = self.run_isolated(request).await;
                summary.push(outcome);
            }
        }

        info!(
            completed = summary.completed(),
            failed = summary.failed(),
            skipped = summary.skipped(),
            dry_runs = summary.dry_runs(),
            "Import run finished"
        );
        summary
    }

    /// Whether a job should not run now: completed, or running within its lease
    async fn skip_reason(&self, key: &JobKey) -> Option<JobOutcome> {
        let record = match self.pipeline.tracker().get_status(key).await {
            Ok(record) => record?,
            Err(e) => {
                warn!(job = %key, error = %e, "Could not read job status, running anyway");
                return None;
            },
        };

        match record.status {
            JobStatus::Completed => {
                info!(job = %key, rows = record.rows_processed, "Skipping completed job");
                Some(JobOutcome::skipped(key.clone(), Some(record.status), record.rows_processed))
            },
            JobStatus::Running => {
                let lease = self.config.running_lease()?;
                let age = (Utc::now() - record.updated_at).to_std().unwrap_or_default();
                if age < lease {
                    info!(job = %key, age_secs = age.as_secs(), "Skipping job still within its running lease");
                    Some(JobOutcome::skipped(key.clone(), Some(record.status), record.rows_processed))
                } else {
                    warn!(job = %key, age_secs = age.as_secs(), "Retrying stale running job");
                    None
                }
            },
            JobStatus::Queued | JobStatus::Failed => None,
        }
    }

    /// Run a job in its own task. A panic is recorded as a failure of that job only.
    async fn run_isolated(&self, request: JobRequest) -> JobOutcome {
        let key = request.key.clone();
        let pipeline = self.pipeline.clone();
        let task = tokio::spawn(async move { pipeline.run(request).await });

        match task.await {
            Ok(outcome) => outcome,
            Err(join_error) => {
                let message = if join_error.is_panic() {
                    let panic = join_error.into_panic();
                    let detail = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    format!("job panicked: {}", detail)
                } else {
                    "job task was cancelled".to_string()
                };
                error!(job = %key, error = %message, "Job task aborted");

                let mut rows = 0;
                if !self.pipeline.is_dry_run() {
                    match self.pipeline.tracker().record_failure(&key, &message).await {
                        Ok(record) => rows = record.rows_processed,
                        Err(e) => error!(job = %key, error = %e, "Could not record job failure"),
                    }
                }
                JobOutcome::failed(key, message, rows, Default::default())
            },
        }
    }
}
