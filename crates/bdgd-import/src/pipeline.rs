//! The per-job import pipeline
//!
//! One parameterized flow for every layer: read a chunk, sanitize it, derive identities,
//! load it, record progress. Layers only differ in the [`LayerSpec`] they hand in.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, info, instrument};

use crate::config::ImportConfig;
use crate::error::{ImportError, Result};
use crate::identity;
use crate::jobs::{ImportStats, JobOutcome, OutcomeKind};
use crate::layers::{LayerKind, LayerSpec};
use crate::loader::{dedup_units, Destination, FanOutLoader};
use crate::models::JobKey;
use crate::sanitize::Sanitizer;
use crate::source::{DirectoryContainer, LayerReader, RawRecord};
use crate::status::{JobHandle, StatusTracker};

/// One layer of one container to import
#[derive(Debug, Clone)]
pub struct JobRequest {
    pub key: JobKey,
    pub container: PathBuf,
    pub spec: &'static LayerSpec,
}

impl JobRequest {
    pub fn new(prefix: &str, year: i32, container: impl Into<PathBuf>, spec: &'static LayerSpec) -> Self {
        Self {
            key: JobKey::new(prefix, year, spec.code),
            container: container.into(),
            spec,
        }
    }
}

#[derive(Clone)]
pub struct LayerPipeline {
    loader: FanOutLoader,
    tracker: StatusTracker,
    chunk_size: usize,
    dry_run: bool,
}

impl LayerPipeline {
    pub fn new(destination: Arc<dyn Destination>, tracker: StatusTracker, config: &ImportConfig) -> Self {
        Self {
            loader: FanOutLoader::new(destination),
            tracker,
            chunk_size: config.chunk_size,
            dry_run: config.dry_run,
        }
    }

    pub fn tracker(&self) -> &StatusTracker {
        &self.tracker
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Run one job to its end. Failures are recorded in the job's status and returned as a
    /// failed outcome, never raised.
    #[instrument(skip_all, fields(job = %request.key, dry_run = self.dry_run))]
    pub async fn run(&self, request: JobRequest) -> JobOutcome {
        let key = request.key.clone();
        let mut stats = ImportStats::new();

        if self.dry_run {
            return match self.import(&request, None, &mut stats).await {
                Ok(()) => {
                    stats.complete();
                    info!(job = %key, records = stats.records_read, "Dry run finished");
                    JobOutcome {
                        rows: stats.records_read as i64,
                        key,
                        kind: OutcomeKind::DryRun,
                        error: None,
                        stats,
                    }
                },
                Err(e) => {
                    error!(job = %key, error = %e, "Dry run failed");
                    JobOutcome::failed(key, e.to_string(), stats.records_read as i64, stats)
                },
            };
        }

        let mut handle = match self.tracker.begin(&key, "starting").await {
            Ok(handle) => handle,
            Err(e) => {
                error!(job = %key, error = %e, "Could not mark job as running");
                return JobOutcome::failed(key, e.to_string(), 0, stats);
            },
        };

        match self.import(&request, Some(&mut handle), &mut stats).await {
            Ok(()) => {
                stats.complete();
                let note = format!(
                    "completed: {} records, {} units, {} leads in {:.1}s",
                    stats.records_read, stats.units_inserted, stats.leads_inserted, stats.duration_secs
                );
                match handle.complete(note).await {
                    Ok(record) => {
                        info!(
                            job = %key,
                            rows = record.rows_processed,
                            units = stats.units_inserted,
                            duplicates = stats.duplicates,
                            already_present = stats.already_present,
                            records_per_sec = stats.records_per_second(),
                            "Job completed"
                        );
                        JobOutcome {
                            key,
                            kind: OutcomeKind::Completed,
                            rows: record.rows_processed,
                            error: None,
                            stats,
                        }
                    },
                    Err(e) => {
                        error!(job = %key, error = %e, "Could not mark job as completed");
                        JobOutcome::failed(key, e.to_string(), stats.records_read as i64, stats)
                    },
                }
            },
            Err(e) => {
                stats.complete();
                let rows = handle.rows();
                error!(job = %key, error = %e, rows, "Job failed");
                if let Err(status_err) = handle.fail(&e).await {
                    error!(job = %key, error = %status_err, "Could not mark job as failed");
                }
                JobOutcome::failed(key, e.to_string(), rows, stats)
            },
        }
    }

    async fn open(&self, request: &JobRequest) -> Result<LayerReader> {
        let path = request.container.clone();
        let spec = request.spec;
        let chunk_size = self.chunk_size;
        tokio::task::spawn_blocking(move || {
            let container = DirectoryContainer::open(path)?;
            LayerReader::open(&container, spec.variants, chunk_size)
        })
        .await
        .map_err(|e| ImportError::read(spec.code, format!("open task failed: {}", e)))?
    }

    async fn import(
        &self,
        request: &JobRequest,
        mut handle: Option<&mut JobHandle>,
        stats: &mut ImportStats,
    ) -> Result<()> {
        let key = &request.key;
        let mut reader = self.open(request).await?;
        let total = reader.total_records();
        info!(job = %key, layer = reader.layer(), total, chunk_size = self.chunk_size, "Importing layer");

        let sanitizer = Sanitizer::new(request.spec);
        let mut chunk_no = 0u64;
        loop {
            let (next, chunk) = reader.next_chunk_blocking().await?;
            reader = next;
            let Some(records) = chunk else {
                break;
            };
            chunk_no += 1;
            stats.chunks += 1;
            stats.records_read += records.len() as u64;

            self.process_chunk(key, request.spec, &sanitizer, &records, stats)
                .await?;

            debug!(job = %key, chunk = chunk_no, rows = stats.records_read, total, "Chunk done");
            if let Some(handle) = handle.as_deref_mut() {
                handle
                    .progress(
                        stats.records_read as i64,
                        format!("importing chunk {}: {}/{}", chunk_no, reader.records_read(), total),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn process_chunk(
        &self,
        key: &JobKey,
        spec: &'static LayerSpec,
        sanitizer: &Sanitizer,
        records: &[RawRecord],
        stats: &mut ImportStats,
    ) -> Result<()> {
        match spec.kind {
            LayerKind::Units => {
                let (units, report) = sanitizer.sanitize_units(records);
                stats.add_sanitize(&report);
                let identified = identity::resolve(key, units);

                if self.dry_run {
                    let (kept, duplicates) = dedup_units(identified);
                    stats.duplicates += duplicates;
                    debug!(job = %key, units = kept.len(), duplicates, "Dry run chunk");
                } else {
                    let report = self.loader.load_chunk(key, identified).await?;
                    stats.add_load(&report);
                }
            },
            LayerKind::Coordinates => {
                let (updates, report) = sanitizer.sanitize_coordinates(records);
                stats.add_sanitize(&report);

                if self.dry_run {
                    debug!(job = %key, updates = updates.len(), "Dry run chunk");
                } else {
                    stats.coordinates_applied += self.loader.apply_coordinates(key, &updates).await?;
                }
            },
        }
        Ok(())
    }
}
