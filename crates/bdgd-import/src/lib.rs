//! BDGD import pipeline
//!
//! Streams layers of regulator distribution-grid extracts (BDGD) into a relational schema,
//! exactly once, in bounded memory.
//!
//! Per job (one layer of one distributor and year):
//!
//! 1. [`source`] resolves the layer and reads it in fixed-size chunks
//! 2. [`sanitize`] turns raw fields into a complete canonical column set
//! 3. [`identity`] derives content-addressed unit and lead identities
//! 4. [`loader`] deduplicates and bulk-loads units, leads, and monthly series
//! 5. [`status`] records progress and the job's final state
//!
//! [`orchestrator`] sequences jobs across containers and layers; [`pipeline`] is the single
//! flow every layer runs through, parameterized by [`layers`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bdgd_import::{
//!     ImportConfig, LayerPipeline, MemoryDestination, MemoryStatusStore, Orchestrator,
//!     StatusTracker,
//! };
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = ImportConfig { dry_run: true, ..Default::default() };
//! let tracker = StatusTracker::new(Arc::new(MemoryStatusStore::new()));
//! let pipeline = LayerPipeline::new(Arc::new(MemoryDestination::new()), tracker, &config);
//! let summary = Orchestrator::new(pipeline, config).run_discovered().await?;
//! println!("{} completed, {} failed", summary.completed(), summary.failed());
//! # Ok(())
//! # }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod jobs;
pub mod layers;
pub mod loader;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod queue;
pub mod sanitize;
pub mod source;
pub mod status;

pub use config::ImportConfig;
pub use error::{ImportError, Result};
pub use jobs::{ImportStats, JobOutcome, OutcomeKind, RunSummary};
pub use loader::{Destination, FanOutLoader, MemoryDestination, PgDestination};
pub use models::{JobKey, JobRecord, JobStatus, StatusUpdate};
pub use orchestrator::{Candidate, Orchestrator};
pub use pipeline::{JobRequest, LayerPipeline};
pub use status::{MemoryStatusStore, PgStatusStore, StatusStore, StatusTracker};
