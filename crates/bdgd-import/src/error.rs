//! Import error taxonomy
//!
//! Row-level problems (`MalformedField`, `DuplicateIdentity`) are recovered where they happen
//! and only ever show up in logs and counters. Everything else fails the job it occurred in
//! and ends up in the job's status record.

use std::path::PathBuf;
use thiserror::Error;

/// Result type for import operations
pub type Result<T> = std::result::Result<T, ImportError>;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("Source container unavailable: {}", .0.display())]
    SourceUnavailable(PathBuf),

    #[error("Layer not found in {container}: tried {tried:?}, available {available:?}")]
    LayerNotFound {
        container: String,
        tried: Vec<String>,
        available: Vec<String>,
    },

    #[error("Malformed value in field {field}: {value:?}")]
    MalformedField { field: String, value: String },

    #[error("Duplicate unit identity within chunk: {0}")]
    DuplicateIdentity(String),

    #[error("Bulk load into {table} failed: {message}")]
    BulkLoadFailure { table: String, message: String },

    #[error("Failed reading layer {layer}: {message}")]
    Read { layer: String, message: String },

    #[error("Status store error: {0}")]
    Status(String),

    #[error("Invalid status transition for {key}: {from} -> {to}")]
    InvalidTransition {
        key: String,
        from: String,
        to: String,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ImportError {
    pub(crate) fn bulk_load(table: &str, err: impl std::fmt::Display) -> Self {
        ImportError::BulkLoadFailure {
            table: table.to_string(),
            message: err.to_string(),
        }
    }

    pub(crate) fn read(layer: &str, err: impl std::fmt::Display) -> Self {
        ImportError::Read {
            layer: layer.to_string(),
            message: err.to_string(),
        }
    }
}
