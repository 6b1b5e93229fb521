//! Source containers and layer reading
//!
//! A container holds named layers. Opening a layer yields a sequential cursor over raw
//! records; [`LayerReader`] groups that cursor into bounded chunks.

mod directory;
mod reader;

pub use directory::DirectoryContainer;
pub use reader::{LayerReader, DEFAULT_CHUNK_SIZE};

use chrono::NaiveDate;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use crate::error::{ImportError, Result};

/// One field value as read from the source, before sanitization
#[derive(Debug, Clone, PartialEq)]
pub enum RawValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    /// Geometry kept in its textual form (GeoJSON object or WKT)
    Geometry(String),
}

impl RawValue {
    pub fn is_null(&self) -> bool {
        matches!(self, RawValue::Null)
    }
}

/// One source row. Field names are stored upper-cased.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRecord {
    fields: BTreeMap<String, RawValue>,
}

impl RawRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: &str, value: RawValue) {
        self.fields.insert(field.to_uppercase(), value);
    }

    pub fn with(mut self, field: &str, value: RawValue) -> Self {
        self.insert(field, value);
        self
    }

    /// Field lookup, case-insensitive. Missing fields read as `None`.
    pub fn get(&self, field: &str) -> Option<&RawValue> {
        match self.fields.get(field) {
            Some(value) => Some(value),
            None => self.fields.get(&field.to_uppercase()),
        }
    }

    /// First non-null value among the candidate fields
    pub fn first_of(&self, fields: &[&str]) -> Option<&RawValue> {
        fields
            .iter()
            .filter_map(|f| self.get(f))
            .find(|v| !v.is_null())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Sequential cursor over one layer. Not restartable; dropping it releases the file handle.
pub trait LayerCursor: Send {
    /// Number of records in the layer, known before iteration starts
    fn total_records(&self) -> u64;

    /// Next record, `None` once the layer is exhausted
    fn next_record(&mut self) -> Option<Result<RawRecord>>;
}

/// A source container holding named layers
pub trait SourceContainer: Send + Sync {
    fn location(&self) -> &Path;

    fn list_layers(&self) -> Result<BTreeSet<String>>;

    fn open_layer(&self, name: &str) -> Result<Box<dyn LayerCursor>>;
}

/// Pick the concrete layer name for a set of acceptable variants.
///
/// Exact case-insensitive matches are tried for every variant in order before falling back
/// to case-insensitive prefix matches.
pub fn resolve_layer(
    container: &dyn SourceContainer,
    variants: &[&str],
) -> Result<String> {
    let available = container.list_layers()?;

    for variant in variants {
        if let Some(name) = available.iter().find(|n| n.eq_ignore_ascii_case(variant)) {
            return Ok(name.clone());
        }
    }

    for variant in variants {
        let wanted = variant.to_lowercase();
        if let Some(name) = available
            .iter()
            .find(|n| n.to_lowercase().starts_with(&wanted))
        {
            return Ok(name.clone());
        }
    }

    Err(ImportError::LayerNotFound {
        container: container.location().display().to_string(),
        tried: variants.iter().map(|v| v.to_string()).collect(),
        available: available.into_iter().collect(),
    })
}
