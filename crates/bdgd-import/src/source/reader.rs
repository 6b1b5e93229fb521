//! Chunked layer reading

use tracing::debug;

use super::{resolve_layer, LayerCursor, RawRecord, SourceContainer};
use crate::error::{ImportError, Result};

/// Records per chunk when nothing else is configured
pub const DEFAULT_CHUNK_SIZE: usize = 5000;

/// Streams one layer as fixed-size chunks.
///
/// Holds at most one chunk in memory. The underlying cursor is dropped as soon as the layer
/// is exhausted or a read fails, so the file handle never outlives the stream.
pub struct LayerReader {
    layer: String,
    cursor: Option<Box<dyn LayerCursor>>,
    chunk_size: usize,
    total: u64,
    read: u64,
}

impl LayerReader {
    /// Resolve the layer among `variants` and open it
    pub fn open(
        container: &dyn SourceContainer,
        variants: &[&str],
        chunk_size: usize,
    ) -> Result<Self> {
        let layer = resolve_layer(container, variants)?;
        let cursor = container.open_layer(&layer)?;
        Ok(Self::from_cursor(layer, cursor, chunk_size))
    }

    pub fn from_cursor(layer: String, cursor: Box<dyn LayerCursor>, chunk_size: usize) -> Self {
        let total = cursor.total_records();
        debug!(layer = %layer, total, chunk_size, "Layer opened");
        Self {
            layer,
            cursor: Some(cursor),
            chunk_size: chunk_size.max(1),
            total,
            read: 0,
        }
    }

    /// Concrete layer name the variants resolved to
    pub fn layer(&self) -> &str {
        &self.layer
    }

    pub fn total_records(&self) -> u64 {
        self.total
    }

    pub fn records_read(&self) -> u64 {
        self.read
    }

    /// Next chunk of up to `chunk_size` records, `None` once exhausted
    pub fn next_chunk(&mut self) -> Result<Option<Vec<RawRecord>>> {
        let Some(cursor) = self.cursor.as_mut() else {
            return Ok(None);
        };

        let mut chunk = Vec::with_capacity(self.chunk_size.min(self.total as usize).max(1));
        while chunk.len() < self.chunk_size {
            match cursor.next_record() {
                Some(Ok(record)) => chunk.push(record),
                Some(Err(e)) => {
                    self.cursor = None;
                    return Err(e);
                },
                None => {
                    self.cursor = None;
                    break;
                },
            }
        }

        self.read += chunk.len() as u64;
        if chunk.is_empty() {
            Ok(None)
        } else {
            Ok(Some(chunk))
        }
    }

    /// Read the next chunk on the blocking pool, handing the reader back with it
    pub async fn next_chunk_blocking(mut self) -> Result<(Self, Option<Vec<RawRecord>>)> {
        let layer = self.layer.clone();
        tokio::task::spawn_blocking(move || {
            let chunk = self.next_chunk();
            chunk.map(|c| (self, c))
        })
        .await
        .map_err(|e| ImportError::read(&layer, format!("reader task failed: {}", e)))?
    }
}

impl Iterator for LayerReader {
    type Item = Result<Vec<RawRecord>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
