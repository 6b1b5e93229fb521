//! Directory-backed container: one exported file per layer.
//!
//! `UCBT_tab.csv` (header row) or `UCBT_tab.jsonl` / `.ndjson` (one object per line).
//! Bytes that are not valid UTF-8 are decoded lossily, so a stray Latin-1 accent becomes
//! U+FFFD instead of failing the layer.

use std::collections::BTreeSet;
use std::fs::File;
use std::borrow::Cow;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::{LayerCursor, RawRecord, RawValue, SourceContainer};
use crate::error::{ImportError, Result};

const GEOMETRY_FIELDS: [&str; 3] = ["GEOMETRY", "WKT", "SHAPE"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum LayerFormat {
    Csv,
    JsonLines,
}

impl LayerFormat {
    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "csv" => Some(LayerFormat::Csv),
            "jsonl" | "ndjson" => Some(LayerFormat::JsonLines),
            _ => None,
        }
    }
}

/// A container directory such as `data/downloads/CPFL_PAULISTA_2023.gdb`
#[derive(Debug, Clone)]
pub struct DirectoryContainer {
    path: PathBuf,
}

impl DirectoryContainer {
    /// Open a container, failing with `SourceUnavailable` when the directory does not exist
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if !path.is_dir() {
            return Err(ImportError::SourceUnavailable(path));
        }
        Ok(Self { path })
    }

    fn layer_files(&self) -> Result<Vec<(String, LayerFormat, PathBuf)>> {
        let entries = std::fs::read_dir(&self.path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ImportError::SourceUnavailable(self.path.clone())
            } else {
                ImportError::Io(e)
            }
        })?;

        let mut files = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let format = path
                .extension()
                .and_then(|e| e.to_str())
                .and_then(LayerFormat::from_extension);
            let stem = path.file_stem().and_then(|s| s.to_str()).map(str::to_string);
            if let (Some(format), Some(stem)) = (format, stem) {
                files.push((stem, format, path));
            }
        }
        files.sort();
        Ok(files)
    }
}

impl SourceContainer for DirectoryContainer {
    fn location(&self) -> &Path {
        &self.path
    }

    fn list_layers(&self) -> Result<BTreeSet<String>> {
        Ok(self.layer_files()?.into_iter().map(|(name, _, _)| name).collect())
    }

    fn open_layer(&self, name: &str) -> Result<Box<dyn LayerCursor>> {
        let files = self.layer_files()?;
        let Some(pos) = files.iter().position(|(stem, _, _)| stem.eq_ignore_ascii_case(name)) else {
            return Err(ImportError::LayerNotFound {
                container: self.path.display().to_string(),
                tried: vec![name.to_string()],
                available: files.into_iter().map(|(stem, _, _)| stem).collect(),
            });
        };
        let (_, format, path) = &files[pos];

        debug!(layer = name, path = %path.display(), ?format, "Opening layer");
        match format {
            LayerFormat::Csv => Ok(Box::new(CsvCursor::open(name, path)?)),
            LayerFormat::JsonLines => Ok(Box::new(JsonLinesCursor::open(name, path)?)),
        }
    }
}

// ============================================================================
// CSV
// ============================================================================

struct CsvCursor {
    layer: String,
    reader: csv::Reader<File>,
    headers: Vec<String>,
    total: u64,
    row: csv::ByteRecord,
}

fn lossy(bytes: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(bytes)
}

impl CsvCursor {
    fn open(layer: &str, path: &Path) -> Result<Self> {
        // Counting pass, then a fresh reader for the actual stream
        let mut counter = Self::reader(path)?;
        let mut total = 0u64;
        let mut row = csv::ByteRecord::new();
        while counter
            .read_byte_record(&mut row)
            .map_err(|e| ImportError::read(layer, e))?
        {
            total += 1;
        }
        drop(counter);

        let mut reader = Self::reader(path)?;
        let headers = reader
            .byte_headers()
            .map_err(|e| ImportError::read(layer, e))?
            .iter()
            .map(|h| lossy(h).trim().to_uppercase())
            .collect();

        Ok(Self {
            layer: layer.to_string(),
            reader,
            headers,
            total,
            row,
        })
    }

    fn reader(path: &Path) -> Result<csv::Reader<File>> {
        let file = File::open(path)?;
        Ok(csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::Headers)
            .from_reader(file))
    }
}

impl LayerCursor for CsvCursor {
    fn total_records(&self) -> u64 {
        self.total
    }

    fn next_record(&mut self) -> Option<Result<RawRecord>> {
        match self.reader.read_byte_record(&mut self.row) {
            Ok(false) => None,
            Err(e) => Some(Err(ImportError::read(&self.layer, e))),
            Ok(true) => {
                let mut record = RawRecord::new();
                for (header, cell) in self.headers.iter().zip(self.row.iter()) {
                    let cell = lossy(cell);
                    let value = if cell.trim().is_empty() {
                        RawValue::Null
                    } else if GEOMETRY_FIELDS.contains(&header.as_str()) {
                        RawValue::Geometry(cell.into_owned())
                    } else {
                        RawValue::Text(cell.into_owned())
                    };
                    record.insert(header, value);
                }
                // Short rows still expose every header
                for header in self.headers.iter().skip(self.row.len()) {
                    record.insert(header, RawValue::Null);
                }
                Some(Ok(record))
            },
        }
    }
}

// ============================================================================
// JSON Lines
// ============================================================================

struct JsonLinesCursor {
    layer: String,
    reader: BufReader<File>,
    buf: Vec<u8>,
    line_no: u64,
    total: u64,
}

/// Next line without its terminator, decoded lossily. `None` at end of file.
fn read_line(reader: &mut impl BufRead, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf)? == 0 {
        return Ok(None);
    }
    Ok(Some(lossy(buf).trim_end_matches(&['\n', '\r'][..]).to_string()))
}

impl JsonLinesCursor {
    fn open(layer: &str, path: &Path) -> Result<Self> {
        let mut total = 0u64;
        let mut counter = BufReader::new(File::open(path)?);
        let mut buf = Vec::new();
        while let Some(line) = read_line(&mut counter, &mut buf)? {
            if !line.trim().is_empty() {
                total += 1;
            }
        }

        Ok(Self {
            layer: layer.to_string(),
            reader: BufReader::new(File::open(path)?),
            buf,
            line_no: 0,
            total,
        })
    }

    fn parse(&self, line: &str) -> Result<RawRecord> {
        let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
            ImportError::read(&self.layer, format!("line {}: {}", self.line_no, e))
        })?;
        let serde_json::Value::Object(map) = value else {
            return Err(ImportError::read(
                &self.layer,
                format!("line {}: expected a JSON object", self.line_no),
            ));
        };

        let mut record = RawRecord::new();
        for (key, value) in map {
            let field = key.to_uppercase();
            let raw = if GEOMETRY_FIELDS.contains(&field.as_str()) {
                match value {
                    serde_json::Value::Null => RawValue::Null,
                    serde_json::Value::String(s) => RawValue::Geometry(s),
                    other => RawValue::Geometry(other.to_string()),
                }
            } else {
                json_to_raw(value)
            };
            record.insert(&field, raw);
        }
        Ok(record)
    }
}

fn json_to_raw(value: serde_json::Value) -> RawValue {
    use serde_json::Value;
    match value {
        Value::Null => RawValue::Null,
        Value::Bool(b) => RawValue::Bool(b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => RawValue::Integer(i),
            None => n.as_f64().map(RawValue::Float).unwrap_or(RawValue::Null),
        },
        Value::String(s) if s.trim().is_empty() => RawValue::Null,
        Value::String(s) => RawValue::Text(s),
        other => RawValue::Text(other.to_string()),
    }
}

impl LayerCursor for JsonLinesCursor {
    fn total_records(&self) -> u64 {
        self.total
    }

    fn next_record(&mut self) -> Option<Result<RawRecord>> {
        loop {
            let line = match read_line(&mut self.reader, &mut self.buf) {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return Some(Err(ImportError::read(&self.layer, e))),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(self.parse(&line));
        }
    }
}
