//! Logging setup shared by the workspace binaries
//!
//! [`init_logging`] installs one global `tracing` subscriber writing to the console, to a
//! daily-rotated file, or both, as text or JSON. Import code logs with structured fields:
//!
//! ```rust,ignore
//! info!(job = %key, rows, total, "Chunk committed");
//! ```
//!
//! # Example
//!
//! ```no_run
//! use bdgd_common::logging::{init_logging, LogConfig};
//!
//! let config = LogConfig::from_env().unwrap_or_default();
//! init_logging(&config).ok();
//! tracing::info!("Importer started");
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan, MakeWriter},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::error::{CommonError, Result};

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
}

impl LogOutput {
    fn console(self) -> bool {
        matches!(self, LogOutput::Console | LogOutput::Both)
    }

    fn file(self) -> bool {
        matches!(self, LogOutput::File | LogOutput::Both)
    }
}

impl FromStr for LogOutput {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "console" | "stdout" => Ok(LogOutput::Console),
            "file" => Ok(LogOutput::File),
            "both" | "all" => Ok(LogOutput::Both),
            other => Err(CommonError::Config(format!("Invalid log output: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(CommonError::Config(format!("Invalid log format: {}", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Baseline level; `filter_directives` and `RUST_LOG` refine it per target
    pub level: Level,
    pub output: LogOutput,
    pub format: LogFormat,
    /// Directory for rotated files when output includes a file
    pub log_dir: PathBuf,
    /// Rotated file name prefix: `bdgd-import` gives `bdgd-import.2024-03-01`
    pub log_file_prefix: String,
    /// Comma-separated directives, e.g. `bdgd_import=debug,sqlx=warn`
    pub filter_directives: Option<String>,
    /// Source file and line on every event
    pub include_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            output: LogOutput::Console,
            format: LogFormat::Text,
            log_dir: PathBuf::from("./logs"),
            log_file_prefix: "bdgd".to_string(),
            filter_directives: None,
            include_location: false,
        }
    }
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    env_value(name)
        .map(|raw| {
            raw.trim()
                .parse::<T>()
                .map_err(|e| CommonError::Config(format!("{}={:?}: {}", name, raw, e)))
        })
        .transpose()
}

impl LogConfig {
    /// Defaults overridden by `LOG_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Override fields with whichever of these are set:
    /// `LOG_LEVEL`, `LOG_OUTPUT`, `LOG_FORMAT`, `LOG_DIR`, `LOG_FILE_PREFIX`, `LOG_FILTER`,
    /// `LOG_INCLUDE_LOCATION`.
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(level) = env_parsed::<Level>("LOG_LEVEL")? {
            self.level = level;
        }
        if let Some(output) = env_parsed("LOG_OUTPUT")? {
            self.output = output;
        }
        if let Some(format) = env_parsed("LOG_FORMAT")? {
            self.format = format;
        }
        if let Some(dir) = env_value("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        if let Some(prefix) = env_value("LOG_FILE_PREFIX") {
            self.log_file_prefix = prefix;
        }
        if let Some(filter) = env_value("LOG_FILTER") {
            self.filter_directives = Some(filter);
        }
        if let Some(location) = env_parsed("LOG_INCLUDE_LOCATION")? {
            self.include_location = location;
        }
        Ok(self)
    }

    pub fn builder() -> LogConfigBuilder {
        LogConfigBuilder::default()
    }

    fn filter(&self) -> Result<EnvFilter> {
        let mut filter = EnvFilter::from_default_env().add_directive(self.level.into());
        let directives = self.filter_directives.as_deref().unwrap_or_default();
        for directive in directives.split(',').map(str::trim).filter(|d| !d.is_empty()) {
            let parsed = directive.parse().map_err(|e| {
                CommonError::Config(format!("Invalid filter directive '{}': {}", directive, e))
            })?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

#[derive(Default)]
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn level(mut self, level: Level) -> Self {
        self.config.level = level;
        self
    }

    pub fn output(mut self, output: LogOutput) -> Self {
        self.config.output = output;
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.config.format = format;
        self
    }

    pub fn log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.log_dir = dir.into();
        self
    }

    pub fn log_file_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.log_file_prefix = prefix.into();
        self
    }

    pub fn filter_directives(mut self, filter: impl Into<String>) -> Self {
        self.config.filter_directives = Some(filter.into());
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(config: &LogConfig, writer: W, ansi: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_file(config.include_location)
        .with_line_number(config.include_location)
        .with_span_events(FmtSpan::CLOSE);

    match config.format {
        LogFormat::Text => layer.boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let filter = config.filter()?;

    let mut layers: Vec<BoxedLayer> = Vec::new();
    if config.output.console() {
        layers.push(fmt_layer(config, std::io::stdout, true));
    }
    if config.output.file() {
        std::fs::create_dir_all(&config.log_dir)?;
        let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_file_prefix);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        // Flushes on drop, and the subscriber lives as long as the process
        std::mem::forget(guard);
        layers.push(fmt_layer(config, writer, false));
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| CommonError::Logging(e.to_string()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_output_and_format_parse() {
        assert_eq!("stdout".parse::<LogOutput>().unwrap(), LogOutput::Console);
        assert_eq!(" Both ".parse::<LogOutput>().unwrap(), LogOutput::Both);
        assert!(LogOutput::Both.console() && LogOutput::Both.file());
        assert!(!LogOutput::File.console());
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = LogConfig::builder()
            .level(Level::DEBUG)
            .output(LogOutput::File)
            .log_dir("/var/log/bdgd")
            .log_file_prefix("bdgd-import")
            .filter_directives("sqlx=warn")
            .build();

        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.output, LogOutput::File);
        assert_eq!(config.format, LogFormat::Text);
        assert_eq!(config.log_dir, PathBuf::from("/var/log/bdgd"));
        assert_eq!(config.log_file_prefix, "bdgd-import");
    }

    #[test]
    fn test_filter_rejects_bad_directive() {
        let good = LogConfig::builder()
            .filter_directives("bdgd_import=debug, sqlx=warn,")
            .build();
        assert!(good.filter().is_ok());

        let bad = LogConfig::builder().filter_directives("sqlx=loudest").build();
        assert!(bad.filter().is_err());
    }
}
