//! Import configuration
//!
//! Loaded from `BDGD_*` and `DATABASE_*` environment variables. The binary calls
//! `dotenvy` first so a `.env` file works too.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::db::validate_schema_name;
use crate::source::DEFAULT_CHUNK_SIZE;

pub const DEFAULT_SCHEMA: &str = "plead";
pub const DEFAULT_DOWNLOADS_DIR: &str = "data/downloads";
pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Everything the pipeline and orchestrator need, passed in at construction
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportConfig {
    /// Postgres connection URL. Only required when not running dry.
    pub database_url: Option<String>,
    /// Schema holding the destination tables
    pub schema: String,
    /// Directory holding `{prefix}_{year}` containers
    pub downloads_dir: PathBuf,
    /// Records per chunk
    pub chunk_size: usize,
    /// Read, sanitize, and identify without writing anything
    pub dry_run: bool,
    /// A `running` job updated within this many seconds is considered in flight and left
    /// alone. Zero means a `running` job is always retried.
    pub running_lease_secs: u64,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            schema: DEFAULT_SCHEMA.to_string(),
            downloads_dir: PathBuf::from(DEFAULT_DOWNLOADS_DIR),
            chunk_size: DEFAULT_CHUNK_SIZE,
            dry_run: false,
            running_lease_secs: 0,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> anyhow::Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{} has an invalid value {:?}: {}", name, raw, e)),
        _ => Ok(None),
    }
}

fn env_bool(name: &str) -> anyhow::Result<Option<bool>> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "" => Ok(None),
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            other => anyhow::bail!("{} has an invalid boolean value {:?}", name, other),
        },
        Err(_) => Ok(None),
    }
}

impl ImportConfig {
    /// Load and validate configuration from environment variables
    pub fn from_env() -> anyhow::Result<Self> {
        let config = Self::load_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Read environment variables over the defaults without validating the result, for
    /// callers that still apply overrides of their own
    pub fn load_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let config = Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
            schema: std::env::var("BDGD_DB_SCHEMA").unwrap_or(defaults.schema),
            downloads_dir: std::env::var("BDGD_DOWNLOADS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.downloads_dir),
            chunk_size: env_parse("BDGD_CHUNK_SIZE")?.unwrap_or(defaults.chunk_size),
            dry_run: env_bool("BDGD_DRY_RUN")?.unwrap_or(defaults.dry_run),
            running_lease_secs: env_parse("BDGD_RUNNING_LEASE_SECS")?
                .unwrap_or(defaults.running_lease_secs),
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT")?
                .unwrap_or(defaults.connect_timeout_secs),
        };
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("BDGD_CHUNK_SIZE must be greater than 0");
        }
        if self.max_connections == 0 {
            anyhow::bail!("DATABASE_MAX_CONNECTIONS must be greater than 0");
        }
        validate_schema_name(&self.schema).context("BDGD_DB_SCHEMA is not a valid schema name")?;
        if !self.dry_run && self.database_url.is_none() {
            anyhow::bail!("DATABASE_URL is required unless BDGD_DRY_RUN is set");
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// `None` when the lease is disabled
    pub fn running_lease(&self) -> Option<Duration> {
        (self.running_lease_secs > 0).then(|| Duration::from_secs(self.running_lease_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 8] = [
        "DATABASE_URL",
        "BDGD_DB_SCHEMA",
        "BDGD_DOWNLOADS_DIR",
        "BDGD_CHUNK_SIZE",
        "BDGD_DRY_RUN",
        "BDGD_RUNNING_LEASE_SECS",
        "DATABASE_MAX_CONNECTIONS",
        "DATABASE_CONNECT_TIMEOUT",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    fn test_default_config() {
        let config = ImportConfig::default();
        assert_eq!(config.schema, "plead");
        assert_eq!(config.chunk_size, 5000);
        assert_eq!(config.downloads_dir, PathBuf::from("data/downloads"));
        assert!(config.running_lease().is_none());
    }

    #[test]
    #[serial]
    fn test_from_env_reads_overrides() {
        clear_env();
        std::env::set_var("BDGD_DRY_RUN", "true");
        std::env::set_var("BDGD_CHUNK_SIZE", "250");
        std::env::set_var("BDGD_DB_SCHEMA", "staging");
        std::env::set_var("BDGD_RUNNING_LEASE_SECS", "3600");

        let config = ImportConfig::from_env().unwrap();
        assert!(config.dry_run);
        assert_eq!(config.chunk_size, 250);
        assert_eq!(config.schema, "staging");
        assert_eq!(config.running_lease(), Some(Duration::from_secs(3600)));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_rejects_bad_values() {
        clear_env();
        std::env::set_var("BDGD_DRY_RUN", "1");
        std::env::set_var("BDGD_CHUNK_SIZE", "lots");
        assert!(ImportConfig::from_env().is_err());

        std::env::set_var("BDGD_CHUNK_SIZE", "0");
        assert!(ImportConfig::from_env().is_err());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_database_url_required_unless_dry_run() {
        clear_env();
        assert!(ImportConfig::from_env().is_err());
        std::env::set_var("DATABASE_URL", "postgres://localhost/bdgd");
        assert!(ImportConfig::from_env().is_ok());
        clear_env();
    }

    #[test]
    fn test_validate_rejects_bad_schema() {
        let config = ImportConfig {
            schema: "plead; DROP TABLE lead".to_string(),
            dry_run: true,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
