//! Runtime configuration
//!
//! Defaults match the interactive tool's historical behavior. Values can be
//! loaded from TOML and then overridden by `OPENSS_*` environment variables.

use std::path::PathBuf;

use serde::Deserialize;

use crate::{Error, Result};

// ============================================================================
// Defaults
// ============================================================================

/// Upper bound on concurrently allocated command workers
pub const DEFAULT_MAX_WORKERS: usize = 20;

/// Column width used when rendering report cells
pub const DEFAULT_VIEW_FIELD_SIZE: usize = 20;

/// Digits after the decimal point for floating-point cells
pub const DEFAULT_VIEW_PRECISION: usize = 4;

/// SQLite busy timeout in milliseconds
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// Capacity of each ingestion delivery queue
pub const DEFAULT_INGEST_QUEUE_CAPACITY: usize = 1_024;

const fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

const fn default_view_field_size() -> usize {
    DEFAULT_VIEW_FIELD_SIZE
}

const fn default_view_precision() -> usize {
    DEFAULT_VIEW_PRECISION
}

const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

const fn default_ingest_queue_capacity() -> usize {
    DEFAULT_INGEST_QUEUE_CAPACITY
}

// ============================================================================
// Config
// ============================================================================

/// Session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Maximum number of command worker threads.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Rendered width of a report column.
    #[serde(default = "default_view_field_size")]
    pub view_field_size: usize,
    /// Floating-point precision in reports.
    #[serde(default = "default_view_precision")]
    pub view_precision: usize,
    /// Render full paths for source-location cells instead of basenames.
    #[serde(default)]
    pub view_full_path: bool,
    /// Keep generated scratch stores when their experiment closes.
    #[serde(default)]
    pub save_database: bool,
    /// Directory for generated stores; the system temp dir when unset.
    #[serde(default)]
    pub database_dir: Option<PathBuf>,
    /// SQLite busy timeout.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Bounded capacity of the ingestion event queue.
    #[serde(default = "default_ingest_queue_capacity")]
    pub ingest_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            view_field_size: DEFAULT_VIEW_FIELD_SIZE,
            view_precision: DEFAULT_VIEW_PRECISION,
            view_full_path: false,
            save_database: false,
            database_dir: None,
            busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS,
            ingest_queue_capacity: DEFAULT_INGEST_QUEUE_CAPACITY,
        }
    }
}

impl Config {
    /// Parse a TOML document. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] on malformed TOML, unknown keys, or values
    /// rejected by [`Config::validate`].
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with process environment overrides.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when an override cannot be parsed.
    pub fn from_env() -> Result<Self> {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `OPENSS_*` overrides looked up through `lookup`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when an override cannot be parsed or the
    /// result fails validation.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("OPENSS_MAX_WORKERS") {
            self.max_workers = parse_number("OPENSS_MAX_WORKERS", &value)?;
        }
        if let Some(value) = lookup("OPENSS_VIEW_FIELD_SIZE") {
            self.view_field_size = parse_number("OPENSS_VIEW_FIELD_SIZE", &value)?;
        }
        if let Some(value) = lookup("OPENSS_VIEW_PRECISION") {
            self.view_precision = parse_number("OPENSS_VIEW_PRECISION", &value)?;
        }
        if let Some(value) = lookup("OPENSS_VIEW_FULLPATH") {
            self.view_full_path = parse_flag(&value);
        }
        if let Some(value) = lookup("OPENSS_SAVE_EXPERIMENT_DATABASE") {
            self.save_database = parse_flag(&value);
        }
        if let Some(value) = lookup("OPENSS_DB_DIR") {
            if !value.is_empty() {
                self.database_dir = Some(PathBuf::from(value));
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(Error::Config("max_workers must be positive".to_string()));
        }
        if self.view_field_size == 0 {
            return Err(Error::Config("view_field_size must be positive".to_string()));
        }
        if self.ingest_queue_capacity == 0 {
            return Err(Error::Config(
                "ingest_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Directory where generated stores are placed.
    #[must_use]
    pub fn database_dir(&self) -> PathBuf {
        self.database_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}: expected a number, got {value:?}")))
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
