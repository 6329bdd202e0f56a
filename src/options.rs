//! Pool configuration: handle counts and tuning pragmas, loadable from TOML.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 6 MiB, 1.5x SQLite's default checkpoint size.
pub const DEFAULT_JOURNAL_SIZE_LIMIT: i64 = 6_291_456;

/// Default number of read handles per pool.
pub const DEFAULT_MAX_READS: u32 = 4;

/// SQLite `synchronous` pragma values applied to every handle when
/// concurrency is enabled.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SynchronousMode {
    /// `PRAGMA synchronous = OFF`.
    Off,
    /// `PRAGMA synchronous = NORMAL`.
    #[default]
    Normal,
    /// `PRAGMA synchronous = FULL`.
    Full,
    /// `PRAGMA synchronous = EXTRA`.
    Extra,
}

impl SynchronousMode {
    /// Pragma keyword for this mode.
    pub fn as_pragma(self) -> &'static str {
        match self {
            SynchronousMode::Off => "OFF",
            SynchronousMode::Normal => "NORMAL",
            SynchronousMode::Full => "FULL",
            SynchronousMode::Extra => "EXTRA",
        }
    }
}

impl fmt::Display for SynchronousMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_pragma())
    }
}

/// Options controlling how a pool opens and tunes its handles.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolOptions {
    /// Number of read-only handles. Zero disables concurrency: every lock,
    /// read or write, is serviced by the write handle.
    pub max_reads: u32,
    /// `synchronous` pragma issued on every handle when concurrency is enabled.
    pub synchronous: SynchronousMode,
    /// `journal_size_limit` pragma issued on the write handle, in bytes.
    pub journal_size_limit: i64,
    /// Busy timeout installed on every handle; zero leaves SQLite's default.
    pub busy_timeout_ms: u64,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_reads: DEFAULT_MAX_READS,
            synchronous: SynchronousMode::Normal,
            journal_size_limit: DEFAULT_JOURNAL_SIZE_LIMIT,
            busy_timeout_ms: 0,
        }
    }
}

impl PoolOptions {
    /// Sets the number of read handles.
    pub fn with_max_reads(mut self, max_reads: u32) -> Self {
        self.max_reads = max_reads;
        self
    }

    /// Sets the `synchronous` pragma.
    pub fn with_synchronous(mut self, synchronous: SynchronousMode) -> Self {
        self.synchronous = synchronous;
        self
    }

    /// Sets the WAL journal size limit.
    pub fn with_journal_size_limit(mut self, bytes: i64) -> Self {
        self.journal_size_limit = bytes;
        self
    }

    /// Sets the busy timeout installed on every handle.
    pub fn with_busy_timeout_ms(mut self, millis: u64) -> Self {
        self.busy_timeout_ms = millis;
        self
    }

    /// Whether read handles exist at all.
    pub fn concurrency_enabled(&self) -> bool {
        self.max_reads > 0
    }

    /// Parses options from TOML text. Missing keys keep their defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            origin: "<inline>".to_string(),
            source,
        })
    }

    /// Reads and parses options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            origin: path.display().to_string(),
            source,
        })
    }

    pub(crate) fn write_tuning(&self) -> String {
        format!(
            "PRAGMA journal_mode = WAL;\nPRAGMA journal_size_limit = {};\nPRAGMA synchronous = {};",
            self.journal_size_limit, self.synchronous
        )
    }

    pub(crate) fn read_tuning(&self) -> String {
        format!("PRAGMA synchronous = {};", self.synchronous)
    }
}

/// Errors raised while loading pool configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("failed to read pool config {path}: {source}")]
    Read {
        /// File that was read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The configuration was not valid TOML for [`PoolOptions`].
    #[error("failed to parse pool config {origin}: {source}")]
    Parse {
        /// File path, or `<inline>` for string input.
        origin: String,
        /// Underlying TOML error.
        source: toml::de::Error,
    },
}
