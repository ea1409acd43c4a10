//! Planner and runtime configuration.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Engine configuration threaded through plan building and execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Registry name of the pseudo-source backing system-info queries.
    pub system_source: String,
    /// Run both sides of a parallel stage on their own threads.
    pub concurrent_sources: bool,
    /// Upper bound on rows a single merge join may emit.
    pub max_join_rows: Option<usize>,
    /// Treat NULL join keys as equal to each other.
    pub null_keys_match: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            system_source: "system".to_owned(),
            concurrent_sources: true,
            max_join_rows: None,
            null_keys_match: false,
        }
    }
}

impl PlannerConfig {
    /// Single-threaded configuration with otherwise default settings.
    pub fn deterministic() -> Self {
        Self {
            concurrent_sources: false,
            ..Self::default()
        }
    }

    /// Parses a TOML document; missing keys fall back to defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: None,
            source,
        })
    }

    /// Reads and parses a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: Some(path.to_path_buf()),
            source,
        })
    }

    /// Serializes the configuration back to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|source| ConfigError::Serialize { source })
    }
}

/// Errors raised while loading a [`PlannerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read.
    #[error("failed to read planner config {path}: {source}")]
    Read {
        /// File that failed to load.
        path: PathBuf,
        /// Underlying I/O failure.
        source: std::io::Error,
    },
    /// Configuration contents are not valid TOML for this schema.
    #[error("failed to parse planner config{}: {source}", display_path(.path))]
    Parse {
        /// File being parsed, if any.
        path: Option<PathBuf>,
        /// Underlying TOML failure.
        source: toml::de::Error,
    },
    /// Configuration could not be rendered as TOML.
    #[error("failed to serialize planner config: {source}")]
    Serialize {
        /// Underlying TOML failure.
        source: toml::ser::Error,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" {}", path.display()),
        None => String::new(),
    }
}
