//! Archive Configuration
//!
//! ## ArchiveConfig
//!
//! - **directory**: root of the archive; one sub-directory per device (default: `./history`)
//! - **max_segment_size**: start a new segment once the current one reaches this size (default: 100MB)
//! - **flush_interval_ms**: how often open files are flushed (default: 60s)
//! - **default_user**: user written when a change batch carries none (default: `.`)
//! - **builder_queue_capacity**: pending index builds before requests are refused (default: 1024)
//!
//! ## Usage
//!
//! ```ignore
//! use chronolog_storage::ArchiveConfig;
//!
//! let config = ArchiveConfig::from_toml_str(r#"
//!     directory = "/data/history"
//!     max_segment_size = 10485760
//! "#)?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Root directory of the archive
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Maximum segment size in bytes before rolling (default: 100MB)
    #[serde(default = "default_max_segment_size")]
    pub max_segment_size: u64,

    /// Flush interval in milliseconds (default: 60 seconds)
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// User recorded for changes without one
    #[serde(default = "default_user")]
    pub default_user: String,

    /// Capacity of the index builder queue
    #[serde(default = "default_builder_queue_capacity")]
    pub builder_queue_capacity: usize,
}

fn default_directory() -> PathBuf {
    PathBuf::from("./history")
}

fn default_max_segment_size() -> u64 {
    100 * 1024 * 1024
}

fn default_flush_interval_ms() -> u64 {
    60_000
}

fn default_user() -> String {
    ".".to_string()
}

fn default_builder_queue_capacity() -> usize {
    1024
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            max_segment_size: default_max_segment_size(),
            flush_interval_ms: default_flush_interval_ms(),
            default_user: default_user(),
            builder_queue_capacity: default_builder_queue_capacity(),
        }
    }
}

impl ArchiveConfig {
    pub fn with_directory(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            ..Default::default()
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.max_segment_size == 0 {
            return Err(Error::Config("max_segment_size must be positive".to_string()));
        }
        if self.flush_interval_ms == 0 {
            return Err(Error::Config("flush_interval_ms must be positive".to_string()));
        }
        if self.builder_queue_capacity == 0 {
            return Err(Error::Config(
                "builder_queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
