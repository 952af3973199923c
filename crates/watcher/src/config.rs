//! Watcher configuration
//!
//! Every field has a default, so a TOML file only needs the values it
//! changes:
//!
//! ```toml
//! drain_interval_ms = 500
//! mode = "immediate"
//! ```

use crate::error::{Result, WatcherError};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// How raw notifications reach the tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    /// Queue notifications and coalesce them on every drain tick
    #[default]
    Debounced,
    /// Apply each notification as it arrives (legacy)
    Immediate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WatcherConfig {
    /// Debounce drain interval (default: 2000ms)
    #[serde(default = "default_drain_interval_ms")]
    pub drain_interval_ms: u64,

    /// Capacity of the events and errors streams (default: 1024)
    #[serde(default = "default_output_capacity")]
    pub output_capacity: usize,

    /// How long a publish may wait on a full stream (default: 5000ms)
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,

    #[serde(default)]
    pub mode: DispatchMode,

    /// Files larger than this are hashed through a memory map (default: 4 MiB)
    #[serde(default = "default_mmap_threshold_bytes")]
    pub mmap_threshold_bytes: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            drain_interval_ms: default_drain_interval_ms(),
            output_capacity: default_output_capacity(),
            publish_timeout_ms: default_publish_timeout_ms(),
            mode: DispatchMode::default(),
            mmap_threshold_bytes: default_mmap_threshold_bytes(),
        }
    }
}

fn default_drain_interval_ms() -> u64 {
    2000
}

fn default_output_capacity() -> usize {
    1024
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_mmap_threshold_bytes() -> u64 {
    shadow_core::hash::DEFAULT_MMAP_THRESHOLD
}

impl WatcherConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| WatcherError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| WatcherError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.drain_interval_ms == 0 {
            return Err(WatcherError::Config(
                "drain_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.output_capacity == 0 {
            return Err(WatcherError::Config(
                "output_capacity must be greater than zero".to_string(),
            ));
        }
        if self.publish_timeout_ms == 0 {
            return Err(WatcherError::Config(
                "publish_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}
