//! Configuration loaded from `jobrun.toml`.
//!
//! [`JobrunConfig`] holds every configurable parameter; values absent from
//! the file fall back to sensible defaults. The `JOBRUN_LOG` environment
//! variable takes precedence over the file for the log filter.

use anyhow::Result;
use serde::Deserialize;
use std::path::Path;

use crate::retry::RetryPolicy;

/// Top-level configuration loaded from `jobrun.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct JobrunConfig {
    /// Maximum launch attempts per job, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff before the second attempt, in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Cap applied to every computed backoff, in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Growth factor between consecutive backoffs.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,

    /// tracing filter directive, e.g. "info" or "jobrun=debug".
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    5_000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for JobrunConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            log_filter: default_log_filter(),
        }
    }
}

impl JobrunConfig {
    /// Load configuration from `jobrun.toml` in the current directory.
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> Result<Self> {
        let path = Path::new("jobrun.toml");
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<JobrunConfig>(&contents)?
        } else {
            Self::default()
        };

        // Environment variable takes precedence over the file.
        if let Ok(filter) = std::env::var("JOBRUN_LOG")
            && !filter.is_empty()
        {
            config.log_filter = filter;
        }

        Ok(config)
    }

    /// Retry policy derived from the configured values.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            backoff_multiplier: self.backoff_multiplier.max(1),
            ..Default::default()
        }
    }
}
