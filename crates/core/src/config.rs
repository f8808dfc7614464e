//! Engine configuration.

use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::Retry;
use crate::{InfinityError, Result};

/// Triples backend selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Redb,
    Sqlite,
}

impl FromStr for Backend {
    type Err = InfinityError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redb" => Ok(Backend::Redb),
            "sqlite" => Ok(Backend::Sqlite),
            other => Err(InfinityError::InvalidArgument(format!(
                "unknown backend '{other}', expected 'redb' or 'sqlite'"
            ))),
        }
    }
}

fn default_workers() -> usize {
    20
}

fn default_retries() -> u32 {
    5
}

fn default_backoff_ms() -> u64 {
    10
}

fn default_cursor_ttl_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the index, the triples database and the stash.
    pub root: PathBuf,
    #[serde(default)]
    pub backend: Backend,
    /// Mux worker threads.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Attempts per notice and per busy database call.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// First retry delay; doubles on every attempt up to one second.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Idle time after which an abandoned query cursor is reclaimed.
    #[serde(default = "default_cursor_ttl_secs")]
    pub cursor_ttl_secs: u64,
    /// Promote drafts to a new baseline on every flush.
    #[serde(default = "default_true")]
    pub baseline_on_flush: bool,
}

impl Config {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            backend: Backend::default(),
            workers: default_workers(),
            retries: default_retries(),
            backoff_ms: default_backoff_ms(),
            cursor_ttl_secs: default_cursor_ttl_secs(),
            baseline_on_flush: true,
        }
    }

    /// Reads a JSON config file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|e| {
            InfinityError::InvalidArgument(format!("{}: {e}", path.as_ref().display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads `INFINITY_DIR` (required), `INFINITY_BACKEND`,
    /// `INFINITY_WORKERS` and `INFINITY_RETRIES`.
    pub fn from_env() -> Result<Self> {
        let root = env::var("INFINITY_DIR")
            .map_err(|_| InfinityError::InvalidArgument("INFINITY_DIR is not set".into()))?;
        let mut config = Self::new(root);
        if let Ok(backend) = env::var("INFINITY_BACKEND") {
            config.backend = backend.parse()?;
        }
        if let Ok(workers) = env::var("INFINITY_WORKERS") {
            config.workers = parse_var("INFINITY_WORKERS", &workers)?;
        }
        if let Ok(retries) = env::var("INFINITY_RETRIES") {
            config.retries = parse_var("INFINITY_RETRIES", &retries)?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.root.as_os_str().is_empty() {
            return Err(InfinityError::InvalidArgument("root is empty".into()));
        }
        if self.workers == 0 {
            return Err(InfinityError::InvalidArgument(
                "workers must be at least 1".into(),
            ));
        }
        if self.retries == 0 {
            return Err(InfinityError::InvalidArgument(
                "retries must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn retry(&self) -> Retry {
        Retry {
            attempts: self.retries,
            initial: Duration::from_millis(self.backoff_ms),
            cap: Duration::from_secs(1),
        }
    }

    pub fn cursor_ttl(&self) -> Duration {
        Duration::from_secs(self.cursor_ttl_secs)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| InfinityError::InvalidArgument(format!("{name}='{value}' is not valid")))
}
