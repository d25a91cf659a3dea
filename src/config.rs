use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Runtime settings for a chat backend.
///
/// Every field has a default, so an empty TOML file is a valid config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    /// SQLite file backing the graph. `None` keeps everything in memory.
    pub data_path: Option<PathBuf>,
    /// Where `login` remembers the signed-in key pair.
    pub session_path: Option<PathBuf>,
    pub stream: StreamConfig,
    pub retry: RetryConfig,
    /// PBKDF2 rounds protecting new accounts.
    pub work_rounds: u32,
    pub log_filter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Delay before a stream that never resolved emits an empty value.
    /// Zero disables the synthetic emission.
    pub timeout_ms: u64,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            data_path: None,
            session_path: None,
            stream: StreamConfig::default(),
            retry: RetryConfig::default(),
            work_rounds: crate::backend::crypto::WORK_ROUNDS,
            log_filter: "info".to_string(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            debounce_ms: 100,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 7,
            delay_ms: 250,
        }
    }
}

impl ChatConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn stream_timeout(&self) -> Option<Duration> {
        match self.stream.timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.stream.debounce_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry.delay_ms)
    }
}
