//! Core configuration, loadable from TOML or JSON files.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocol::MAX_FRAME_SIZE;
use crate::timer::TimerConfig;

/// Configuration of a [`Core`](crate::Core) and its connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Timer wheel settings.
    pub timer: TimerConfig,
    /// Default key-value request timeout in milliseconds (default: 2500).
    pub kv_timeout_ms: u64,
    /// Connection timeout in milliseconds (default: 5000).
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (default: true).
    pub nodelay: bool,
    /// Largest inbound frame accepted, header included (default: 25 MiB).
    pub max_frame_size: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            timer: TimerConfig::default(),
            kv_timeout_ms: 2500,
            connect_timeout_ms: 5000,
            nodelay: true,
            max_frame_size: MAX_FRAME_SIZE,
        }
    }
}

impl CoreConfig {
    /// Loads a configuration file, picking the format from its extension.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Default key-value timeout.
    pub fn kv_timeout(&self) -> Duration {
        Duration::from_millis(self.kv_timeout_ms)
    }

    /// Connection timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
