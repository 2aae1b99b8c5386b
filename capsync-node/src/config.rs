//! Configuration for a capture node.

use std::path::Path;

use capsync_core::CoordinatorConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity, hub address and timing.
    pub coordinator: CoordinatorConfig,
    /// What this node reports about itself.
    pub device: DeviceConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Reported battery level, e.g. "87".
    pub battery_level: String,
    /// Reported free storage, e.g. "32GB".
    pub storage_remaining: String,
    /// Streams started by START and stopped by STOP.
    pub streams: Vec<String>,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NodeConfig {
    fn default() -> Self {
        let mut coordinator = CoordinatorConfig::default();
        coordinator.local_id = "node-1".into();
        Self {
            coordinator,
            device: DeviceConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            battery_level: "100".into(),
            storage_remaining: "32GB".into(),
            streams: vec!["gsr".into(), "rgb".into(), "thermal".into()],
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl NodeConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }
}
