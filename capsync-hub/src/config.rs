//! Configuration for the hub.

use std::path::Path;

use capsync_core::CoordinatorConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Identity, listening address and timing.
    pub coordinator: CoordinatorConfig,
    /// Periodic work the hub performs on connected devices.
    pub schedule: ScheduleConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Broadcast STATUS_QUERY this often; 0 disables it.
    pub status_poll_interval_ms: u64,
    /// Broadcast a PERIODIC sync marker this often; 0 disables it.
    pub marker_interval_ms: u64,
    /// Re-sync every device's clock this often; 0 disables it.
    pub resync_interval_ms: u64,
    /// Session id stamped on scheduled commands.
    pub session_id: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for HubConfig {
    fn default() -> Self {
        let mut coordinator = CoordinatorConfig::default();
        coordinator.local_id = "hub".into();
        Self {
            coordinator,
            schedule: ScheduleConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            status_poll_interval_ms: 10_000,
            marker_interval_ms: 0,
            resync_interval_ms: 60_000,
            session_id: String::new(),
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

impl HubConfig {
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
