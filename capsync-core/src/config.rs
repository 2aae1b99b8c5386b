//! Programmatic configuration for transports and the coordinator.
//!
//! All durations are stored in milliseconds so the structs map one-to-one
//! onto a TOML file in the binaries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CapsyncError;

/// Default well-known TCP port.
pub const DEFAULT_PORT: u16 = 8080;

/// Everything a [`DeviceCoordinator`](crate::DeviceCoordinator) needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Identity of this participant; sent as `senderId` on every message.
    pub local_id: String,
    pub network: NetworkConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the server role binds to.
    pub bind_address: String,
    /// Port the server role listens on / the client role connects to.
    pub port: u16,
    /// Host the client role connects to.
    pub server_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Client: pause between reconnect attempts.
    pub reconnect_delay_ms: u64,
    /// Client: TCP connect deadline.
    pub connect_timeout_ms: u64,
    /// Both roles: deadline for the CONNECT / ACK exchange.
    pub handshake_timeout_ms: u64,
    /// Both roles: a send stuck longer than this fails and drops the link.
    pub write_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_initial_delay_ms: u64,
    /// Period of the liveness sweep.
    pub sweep_interval_ms: u64,
    /// Silence after which an endpoint becomes SUSPECT.
    pub suspect_after_ms: u64,
    /// Silence after which an endpoint becomes LOST.
    pub lost_after_ms: u64,
    /// Silence after which an endpoint is PERMANENTLY_LOST and evicted.
    pub evict_after_ms: u64,
    /// Delay between a new connection and its first clock sync.
    pub sync_settle_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            local_id: "coordinator".into(),
            network: NetworkConfig::default(),
            timing: TimingConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            server_address: "127.0.0.1".into(),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 5_000,
            connect_timeout_ms: 5_000,
            handshake_timeout_ms: 5_000,
            write_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_initial_delay_ms: 5_000,
            sweep_interval_ms: 5_000,
            suspect_after_ms: 60_000,
            lost_after_ms: 90_000,
            evict_after_ms: 150_000,
            sync_settle_ms: 1_000,
        }
    }
}

// ── Accessors / validation ───────────────────────────────────────

impl NetworkConfig {
    pub fn bind_socket(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn server_socket(&self) -> String {
        format!("{}:{}", self.server_address, self.port)
    }
}

impl TimingConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_initial_delay(&self) -> Duration {
        Duration::from_millis(self.heartbeat_initial_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn sync_settle(&self) -> Duration {
        Duration::from_millis(self.sync_settle_ms)
    }
}

impl CoordinatorConfig {
    /// Reject configurations that would spin or never classify liveness.
    pub fn validate(&self) -> Result<(), CapsyncError> {
        let t = &self.timing;
        let non_zero = [
            ("reconnect_delay_ms", t.reconnect_delay_ms),
            ("connect_timeout_ms", t.connect_timeout_ms),
            ("handshake_timeout_ms", t.handshake_timeout_ms),
            ("write_timeout_ms", t.write_timeout_ms),
            ("heartbeat_interval_ms", t.heartbeat_interval_ms),
            ("sweep_interval_ms", t.sweep_interval_ms),
            ("suspect_after_ms", t.suspect_after_ms),
        ];
        for (name, value) in non_zero {
            if value == 0 {
                return Err(CapsyncError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if !(t.suspect_after_ms < t.lost_after_ms && t.lost_after_ms < t.evict_after_ms) {
            return Err(CapsyncError::InvalidConfig(
                "thresholds must satisfy suspect < lost < evict".into(),
            ));
        }
        if self.local_id.trim().is_empty() {
            return Err(CapsyncError::InvalidConfig("local_id must not be empty".into()));
        }
        Ok(())
    }
}
