//! # capsync-core
//!
//! Coordinates many remote capture endpoints from one controlling process.
//!
//! This crate contains:
//! - **Protocol types**: `Message` (command / response / sync), `CommandType`, `StatusCode`
//! - **Wire format**: big-endian `encode` / `decode` with typed `DecodeError`s
//! - **Codec**: `FrameCodec`, a length-prefixed outer frame for TCP via `tokio_util`
//! - **Network**: the `Transport` capability with `ServerTransport` and `ClientTransport`
//! - **Sync**: `TimeSyncEngine` (four-timestamp offset estimate) and sync markers
//! - **State**: `ConnectionMonitor` liveness classification and the client `LinkPhase`
//! - **Coordinator**: `DeviceCoordinator`, the composition root applications talk to
//! - **Error**: `CapsyncError` — typed, `thiserror`-based error hierarchy

pub mod clock;
pub mod codec;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod message;
pub mod network;
pub mod protocol;
pub mod state;
pub mod sync;
pub mod task;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use codec::{FrameCodec, MAX_FRAME_SIZE};
pub use config::{CoordinatorConfig, DEFAULT_PORT, NetworkConfig, TimingConfig};
pub use coordinator::{CoordinatorEvent, DeviceCoordinator, EndpointRecord};
pub use error::{CapsyncError, DecodeError};
pub use message::{CommandType, MessageClass, StatusCode};
pub use network::{ClientTransport, ServerTransport, Transport, TransportListener, TransportRole};
pub use protocol::{CommandMessage, DeviceStatus, Message, ResponseMessage, SyncMessage};
pub use state::{ConnectionMonitor, LinkPhase, Liveness, MonitorEvent, Thresholds};
pub use sync::{MarkerEvent, MarkerType, SyncSample, TimeSyncEngine};
pub use task::WorkerSet;
