//! Error types for the capsync core.
//!
//! Nothing read from the wire is allowed to panic: decode failures surface
//! as [`DecodeError`], everything else as [`CapsyncError`]. Every failure is
//! scoped to one endpoint and reported to the caller.

use std::time::Duration;
use thiserror::Error;

/// Failure to turn a byte buffer into a [`Message`](crate::Message).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Buffer truncated, a length field out of bounds, invalid UTF-8, or an
    /// unknown message class.
    #[error("malformed message: {0}")]
    Malformed(&'static str),

    /// The type code does not name any [`CommandType`](crate::CommandType).
    #[error("unknown message type code: {0}")]
    UnknownType(i32),
}

/// The canonical error type for coordinator, transport and configuration
/// operations.
#[derive(Debug, Error)]
pub enum CapsyncError {
    // ── Protocol ─────────────────────────────────────────────────
    /// An inbound message could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The outer stream frame announced a length above the codec limit.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// The peer refused our CONNECT or sent something other than ACK.
    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    /// The peer broke protocol rules (e.g. first frame was not CONNECT).
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),

    // ── Connection ───────────────────────────────────────────────
    /// The TCP/IO layer reported an error.
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// No live connection exists for the endpoint.
    #[error("endpoint not connected: {0}")]
    NotConnected(String),

    /// The peer closed the stream before the exchange completed.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// The transport has not been started, or was stopped.
    #[error("transport not running")]
    NotRunning,

    // ── Configuration ────────────────────────────────────────────
    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl CapsyncError {
    /// Returns `true` for failures that mean the underlying socket is gone.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            CapsyncError::Connection(_)
                | CapsyncError::ConnectionClosed
                | CapsyncError::FrameTooLarge { .. }
        )
    }
}
