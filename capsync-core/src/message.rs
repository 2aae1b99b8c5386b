//! Command, status and message-class codes.
//!
//! Integer codes are part of the wire format and must never be renumbered.

use crate::error::DecodeError;
use std::fmt;

// ── CommandType ──────────────────────────────────────────────────

/// All message types understood by the protocol.
///
/// Organized by category:
/// - `1..=3`     — Recording control
/// - `101..=103` — Clock synchronization
/// - `201..=203` — Connection management
/// - `301..=303` — Acknowledgment and errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandType {
    // ── Control ──────────────────────────────────────────────────
    /// Start recording on the endpoint.
    Start = 1,
    /// Stop recording on the endpoint.
    Stop = 2,
    /// Query battery, storage and stream state.
    StatusQuery = 3,

    // ── Sync ─────────────────────────────────────────────────────
    /// Clock sync request carrying the origin timestamp.
    SyncPing = 101,
    /// Clock sync reply carrying all three timestamps.
    SyncPong = 102,
    /// Event marker broadcast during a recording.
    SyncMarker = 103,

    // ── Connection ───────────────────────────────────────────────
    /// Handshake request.
    Connect = 201,
    /// Graceful disconnect.
    Disconnect = 202,
    /// Keep-alive.
    Heartbeat = 203,

    // ── Acknowledgment ───────────────────────────────────────────
    Ack = 301,
    Nack = 302,
    Error = 303,
}

impl CommandType {
    /// Every variant, in code order.
    pub const ALL: [CommandType; 12] = [
        CommandType::Start,
        CommandType::Stop,
        CommandType::StatusQuery,
        CommandType::SyncPing,
        CommandType::SyncPong,
        CommandType::SyncMarker,
        CommandType::Connect,
        CommandType::Disconnect,
        CommandType::Heartbeat,
        CommandType::Ack,
        CommandType::Nack,
        CommandType::Error,
    ];

    /// The stable wire code.
    pub fn code(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for CommandType {
    type Error = DecodeError;

    fn try_from(value: i32) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(CommandType::Start),
            2 => Ok(CommandType::Stop),
            3 => Ok(CommandType::StatusQuery),

            101 => Ok(CommandType::SyncPing),
            102 => Ok(CommandType::SyncPong),
            103 => Ok(CommandType::SyncMarker),

            201 => Ok(CommandType::Connect),
            202 => Ok(CommandType::Disconnect),
            203 => Ok(CommandType::Heartbeat),

            301 => Ok(CommandType::Ack),
            302 => Ok(CommandType::Nack),
            303 => Ok(CommandType::Error),

            other => Err(DecodeError::UnknownType(other)),
        }
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandType::Start => "START",
            CommandType::Stop => "STOP",
            CommandType::StatusQuery => "STATUS_QUERY",
            CommandType::SyncPing => "SYNC_PING",
            CommandType::SyncPong => "SYNC_PONG",
            CommandType::SyncMarker => "SYNC_MARKER",
            CommandType::Connect => "CONNECT",
            CommandType::Disconnect => "DISCONNECT",
            CommandType::Heartbeat => "HEARTBEAT",
            CommandType::Ack => "ACK",
            CommandType::Nack => "NACK",
            CommandType::Error => "ERROR",
        };
        f.write_str(name)
    }
}

// ── StatusCode ───────────────────────────────────────────────────

/// Outcome carried by a [`ResponseMessage`](crate::ResponseMessage).
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StatusCode {
    #[default]
    Ok = 0,
    ErrorGeneral = 1,
    ErrorNotConnected = 2,
    ErrorBusy = 3,
    ErrorTimeout = 4,
    ErrorInvalidCommand = 5,
}

impl StatusCode {
    /// The stable wire code.
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Map a wire code to a status. Unknown codes become
    /// [`StatusCode::ErrorGeneral`] so that a newer peer's status never
    /// makes a whole response undecodable.
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => StatusCode::Ok,
            2 => StatusCode::ErrorNotConnected,
            3 => StatusCode::ErrorBusy,
            4 => StatusCode::ErrorTimeout,
            5 => StatusCode::ErrorInvalidCommand,
            _ => StatusCode::ErrorGeneral,
        }
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StatusCode::Ok => "OK",
            StatusCode::ErrorGeneral => "ERROR_GENERAL",
            StatusCode::ErrorNotConnected => "ERROR_NOT_CONNECTED",
            StatusCode::ErrorBusy => "ERROR_BUSY",
            StatusCode::ErrorTimeout => "ERROR_TIMEOUT",
            StatusCode::ErrorInvalidCommand => "ERROR_INVALID_COMMAND",
        };
        f.write_str(s)
    }
}

// ── MessageClass ─────────────────────────────────────────────────

/// Discriminates the three message layouts on the wire.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    Command = 1,
    Response = 2,
    Sync = 3,
}

impl TryFrom<i32> for MessageClass {
    type Error = DecodeError;

    fn try_from(value: i32) -> Result<Self, DecodeError> {
        match value {
            1 => Ok(MessageClass::Command),
            2 => Ok(MessageClass::Response),
            3 => Ok(MessageClass::Sync),
            _ => Err(DecodeError::Malformed("unknown message class")),
        }
    }
}
