//! Typed protocol messages.
//!
//! Every constructor takes its creation timestamp explicitly, so decoding a
//! message off the wire builds exactly the value that was sent. Use
//! [`Clock`](crate::Clock) to obtain "now" when building outbound messages.

pub mod status;
pub mod wire;

use crate::message::{CommandType, MessageClass, StatusCode};

pub use status::DeviceStatus;
pub use wire::{decode, encode};

// ── Variants ─────────────────────────────────────────────────────

/// A control command: START, STOP, STATUS_QUERY, CONNECT, HEARTBEAT, ...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMessage {
    pub kind: CommandType,
    pub timestamp: i64,
    pub sender_id: String,
    /// Recording session; empty before a session exists.
    pub session_id: String,
    pub parameters: Vec<String>,
}

/// An acknowledgment or status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMessage {
    pub kind: CommandType,
    pub timestamp: i64,
    pub sender_id: String,
    pub status: StatusCode,
    pub message: String,
    /// Positional payload; for status reports see [`DeviceStatus`].
    pub data: Vec<String>,
}

/// A clock sync ping or pong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncMessage {
    pub kind: CommandType,
    pub timestamp: i64,
    pub sender_id: String,
    /// Initiator wall clock when the ping was created (T1).
    pub origin_timestamp: i64,
    /// Responder wall clock when the ping arrived (T2).
    pub receive_timestamp: i64,
    /// Responder wall clock when the pong was sent (T3).
    pub transmit_timestamp: i64,
}

impl CommandMessage {
    pub fn new(
        kind: CommandType,
        sender_id: impl Into<String>,
        timestamp: i64,
        session_id: impl Into<String>,
        parameters: Vec<String>,
    ) -> Self {
        Self {
            kind,
            timestamp,
            sender_id: sender_id.into(),
            session_id: session_id.into(),
            parameters,
        }
    }
}

impl ResponseMessage {
    pub fn new(
        kind: CommandType,
        sender_id: impl Into<String>,
        timestamp: i64,
        status: StatusCode,
        message: impl Into<String>,
        data: Vec<String>,
    ) -> Self {
        Self {
            kind,
            timestamp,
            sender_id: sender_id.into(),
            status,
            message: message.into(),
            data,
        }
    }

    /// ACK with status OK, as sent by the accepting side of a handshake.
    pub fn ack(sender_id: impl Into<String>, timestamp: i64, message: impl Into<String>) -> Self {
        Self::new(CommandType::Ack, sender_id, timestamp, StatusCode::Ok, message, Vec::new())
    }

    /// NACK with the given failure status.
    pub fn nack(
        sender_id: impl Into<String>,
        timestamp: i64,
        status: StatusCode,
        message: impl Into<String>,
    ) -> Self {
        Self::new(CommandType::Nack, sender_id, timestamp, status, message, Vec::new())
    }
}

impl SyncMessage {
    pub fn new(
        kind: CommandType,
        sender_id: impl Into<String>,
        timestamp: i64,
        origin_timestamp: i64,
        receive_timestamp: i64,
        transmit_timestamp: i64,
    ) -> Self {
        Self {
            kind,
            timestamp,
            sender_id: sender_id.into(),
            origin_timestamp,
            receive_timestamp,
            transmit_timestamp,
        }
    }
}

// ── Message ──────────────────────────────────────────────────────

/// Any protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Command(CommandMessage),
    Response(ResponseMessage),
    Sync(SyncMessage),
}

impl Message {
    pub fn kind(&self) -> CommandType {
        match self {
            Message::Command(m) => m.kind,
            Message::Response(m) => m.kind,
            Message::Sync(m) => m.kind,
        }
    }

    /// Sender wall clock at creation, in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        match self {
            Message::Command(m) => m.timestamp,
            Message::Response(m) => m.timestamp,
            Message::Sync(m) => m.timestamp,
        }
    }

    pub fn sender_id(&self) -> &str {
        match self {
            Message::Command(m) => &m.sender_id,
            Message::Response(m) => &m.sender_id,
            Message::Sync(m) => &m.sender_id,
        }
    }

    pub fn class(&self) -> MessageClass {
        match self {
            Message::Command(_) => MessageClass::Command,
            Message::Response(_) => MessageClass::Response,
            Message::Sync(_) => MessageClass::Sync,
        }
    }

    pub fn as_command(&self) -> Option<&CommandMessage> {
        match self {
            Message::Command(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_response(&self) -> Option<&ResponseMessage> {
        match self {
            Message::Response(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_sync(&self) -> Option<&SyncMessage> {
        match self {
            Message::Sync(m) => Some(m),
            _ => None,
        }
    }
}

impl From<CommandMessage> for Message {
    fn from(m: CommandMessage) -> Self {
        Message::Command(m)
    }
}

impl From<ResponseMessage> for Message {
    fn from(m: ResponseMessage) -> Self {
        Message::Response(m)
    }
}

impl From<SyncMessage> for Message {
    fn from(m: SyncMessage) -> Self {
        Message::Sync(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_see_through_variants() {
        let msg: Message = CommandMessage::new(
            CommandType::Start,
            "hub",
            1_000,
            "session-1",
            vec!["gsr".into()],
        )
        .into();
        assert_eq!(msg.kind(), CommandType::Start);
        assert_eq!(msg.timestamp(), 1_000);
        assert_eq!(msg.sender_id(), "hub");
        assert_eq!(msg.class(), MessageClass::Command);
        assert!(msg.as_command().is_some());
        assert!(msg.as_sync().is_none());
    }

    #[test]
    fn handshake_replies() {
        let ack = ResponseMessage::ack("hub", 5, "Connection accepted");
        assert_eq!(ack.kind, CommandType::Ack);
        assert!(ack.status.is_ok());

        let nack = ResponseMessage::nack("hub", 5, StatusCode::ErrorInvalidCommand, "bad id");
        assert_eq!(nack.kind, CommandType::Nack);
        assert_eq!(nack.status, StatusCode::ErrorInvalidCommand);
    }
}
