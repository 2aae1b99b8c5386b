//! Lifecycle of the client side of a link.
//!
//! The client transport moves through these phases on every connection
//! attempt; invalid transitions return `Err` instead of panicking so a
//! racing stop or drop shows up as a logged protocol violation.

use std::time::{Duration, Instant};

use crate::error::CapsyncError;

/// Phase of an outbound link.
///
/// ```text
///  Disconnected ──► Connecting ──► Handshaking ──► Connected
///       ▲                │               │              │
///       │                ▼               ▼              ▼
///       └──────── Disconnecting ◄────────┴──────────────┘
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LinkPhase {
    #[default]
    Disconnected,

    /// TCP connect in flight.
    Connecting,

    /// Socket up, CONNECT sent, waiting for ACK.
    Handshaking,

    /// ACK received from `peer_id`.
    Connected { peer_id: String, since: Instant },

    /// Local close in progress.
    Disconnecting,
}

impl std::fmt::Display for LinkPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Connected { peer_id, .. } => write!(f, "Connected({peer_id})"),
            Self::Disconnecting => write!(f, "Disconnecting"),
        }
    }
}

impl LinkPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Identity the server announced in its ACK.
    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Self::Connected { peer_id, .. } => Some(peer_id),
            _ => None,
        }
    }

    pub fn connected_duration(&self) -> Option<Duration> {
        match self {
            Self::Connected { since, .. } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Disconnected`.
    pub fn begin_connect(&mut self) -> Result<(), CapsyncError> {
        match self {
            Self::Disconnected => {
                *self = Self::Connecting;
                Ok(())
            }
            _ => Err(CapsyncError::ProtocolViolation(
                "cannot connect: link is not disconnected",
            )),
        }
    }

    /// Valid from: `Connecting`.
    pub fn begin_handshake(&mut self) -> Result<(), CapsyncError> {
        match self {
            Self::Connecting => {
                *self = Self::Handshaking;
                Ok(())
            }
            _ => Err(CapsyncError::ProtocolViolation(
                "cannot handshake: link is not connecting",
            )),
        }
    }

    /// Valid from: `Handshaking`.
    pub fn complete_handshake(&mut self, peer_id: impl Into<String>) -> Result<(), CapsyncError> {
        match self {
            Self::Handshaking => {
                *self = Self::Connected {
                    peer_id: peer_id.into(),
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(CapsyncError::ProtocolViolation(
                "cannot complete handshake: link is not handshaking",
            )),
        }
    }

    /// Valid from: `Handshaking`, `Connected`.
    pub fn begin_disconnect(&mut self) -> Result<(), CapsyncError> {
        match self {
            Self::Handshaking | Self::Connected { .. } => {
                *self = Self::Disconnecting;
                Ok(())
            }
            _ => Err(CapsyncError::ProtocolViolation(
                "cannot disconnect: link is not up",
            )),
        }
    }

    /// Valid from: `Disconnecting`, or `Connecting` / `Handshaking` after a
    /// failed attempt.
    pub fn finish_disconnect(&mut self) -> Result<(), CapsyncError> {
        match self {
            Self::Disconnecting | Self::Connecting | Self::Handshaking => {
                *self = Self::Disconnected;
                Ok(())
            }
            _ => Err(CapsyncError::ProtocolViolation(
                "cannot finish disconnect: link is not closing",
            )),
        }
    }

    /// Drop to `Disconnected` from anywhere, e.g. after a read error.
    /// Returns the previous phase.
    pub fn force_disconnect(&mut self) -> LinkPhase {
        std::mem::take(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_lifecycle() {
        let mut phase = LinkPhase::default();
        assert!(phase.is_disconnected());

        phase.begin_connect().unwrap();
        phase.begin_handshake().unwrap();
        assert_eq!(phase, LinkPhase::Handshaking);
        assert!(phase.peer_id().is_none());

        phase.complete_handshake("hub").unwrap();
        assert!(phase.is_connected());
        assert_eq!(phase.peer_id(), Some("hub"));
        assert!(phase.connected_duration().is_some());

        phase.begin_disconnect().unwrap();
        phase.finish_disconnect().unwrap();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn failed_attempt_returns_to_disconnected() {
        let mut phase = LinkPhase::Connecting;
        phase.finish_disconnect().unwrap();
        assert!(phase.is_disconnected());

        let mut phase = LinkPhase::Handshaking;
        phase.finish_disconnect().unwrap();
        assert!(phase.is_disconnected());
    }

    #[test]
    fn invalid_transitions_are_errors() {
        let mut phase = LinkPhase::Disconnected;
        assert!(phase.begin_handshake().is_err());
        assert!(phase.complete_handshake("hub").is_err());
        assert!(phase.begin_disconnect().is_err());

        let mut phase = LinkPhase::Connected {
            peer_id: "hub".into(),
            since: Instant::now(),
        };
        assert!(matches!(
            phase.begin_connect(),
            Err(CapsyncError::ProtocolViolation(_))
        ));
        assert!(phase.finish_disconnect().is_err());
    }

    #[test]
    fn force_disconnect_reports_previous_phase() {
        let mut phase = LinkPhase::Connected {
            peer_id: "hub".into(),
            since: Instant::now(),
        };
        let previous = phase.force_disconnect();
        assert_eq!(previous.peer_id(), Some("hub"));
        assert!(phase.is_disconnected());
    }

    #[test]
    fn display_format() {
        assert_eq!(LinkPhase::Connecting.to_string(), "Connecting");
        let phase = LinkPhase::Connected {
            peer_id: "hub".into(),
            since: Instant::now(),
        };
        assert_eq!(phase.to_string(), "Connected(hub)");
    }
}
