//! Role-agnostic transport capability and its listener.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::CapsyncError;
use crate::protocol::Message;

/// Receives transport events. Implemented by
/// [`DeviceCoordinator`](crate::DeviceCoordinator).
///
/// For one endpoint, calls arrive in wire order from a single reader.
/// `on_disconnected` fires exactly once per registered connection, and never
/// for connections torn down by [`Transport::stop`].
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Handshake completed for `endpoint_id`.
    async fn on_connected(&self, endpoint_id: &str);

    /// The connection for `endpoint_id` is gone.
    async fn on_disconnected(&self, endpoint_id: &str, reason: &str);

    /// A decoded message arrived on the connection registered as
    /// `endpoint_id`.
    async fn on_message_received(&self, endpoint_id: &str, message: Message);

    /// A failure scoped to `endpoint_id`. Decode failures arrive here
    /// without closing the connection.
    async fn on_error(&self, endpoint_id: &str, error: &CapsyncError);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportRole {
    Server,
    Client,
}

impl fmt::Display for TransportRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportRole::Server => f.write_str("server"),
            TransportRole::Client => f.write_str("client"),
        }
    }
}

/// Moves messages between this participant and its peers.
///
/// All methods are safe to call concurrently. Sends to a single endpoint are
/// serialized so frames never interleave on a socket.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Install the event sink. Replaces any previous listener.
    fn set_listener(&self, listener: Arc<dyn TransportListener>);

    /// Acquire resources (the server binds its port here). Idempotent.
    async fn initialize(&self) -> Result<(), CapsyncError>;

    /// Begin accepting (server) or connecting (client). Calls
    /// [`initialize`](Self::initialize) when needed.
    async fn start(&self) -> Result<(), CapsyncError>;

    /// Stop all workers and force-close every socket. Fires no events.
    async fn stop(&self);

    /// Send to one endpoint. Fails with `NotConnected` without blocking when
    /// no connection exists. A write failure drops the connection and fires
    /// `on_disconnected` before returning the error.
    async fn send_to(&self, endpoint_id: &str, message: &Message) -> Result<(), CapsyncError>;

    /// Send to every connected endpoint; returns how many sends succeeded.
    async fn broadcast(&self, message: &Message) -> usize;

    fn is_connected(&self, endpoint_id: &str) -> bool;

    fn list_connected(&self) -> Vec<String>;

    /// Close one connection locally. Returns whether it existed.
    async fn disconnect(&self, endpoint_id: &str) -> bool;

    fn role(&self) -> TransportRole;

    fn transport_type(&self) -> &'static str {
        "TCP"
    }
}

/// Shared, swappable listener reference.
#[derive(Default)]
pub(crate) struct ListenerSlot(RwLock<Option<Arc<dyn TransportListener>>>);

impl ListenerSlot {
    pub(crate) fn set(&self, listener: Arc<dyn TransportListener>) {
        *self.0.write() = Some(listener);
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn TransportListener>> {
        self.0.read().clone()
    }
}
