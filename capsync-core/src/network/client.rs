//! Client role: one outbound link to a single server, re-established
//! automatically after loss.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::CoordinatorConfig;
use crate::error::CapsyncError;
use crate::message::CommandType;
use crate::network::connection::{
    PeerLink, frame_reader, frame_writer, read_message, run_reader, write_message,
};
use crate::network::transport::{ListenerSlot, Transport, TransportListener, TransportRole};
use crate::protocol::{CommandMessage, Message};
use crate::state::LinkPhase;
use crate::task::WorkerSet;

pub struct ClientTransport {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    local_id: String,
    server: String,
    reconnect_delay: Duration,
    connect_timeout: Duration,
    handshake_timeout: Duration,
    write_timeout: Duration,
    clock: SharedClock,
    listeners: ListenerSlot,
    state: Mutex<ClientState>,
    next_serial: AtomicU64,
    running: AtomicBool,
    workers: WorkerSet,
}

#[derive(Default)]
struct ClientState {
    phase: LinkPhase,
    link: Option<Arc<PeerLink>>,
}

impl ClientState {
    /// Leave the connected phase. A local close parks in `Disconnecting`
    /// until [`finish_close`](Self::finish_close); peer-side loss drops
    /// straight to `Disconnected`. Returns how long the link was up.
    fn begin_close(&mut self, local: bool) -> Duration {
        let uptime = self.phase.connected_duration().unwrap_or_default();
        if !(local && self.phase.begin_disconnect().is_ok()) {
            self.phase.force_disconnect();
        }
        uptime
    }

    fn finish_close(&mut self) {
        if self.phase == LinkPhase::Disconnecting {
            let _ = self.phase.finish_disconnect();
        }
    }
}

impl ClientTransport {
    pub fn new(config: &CoordinatorConfig, clock: SharedClock) -> Self {
        Self::with_server(config, config.network.server_socket(), clock)
    }

    /// Like [`new`](Self::new) but targeting an explicit `host:port`.
    pub fn with_server(
        config: &CoordinatorConfig,
        server: impl Into<String>,
        clock: SharedClock,
    ) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                local_id: config.local_id.clone(),
                server: server.into(),
                reconnect_delay: config.timing.reconnect_delay(),
                connect_timeout: config.timing.connect_timeout(),
                handshake_timeout: config.timing.handshake_timeout(),
                write_timeout: config.timing.write_timeout(),
                clock,
                listeners: ListenerSlot::default(),
                state: Mutex::new(ClientState::default()),
                next_serial: AtomicU64::new(1),
                running: AtomicBool::new(false),
                workers: WorkerSet::new("client"),
            }),
        }
    }

    pub fn server_address(&self) -> &str {
        &self.inner.server
    }

    pub fn phase(&self) -> LinkPhase {
        self.inner.state.lock().phase.clone()
    }

    /// Identity the server announced in its ACK, while connected.
    pub fn server_id(&self) -> Option<String> {
        self.inner.current().map(|link| link.id().to_string())
    }
}

#[async_trait]
impl Transport for ClientTransport {
    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.inner.listeners.set(listener);
    }

    async fn initialize(&self) -> Result<(), CapsyncError> {
        if self.inner.server.trim().is_empty() {
            return Err(CapsyncError::InvalidConfig("server address is empty".into()));
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), CapsyncError> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.initialize().await?;
        self.inner.workers.reset();
        self.inner.running.store(true, Ordering::SeqCst);

        if let Err(e) = self.inner.clone().connect().await {
            warn!(server = %self.inner.server, error = %e, "initial connection failed, will retry");
        }
        let inner = self.inner.clone();
        self.inner.workers.spawn("reconnect", reconnect_loop(inner));
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.workers.shutdown().await;

        let link = {
            let mut state = self.inner.state.lock();
            state.begin_close(true);
            state.link.take()
        };
        if let Some(link) = link {
            link.close().await;
        }
        self.inner.state.lock().finish_close();
        info!(server = %self.inner.server, "client stopped");
    }

    async fn send_to(&self, endpoint_id: &str, message: &Message) -> Result<(), CapsyncError> {
        let link = self
            .inner
            .current()
            .filter(|link| link.id() == endpoint_id)
            .ok_or_else(|| CapsyncError::NotConnected(endpoint_id.to_string()))?;
        self.inner.send_on(&link, message).await
    }

    async fn broadcast(&self, message: &Message) -> usize {
        match self.inner.current() {
            Some(link) => usize::from(self.inner.send_on(&link, message).await.is_ok()),
            None => 0,
        }
    }

    fn is_connected(&self, endpoint_id: &str) -> bool {
        self.inner
            .current()
            .is_some_and(|link| link.id() == endpoint_id)
    }

    fn list_connected(&self) -> Vec<String> {
        self.inner
            .current()
            .map(|link| vec![link.id().to_string()])
            .unwrap_or_default()
    }

    async fn disconnect(&self, endpoint_id: &str) -> bool {
        let link = match self.inner.current() {
            Some(link) if link.id() == endpoint_id => link,
            _ => return false,
        };
        self.inner.drop_link(&link, "closed locally", None, true).await
    }

    fn role(&self) -> TransportRole {
        TransportRole::Client
    }
}

impl Drop for ClientTransport {
    fn drop(&mut self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.workers.cancel();
    }
}

impl ClientInner {
    fn current(&self) -> Option<Arc<PeerLink>> {
        self.state.lock().link.clone()
    }

    fn is_link_up(&self) -> bool {
        self.state.lock().link.is_some()
    }

    /// Tear down `link` if it is still current. Only the caller that wins
    /// the removal reports it. `local` marks a close we asked for.
    async fn drop_link(
        &self,
        link: &PeerLink,
        reason: &str,
        error: Option<&CapsyncError>,
        local: bool,
    ) -> bool {
        let uptime = {
            let mut state = self.state.lock();
            match &state.link {
                Some(current) if current.serial() == link.serial() => {
                    state.link = None;
                    Some(state.begin_close(local))
                }
                _ => None,
            }
        };
        let Some(uptime) = uptime else {
            return false;
        };

        link.close().await;
        if local {
            self.state.lock().finish_close();
        }
        info!(server = %link.id(), reason, uptime = ?uptime, "connection lost");
        if self.running.load(Ordering::SeqCst) {
            if let Some(listener) = self.listeners.get() {
                if let Some(e) = error {
                    listener.on_error(link.id(), e).await;
                }
                listener.on_disconnected(link.id(), reason).await;
            }
        }
        true
    }

    async fn send_on(&self, link: &Arc<PeerLink>, message: &Message) -> Result<(), CapsyncError> {
        match link.send(message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.drop_link(link, &e.to_string(), Some(&e), false).await;
                Err(e)
            }
        }
    }

    /// One connection attempt: TCP connect, CONNECT/ACK, then hand the read
    /// half to a reader worker.
    async fn connect(self: Arc<Self>) -> Result<(), CapsyncError> {
        self.state.lock().phase.begin_connect()?;

        match self.clone().establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                let mut state = self.state.lock();
                if state.link.is_none() && state.phase.finish_disconnect().is_err() {
                    state.phase.force_disconnect();
                }
                Err(e)
            }
        }
    }

    async fn establish(self: Arc<Self>) -> Result<(), CapsyncError> {
        debug!(server = %self.server, "connecting");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&self.server))
            .await
            .map_err(|_| CapsyncError::Timeout(self.connect_timeout))??;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let mut frames = frame_reader(reader);
        let mut sink = frame_writer(writer);

        self.state.lock().phase.begin_handshake()?;
        let hello = CommandMessage::new(
            CommandType::Connect,
            self.local_id.as_str(),
            self.clock.now_millis(),
            "",
            Vec::new(),
        );
        write_message(&mut sink, &hello.into()).await?;

        let reply = read_message(&mut frames, self.handshake_timeout).await?;
        let peer_id = match reply {
            Message::Response(r) if r.kind == CommandType::Ack && r.status.is_ok() => {
                if r.sender_id.trim().is_empty() {
                    self.server.clone()
                } else {
                    r.sender_id
                }
            }
            Message::Response(r) if r.kind == CommandType::Nack => {
                return Err(CapsyncError::HandshakeRejected(format!(
                    "{}: {}",
                    r.status, r.message
                )));
            }
            _ => {
                return Err(CapsyncError::ProtocolViolation(
                    "expected ACK or NACK in reply to CONNECT",
                ));
            }
        };

        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let link = Arc::new(PeerLink::new(
            peer_id.as_str(),
            serial,
            sink,
            self.write_timeout,
            self.workers.child_token(),
        ));
        {
            let mut state = self.state.lock();
            state.phase.complete_handshake(peer_id.as_str())?;
            state.link = Some(link.clone());
        }
        info!(server = %self.server, peer = %peer_id, "connected");

        if let Some(listener) = self.listeners.get() {
            listener.on_connected(&peer_id).await;
        }

        let inner = self.clone();
        self.workers.spawn("reader", async move {
            let cancel = link.cancel_token();
            let reason = run_reader(link.id(), &mut frames, &cancel, &inner.listeners).await;
            inner.drop_link(&link, &reason.describe(), None, false).await;
        });
        Ok(())
    }
}

async fn reconnect_loop(inner: Arc<ClientInner>) {
    loop {
        tokio::time::sleep(inner.reconnect_delay).await;
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        if inner.is_link_up() {
            continue;
        }
        match inner.clone().connect().await {
            Ok(()) => info!(server = %inner.server, "reconnected"),
            Err(e) => debug!(server = %inner.server, error = %e, "reconnect attempt failed"),
        }
    }
}
