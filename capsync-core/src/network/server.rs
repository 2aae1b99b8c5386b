//! Server role: accept many endpoints on one port.
//!
//! ```text
//!  acceptor ──accept──► handshake (one CONNECT within the deadline)
//!                          │ ok: ACK, register, on_connected
//!                          │ bad: NACK, close
//!                          ▼
//!                       reader loop ──► listener
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;
use crate::config::CoordinatorConfig;
use crate::error::CapsyncError;
use crate::message::{CommandType, StatusCode};
use crate::network::connection::{
    PeerLink, frame_reader, frame_writer, read_message, run_reader, write_message,
};
use crate::network::transport::{ListenerSlot, Transport, TransportListener, TransportRole};
use crate::protocol::{Message, ResponseMessage};
use crate::task::WorkerSet;

pub struct ServerTransport {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    local_id: String,
    bind: String,
    handshake_timeout: Duration,
    write_timeout: Duration,
    clock: SharedClock,
    listeners: ListenerSlot,
    socket: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    links: Mutex<HashMap<String, Arc<PeerLink>>>,
    next_serial: AtomicU64,
    running: AtomicBool,
    workers: WorkerSet,
}

impl ServerTransport {
    pub fn new(config: &CoordinatorConfig, clock: SharedClock) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                local_id: config.local_id.clone(),
                bind: config.network.bind_socket(),
                handshake_timeout: config.timing.handshake_timeout(),
                write_timeout: config.timing.write_timeout(),
                clock,
                listeners: ListenerSlot::default(),
                socket: Mutex::new(None),
                local_addr: Mutex::new(None),
                links: Mutex::new(HashMap::new()),
                next_serial: AtomicU64::new(1),
                running: AtomicBool::new(false),
                workers: WorkerSet::new("server"),
            }),
        }
    }

    /// Address actually bound; available after [`Transport::initialize`].
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Serve an already-established byte stream as if it had just been
    /// accepted.
    pub(crate) fn attach<R, W>(&self, reader: R, writer: W, peer: String)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let inner = self.inner.clone();
        self.inner
            .workers
            .spawn("connection", serve_connection(inner, reader, writer, peer));
    }
}

#[async_trait]
impl Transport for ServerTransport {
    fn set_listener(&self, listener: Arc<dyn TransportListener>) {
        self.inner.listeners.set(listener);
    }

    async fn initialize(&self) -> Result<(), CapsyncError> {
        if self.inner.socket.lock().is_some() {
            return Ok(());
        }
        let socket = TcpListener::bind(&self.inner.bind).await?;
        let addr = socket.local_addr()?;
        info!(addr = %addr, "server listening");
        *self.inner.local_addr.lock() = Some(addr);
        *self.inner.socket.lock() = Some(socket);
        Ok(())
    }

    async fn start(&self) -> Result<(), CapsyncError> {
        if self.inner.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.initialize().await?;
        let socket = self
            .inner
            .socket
            .lock()
            .take()
            .ok_or(CapsyncError::NotRunning)?;

        self.inner.workers.reset();
        self.inner.running.store(true, Ordering::SeqCst);
        let inner = self.inner.clone();
        self.inner.workers.spawn("acceptor", accept_loop(inner, socket));
        Ok(())
    }

    async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.workers.shutdown().await;

        let links: Vec<_> = self.inner.links.lock().drain().map(|(_, l)| l).collect();
        for link in links {
            link.close().await;
        }
        *self.inner.socket.lock() = None;
        *self.inner.local_addr.lock() = None;
        info!("server stopped");
    }

    async fn send_to(&self, endpoint_id: &str, message: &Message) -> Result<(), CapsyncError> {
        let link = self
            .inner
            .link(endpoint_id)
            .ok_or_else(|| CapsyncError::NotConnected(endpoint_id.to_string()))?;
        self.inner.send_on(&link, message).await
    }

    async fn broadcast(&self, message: &Message) -> usize {
        let links: Vec<_> = self.inner.links.lock().values().cloned().collect();
        let sends = links.iter().map(|link| self.inner.send_on(link, message));
        futures::future::join_all(sends)
            .await
            .into_iter()
            .filter(Result::is_ok)
            .count()
    }

    fn is_connected(&self, endpoint_id: &str) -> bool {
        self.inner.links.lock().contains_key(endpoint_id)
    }

    fn list_connected(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.links.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn disconnect(&self, endpoint_id: &str) -> bool {
        let Some(link) = self.inner.links.lock().remove(endpoint_id) else {
            return false;
        };
        link.close().await;
        info!(endpoint = %endpoint_id, "endpoint disconnected locally");
        if let Some(listener) = self.inner.listeners.get() {
            listener.on_disconnected(endpoint_id, "closed locally").await;
        }
        true
    }

    fn role(&self) -> TransportRole {
        TransportRole::Server
    }
}

impl Drop for ServerTransport {
    fn drop(&mut self) {
        // Workers hold the inner state alive; cancel them so the port closes.
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.workers.cancel();
    }
}

impl ServerInner {
    fn link(&self, id: &str) -> Option<Arc<PeerLink>> {
        self.links.lock().get(id).cloned()
    }

    /// Unregister `link` only if it is still the current link for its id.
    fn remove_if_current(&self, link: &PeerLink) -> bool {
        let mut links = self.links.lock();
        match links.get(link.id()) {
            Some(current) if current.serial() == link.serial() => {
                links.remove(link.id());
                true
            }
            _ => false,
        }
    }

    async fn send_on(&self, link: &Arc<PeerLink>, message: &Message) -> Result<(), CapsyncError> {
        match link.send(message).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.remove_if_current(link) {
                    link.close().await;
                    warn!(endpoint = %link.id(), error = %e, "send failed, dropping endpoint");
                    if let Some(listener) = self.listeners.get() {
                        listener.on_error(link.id(), &e).await;
                        listener.on_disconnected(link.id(), &e.to_string()).await;
                    }
                }
                Err(e)
            }
        }
    }
}

async fn accept_loop(inner: Arc<ServerInner>, socket: TcpListener) {
    loop {
        match socket.accept().await {
            Ok((stream, addr)) => {
                debug!(peer = %addr, "accepted connection");
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                let conn = serve_connection(inner.clone(), reader, writer, addr.to_string());
                inner.workers.spawn("connection", conn);
            }
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning.
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn serve_connection<R, W>(inner: Arc<ServerInner>, reader: R, writer: W, peer: String)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let mut frames = frame_reader(reader);
    let mut sink = frame_writer(writer);

    let hello = match read_message(&mut frames, inner.handshake_timeout).await {
        Ok(message) => message,
        Err(e) => {
            warn!(peer = %peer, error = %e, "handshake failed");
            return;
        }
    };

    let endpoint_id = match &hello {
        Message::Command(cmd)
            if cmd.kind == CommandType::Connect && !cmd.sender_id.trim().is_empty() =>
        {
            cmd.sender_id.clone()
        }
        other => {
            warn!(peer = %peer, kind = %other.kind(), "rejecting handshake");
            let nack = ResponseMessage::nack(
                inner.local_id.as_str(),
                inner.clock.now_millis(),
                StatusCode::ErrorInvalidCommand,
                "Invalid device ID",
            );
            let _ = write_message(&mut sink, &nack.into()).await;
            // Dropping both halves closes the socket.
            return;
        }
    };

    let ack = ResponseMessage::ack(
        inner.local_id.as_str(),
        inner.clock.now_millis(),
        "Connection accepted",
    );
    if let Err(e) = write_message(&mut sink, &ack.into()).await {
        warn!(peer = %peer, endpoint = %endpoint_id, error = %e, "failed to send ACK");
        return;
    }

    let serial = inner.next_serial.fetch_add(1, Ordering::Relaxed);
    let link = Arc::new(PeerLink::new(
        endpoint_id.as_str(),
        serial,
        sink,
        inner.write_timeout,
        inner.workers.child_token(),
    ));
    if let Some(previous) = inner.links.lock().insert(endpoint_id.clone(), link.clone()) {
        info!(endpoint = %endpoint_id, "endpoint reconnected, replacing previous link");
        previous.cancel_token().cancel();
    }
    info!(peer = %peer, endpoint = %endpoint_id, "endpoint connected");

    if let Some(listener) = inner.listeners.get() {
        listener.on_connected(&endpoint_id).await;
    }

    let cancel = link.cancel_token();
    let reason = run_reader(&endpoint_id, &mut frames, &cancel, &inner.listeners).await;

    if inner.remove_if_current(&link) {
        link.close().await;
        info!(endpoint = %endpoint_id, reason = %reason.describe(), "endpoint disconnected");
        if inner.running.load(Ordering::SeqCst) {
            if let Some(listener) = inner.listeners.get() {
                listener.on_disconnected(&endpoint_id, &reason.describe()).await;
            }
        }
    }
}
