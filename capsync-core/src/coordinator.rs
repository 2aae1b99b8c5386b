//! The composition root: one [`Transport`], the endpoint registry and the
//! liveness monitor, surfaced to the application as [`CoordinatorEvent`]s.
//!
//! ```text
//!  application ──send_command/broadcast/sync_with──► DeviceCoordinator ──► Transport ──► wire
//!  application ◄──────────── CoordinatorEvent ────── DeviceCoordinator ◄── Transport ◄── wire
//!                                                          ▲
//!                                       sweep timer ───────┘ (ConnectionMonitor)
//! ```
//!
//! The registry and the monitor sit behind one mutex that is never held
//! across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

use crate::clock::{SharedClock, SystemClock};
use crate::config::CoordinatorConfig;
use crate::error::CapsyncError;
use crate::message::{CommandType, StatusCode};
use crate::network::{ClientTransport, ServerTransport, Transport, TransportListener};
use crate::protocol::{CommandMessage, DeviceStatus, Message, ResponseMessage, SyncMessage};
use crate::state::{ConnectionMonitor, Liveness, MonitorEvent, Thresholds};
use crate::sync::marker::{self, MarkerEvent, MarkerType};
use crate::sync::{TimeSyncEngine, answer_ping};
use crate::task::WorkerSet;

// ── Public types ─────────────────────────────────────────────────

/// Notifications delivered to the owning application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    DeviceConnected {
        endpoint_id: String,
    },
    DeviceDisconnected {
        endpoint_id: String,
        reason: String,
    },
    /// Any message not consumed internally (heartbeats, pings and pongs
    /// are). Status reports are applied to the registry and still forwarded.
    MessageReceived {
        endpoint_id: String,
        message: Message,
    },
    SyncCompleted {
        endpoint_id: String,
        offset_millis: i64,
        round_trip_millis: i64,
    },
    ConnectionLost {
        endpoint_id: String,
    },
    ConnectionRecovered {
        endpoint_id: String,
    },
    /// Terminal. The endpoint has been evicted and its socket closed.
    ConnectionPermanentlyLost {
        endpoint_id: String,
    },
    Error {
        endpoint_id: String,
        description: String,
    },
}

/// Snapshot of what the coordinator knows about one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointRecord {
    pub id: String,
    pub liveness: Liveness,
    /// Endpoint clock minus local clock; 0 until the first sync.
    pub clock_offset_millis: i64,
    pub round_trip_millis: i64,
    pub sync_samples: u64,
    /// Local wall clock (ms) when the handshake completed.
    pub connected_at: i64,
    /// Local wall clock (ms) of the last inbound message of any type.
    pub last_heartbeat_at: i64,
    pub status: DeviceStatus,
}

// ── Internal state ───────────────────────────────────────────────

struct Tracked {
    record: EndpointRecord,
    sync: TimeSyncEngine,
    /// Set on LOST; the next recovery triggers a fresh sync.
    resync_pending: bool,
}

struct Registry {
    endpoints: HashMap<String, Tracked>,
    monitor: ConnectionMonitor,
}

struct CoordinatorInner {
    config: CoordinatorConfig,
    clock: SharedClock,
    transport: Arc<dyn Transport>,
    registry: Mutex<Registry>,
    events: mpsc::UnboundedSender<CoordinatorEvent>,
    workers: WorkerSet,
    running: AtomicBool,
}

pub struct DeviceCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl DeviceCoordinator {
    /// Build a coordinator over `transport`. Events arrive on the returned
    /// receiver once [`start`](Self::start) has been called.
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn Transport>,
        clock: SharedClock,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CoordinatorEvent>), CapsyncError> {
        config.validate()?;
        let (events, rx) = mpsc::unbounded_channel();
        let monitor = ConnectionMonitor::new(Thresholds::from(&config.timing));
        let inner = Arc::new(CoordinatorInner {
            config,
            clock,
            transport,
            registry: Mutex::new(Registry {
                endpoints: HashMap::new(),
                monitor,
            }),
            events,
            workers: WorkerSet::new("coordinator"),
            running: AtomicBool::new(false),
        });
        Ok((Self { inner }, rx))
    }

    /// Coordinator accepting endpoints on `config.network.bind_socket()`.
    pub fn server(
        config: CoordinatorConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CoordinatorEvent>), CapsyncError> {
        let clock: SharedClock = Arc::new(SystemClock);
        let transport = Arc::new(ServerTransport::new(&config, clock.clone()));
        Self::new(config, transport, clock)
    }

    /// Coordinator connecting out to `config.network.server_socket()`.
    pub fn client(
        config: CoordinatorConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CoordinatorEvent>), CapsyncError> {
        let clock: SharedClock = Arc::new(SystemClock);
        let transport = Arc::new(ClientTransport::new(&config, clock.clone()));
        Self::new(config, transport, clock)
    }

    pub fn local_id(&self) -> &str {
        &self.inner.config.local_id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn clock(&self) -> &SharedClock {
        &self.inner.clock
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ── Lifecycle ────────────────────────────────────────────────

    pub async fn start(&self) -> Result<(), CapsyncError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let listener = Arc::new(Dispatch(Arc::downgrade(&self.inner)));
        self.inner.transport.set_listener(listener);
        if let Err(e) = self.inner.transport.start().await {
            self.inner.running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.inner.workers.reset();
        let timing = &self.inner.config.timing;
        self.inner.workers.spawn(
            "heartbeat",
            heartbeat_loop(
                Arc::downgrade(&self.inner),
                timing.heartbeat_initial_delay(),
                timing.heartbeat_interval(),
            ),
        );
        self.inner.workers.spawn(
            "sweep",
            sweep_loop(Arc::downgrade(&self.inner), timing.sweep_interval()),
        );
        info!(
            local_id = %self.inner.config.local_id,
            role = %self.inner.transport.role(),
            "coordinator started"
        );
        Ok(())
    }

    /// Stop timers, then the transport. No events are delivered for the
    /// connections this closes.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.workers.shutdown().await;
        self.inner.transport.stop().await;
        let mut registry = self.inner.registry.lock();
        registry.endpoints.clear();
        registry.monitor.clear();
        info!(local_id = %self.inner.config.local_id, "coordinator stopped");
    }

    // ── Commands ─────────────────────────────────────────────────

    pub async fn send_command(
        &self,
        kind: CommandType,
        endpoint_id: &str,
        session_id: &str,
        parameters: Vec<String>,
    ) -> Result<(), CapsyncError> {
        let command = self.inner.command(kind, session_id, parameters);
        self.inner.transport.send_to(endpoint_id, &command.into()).await
    }

    /// Returns the number of endpoints the command reached.
    pub async fn broadcast_command(
        &self,
        kind: CommandType,
        session_id: &str,
        parameters: Vec<String>,
    ) -> usize {
        let command = self.inner.command(kind, session_id, parameters);
        self.inner.transport.broadcast(&command.into()).await
    }

    /// Reply to an endpoint, e.g. answering a STATUS_QUERY.
    pub async fn send_response(
        &self,
        endpoint_id: &str,
        kind: CommandType,
        status: StatusCode,
        message: &str,
        data: Vec<String>,
    ) -> Result<(), CapsyncError> {
        let response = ResponseMessage::new(
            kind,
            self.inner.config.local_id.as_str(),
            self.inner.clock.now_millis(),
            status,
            message,
            data,
        );
        self.inner.transport.send_to(endpoint_id, &response.into()).await
    }

    /// Broadcast a SYNC_MARKER. Returns the marker id and how many endpoints
    /// it reached.
    pub async fn broadcast_marker(
        &self,
        marker_type: MarkerType,
        session_id: &str,
    ) -> (String, usize) {
        let now = self.inner.clock.now_millis();
        let marker_id = marker::generate_marker_id(&marker_type.as_str().to_lowercase(), now);
        let message = marker::create_marker_message(
            marker_id.as_str(),
            marker_type,
            &self.inner.config.local_id,
            session_id,
            now,
        );
        let reached = self.inner.transport.broadcast(&message.into()).await;
        info!(marker = %marker_id, kind = %marker_type, reached, "sync marker sent");
        (marker_id, reached)
    }

    /// Record receipt of a SYNC_MARKER that arrived from `endpoint_id`,
    /// mapping local time into that endpoint's clock when synced with it.
    pub fn record_marker(
        &self,
        endpoint_id: &str,
        command: &CommandMessage,
    ) -> Result<MarkerEvent, CapsyncError> {
        let offset = self
            .inner
            .registry
            .lock()
            .endpoints
            .get(endpoint_id)
            .filter(|t| t.sync.is_synchronized())
            .map(|t| t.record.clock_offset_millis);
        let event = marker::record_marker_event(
            command,
            &self.inner.config.local_id,
            self.inner.clock.now_millis(),
            offset,
        )?;
        Ok(event)
    }

    // ── Time sync ────────────────────────────────────────────────

    /// Send a SYNC_PING. The result arrives later as
    /// [`CoordinatorEvent::SyncCompleted`].
    pub async fn sync_with(&self, endpoint_id: &str) -> Result<(), CapsyncError> {
        self.inner.sync_with(endpoint_id).await
    }

    /// Ping every registered endpoint; returns how many pings were sent.
    pub async fn sync_with_all(&self) -> usize {
        let mut sent = 0;
        for id in self.connected_endpoints() {
            match self.inner.sync_with(&id).await {
                Ok(()) => sent += 1,
                Err(e) => debug!(endpoint = %id, error = %e, "sync ping not sent"),
            }
        }
        sent
    }

    /// Estimated endpoint-minus-local clock offset; 0 when unknown.
    pub fn get_clock_offset(&self, endpoint_id: &str) -> i64 {
        self.inner
            .registry
            .lock()
            .endpoints
            .get(endpoint_id)
            .map_or(0, |t| t.record.clock_offset_millis)
    }

    /// Map a local timestamp into `endpoint_id`'s clock.
    pub fn to_endpoint_time(&self, endpoint_id: &str, local_millis: i64) -> i64 {
        self.inner
            .registry
            .lock()
            .endpoints
            .get(endpoint_id)
            .map_or(local_millis, |t| t.sync.local_to_remote(local_millis))
    }

    // ── Registry queries ─────────────────────────────────────────

    pub fn get_status(&self, endpoint_id: &str) -> Option<EndpointRecord> {
        self.inner
            .registry
            .lock()
            .endpoints
            .get(endpoint_id)
            .map(|t| t.record.clone())
    }

    /// Registered endpoint ids, sorted.
    pub fn connected_endpoints(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.inner.registry.lock().endpoints.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn endpoints(&self) -> Vec<EndpointRecord> {
        let mut records: Vec<_> = self
            .inner
            .registry
            .lock()
            .endpoints
            .values()
            .map(|t| t.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }
}

impl Drop for DeviceCoordinator {
    fn drop(&mut self) {
        self.inner.workers.cancel();
    }
}

// ── Event handling ───────────────────────────────────────────────

impl CoordinatorInner {
    fn emit(&self, event: CoordinatorEvent) {
        // A dropped receiver just means nobody is listening.
        let _ = self.events.send(event);
    }

    fn command(&self, kind: CommandType, session_id: &str, parameters: Vec<String>) -> CommandMessage {
        CommandMessage::new(
            kind,
            self.config.local_id.as_str(),
            self.clock.now_millis(),
            session_id,
            parameters,
        )
    }

    async fn sync_with(&self, endpoint_id: &str) -> Result<(), CapsyncError> {
        let ping = self
            .registry
            .lock()
            .endpoints
            .get(endpoint_id)
            .map(|t| t.sync.create_ping())
            .ok_or_else(|| CapsyncError::NotConnected(endpoint_id.to_string()))?;
        debug!(endpoint = %endpoint_id, origin = ping.origin_timestamp, "sync ping");
        self.transport.send_to(endpoint_id, &ping.into()).await
    }

    fn schedule_sync(self: &Arc<Self>, endpoint_id: &str, delay: Duration) {
        let weak = Arc::downgrade(self);
        let id = endpoint_id.to_string();
        self.workers.spawn("sync", async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let Some(inner) = weak.upgrade() else { return };
            if let Err(e) = inner.sync_with(&id).await {
                debug!(endpoint = %id, error = %e, "scheduled sync skipped");
            }
        });
    }

    async fn handle_connected(self: &Arc<Self>, endpoint_id: &str) {
        let now = self.clock.now_millis();
        {
            let mut registry = self.registry.lock();
            registry.endpoints.insert(
                endpoint_id.to_string(),
                Tracked {
                    record: EndpointRecord {
                        id: endpoint_id.to_string(),
                        liveness: Liveness::Connected,
                        clock_offset_millis: 0,
                        round_trip_millis: 0,
                        sync_samples: 0,
                        connected_at: now,
                        last_heartbeat_at: now,
                        status: DeviceStatus::default(),
                    },
                    sync: TimeSyncEngine::new(self.config.local_id.as_str(), self.clock.clone()),
                    resync_pending: false,
                },
            );
            registry.monitor.register(endpoint_id, Instant::now());
        }
        info!(endpoint = %endpoint_id, "device connected");
        self.emit(CoordinatorEvent::DeviceConnected {
            endpoint_id: endpoint_id.to_string(),
        });
        self.schedule_sync(endpoint_id, self.config.timing.sync_settle());
    }

    async fn handle_disconnected(&self, endpoint_id: &str, reason: &str) {
        let removed = {
            let mut registry = self.registry.lock();
            registry.monitor.unregister(endpoint_id);
            registry.endpoints.remove(endpoint_id).is_some()
        };
        if removed {
            info!(endpoint = %endpoint_id, reason, "device disconnected");
            self.emit(CoordinatorEvent::DeviceDisconnected {
                endpoint_id: endpoint_id.to_string(),
                reason: reason.to_string(),
            });
        } else {
            debug!(endpoint = %endpoint_id, reason, "disconnect for unregistered endpoint");
        }
    }

    async fn handle_message(self: &Arc<Self>, endpoint_id: &str, message: Message) {
        let received_at = self.clock.now_millis();
        let followups = {
            let mut registry = self.registry.lock();
            let recovered = registry.monitor.record_activity(endpoint_id, Instant::now());
            if let Some(tracked) = registry.endpoints.get_mut(endpoint_id) {
                tracked.record.last_heartbeat_at = received_at;
            }
            registry.apply_transitions(recovered.into_iter().collect())
        };
        self.carry_out(followups).await;

        match message {
            Message::Command(cmd) if cmd.kind == CommandType::Heartbeat => {
                trace!(endpoint = %endpoint_id, "heartbeat");
            }
            Message::Sync(ping) if ping.kind == CommandType::SyncPing => {
                let pong = answer_ping(&self.config.local_id, &ping, received_at, &self.clock);
                if let Err(e) = self.transport.send_to(endpoint_id, &pong.into()).await {
                    warn!(endpoint = %endpoint_id, error = %e, "failed to answer sync ping");
                }
            }
            Message::Sync(pong) if pong.kind == CommandType::SyncPong => {
                self.complete_sync(endpoint_id, &pong);
            }
            Message::Response(response) if DeviceStatus::is_status_report(&response) => {
                if let Some(tracked) = self.registry.lock().endpoints.get_mut(endpoint_id) {
                    tracked.record.status.update_from_response(&response, received_at);
                }
                debug!(endpoint = %endpoint_id, data = ?response.data, "status report");
                self.emit(CoordinatorEvent::MessageReceived {
                    endpoint_id: endpoint_id.to_string(),
                    message: response.into(),
                });
            }
            other => {
                self.emit(CoordinatorEvent::MessageReceived {
                    endpoint_id: endpoint_id.to_string(),
                    message: other,
                });
            }
        }
    }

    fn complete_sync(&self, endpoint_id: &str, pong: &SyncMessage) {
        let sample = {
            let mut registry = self.registry.lock();
            let Some(tracked) = registry.endpoints.get_mut(endpoint_id) else {
                debug!(endpoint = %endpoint_id, "pong from unregistered endpoint");
                return;
            };
            let sample = tracked.sync.process_pong(pong);
            tracked.record.clock_offset_millis = sample.offset_millis;
            tracked.record.round_trip_millis = sample.round_trip_millis;
            tracked.record.sync_samples = tracked.sync.sample_count();
            sample
        };
        info!(
            endpoint = %endpoint_id,
            offset_ms = sample.offset_millis,
            rtt_ms = sample.round_trip_millis,
            "clock sync completed"
        );
        self.emit(CoordinatorEvent::SyncCompleted {
            endpoint_id: endpoint_id.to_string(),
            offset_millis: sample.offset_millis,
            round_trip_millis: sample.round_trip_millis,
        });
    }

    async fn handle_error(&self, endpoint_id: &str, error: &CapsyncError) {
        warn!(endpoint = %endpoint_id, error = %error, "endpoint error");
        self.emit(CoordinatorEvent::Error {
            endpoint_id: endpoint_id.to_string(),
            description: error.to_string(),
        });
    }

    async fn sweep(self: &Arc<Self>, now: Instant) {
        let followups = {
            let mut registry = self.registry.lock();
            let events = registry.monitor.sweep(now);
            registry.apply_transitions(events)
        };
        self.carry_out(followups).await;
    }

    /// Emit the events of already-applied transitions, then do the I/O they
    /// call for.
    async fn carry_out(self: &Arc<Self>, followups: Followups) {
        for event in followups.events {
            self.emit(event);
        }
        for id in &followups.resync {
            self.schedule_sync(id, Duration::ZERO);
        }
        for id in &followups.probe {
            let now = self.clock.now_millis();
            let probe = self.command(CommandType::Heartbeat, "", vec![now.to_string()]);
            if let Err(e) = self.transport.send_to(id, &probe.into()).await {
                debug!(endpoint = %id, error = %e, "heartbeat probe failed");
            }
        }
        for id in &followups.evict {
            // A fresh CONNECT may have re-registered the id since the lock
            // was released; that link is not ours to close.
            if self.registry.lock().endpoints.contains_key(id) {
                debug!(endpoint = %id, "evicted endpoint came back, keeping its new link");
                continue;
            }
            self.transport.disconnect(id).await;
        }
    }
}

/// What a batch of monitor transitions still needs once the registry lock
/// is released.
#[derive(Debug, Default)]
struct Followups {
    events: Vec<CoordinatorEvent>,
    /// Silent endpoints to send a direct HEARTBEAT.
    probe: Vec<String>,
    resync: Vec<String>,
    evict: Vec<String>,
}

impl Registry {
    /// Mirror monitor transitions into the records. Must run in the same
    /// critical section that produced `transitions`.
    fn apply_transitions(&mut self, transitions: Vec<MonitorEvent>) -> Followups {
        let mut out = Followups::default();
        for transition in transitions {
            match transition {
                MonitorEvent::Suspect(id) => {
                    if let Some(tracked) = self.endpoints.get_mut(&id) {
                        tracked.record.liveness = Liveness::Suspect;
                    }
                    debug!(endpoint = %id, "endpoint suspect");
                    out.add_probe(id);
                }
                MonitorEvent::Lost(id) => {
                    if let Some(tracked) = self.endpoints.get_mut(&id) {
                        tracked.record.liveness = Liveness::Lost;
                        tracked.resync_pending = true;
                    }
                    warn!(endpoint = %id, "connection lost");
                    out.events.push(CoordinatorEvent::ConnectionLost {
                        endpoint_id: id.clone(),
                    });
                    out.add_probe(id);
                }
                MonitorEvent::Recovered(id) => {
                    let resync = match self.endpoints.get_mut(&id) {
                        Some(tracked) => {
                            tracked.record.liveness = Liveness::Connected;
                            std::mem::take(&mut tracked.resync_pending)
                        }
                        None => false,
                    };
                    info!(endpoint = %id, resync, "connection recovered");
                    if resync {
                        out.resync.push(id.clone());
                    }
                    out.events.push(CoordinatorEvent::ConnectionRecovered { endpoint_id: id });
                }
                MonitorEvent::PermanentlyLost(id) => {
                    if self.monitor.state(&id).is_some() {
                        continue;
                    }
                    self.endpoints.remove(&id);
                    error!(endpoint = %id, "connection permanently lost, evicting");
                    out.probe.retain(|p| *p != id);
                    out.events.push(CoordinatorEvent::ConnectionPermanentlyLost {
                        endpoint_id: id.clone(),
                    });
                    out.evict.push(id);
                }
            }
        }
        out
    }
}

impl Followups {
    fn add_probe(&mut self, id: String) {
        if !self.probe.contains(&id) {
            self.probe.push(id);
        }
    }
}

/// Listener handed to the transport. Holds the coordinator weakly so the
/// transport never keeps it alive.
struct Dispatch(Weak<CoordinatorInner>);

#[async_trait]
impl TransportListener for Dispatch {
    async fn on_connected(&self, endpoint_id: &str) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_connected(endpoint_id).await;
        }
    }

    async fn on_disconnected(&self, endpoint_id: &str, reason: &str) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_disconnected(endpoint_id, reason).await;
        }
    }

    async fn on_message_received(&self, endpoint_id: &str, message: Message) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_message(endpoint_id, message).await;
        }
    }

    async fn on_error(&self, endpoint_id: &str, error: &CapsyncError) {
        if let Some(inner) = self.0.upgrade() {
            inner.handle_error(endpoint_id, error).await;
        }
    }
}

// ── Timers ───────────────────────────────────────────────────────

async fn heartbeat_loop(inner: Weak<CoordinatorInner>, initial_delay: Duration, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + initial_delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        let now = inner.clock.now_millis();
        let heartbeat = inner.command(CommandType::Heartbeat, "", vec![now.to_string()]);
        let reached = inner.transport.broadcast(&heartbeat.into()).await;
        trace!(reached, "heartbeat sent");
    }
}

async fn sweep_loop(inner: Weak<CoordinatorInner>, period: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else { return };
        inner.sweep(Instant::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::network::TransportRole;

    #[derive(Default)]
    struct FakeTransport {
        connected: Mutex<Vec<String>>,
        sent: Mutex<Vec<(String, Message)>>,
        disconnects: Mutex<Vec<String>>,
    }

    impl FakeTransport {
        fn attach(&self, id: &str) {
            self.connected.lock().push(id.to_string());
        }

        fn sent_kinds(&self, id: &str) -> Vec<CommandType> {
            self.sent
                .lock()
                .iter()
                .filter(|(to, _)| to == id)
                .map(|(_, m)| m.kind())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn set_listener(&self, _listener: Arc<dyn TransportListener>) {}

        async fn initialize(&self) -> Result<(), CapsyncError> {
            Ok(())
        }

        async fn start(&self) -> Result<(), CapsyncError> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn send_to(&self, id: &str, message: &Message) -> Result<(), CapsyncError> {
            if !self.connected.lock().iter().any(|c| c == id) {
                return Err(CapsyncError::NotConnected(id.to_string()));
            }
            self.sent.lock().push((id.to_string(), message.clone()));
            Ok(())
        }

        async fn broadcast(&self, message: &Message) -> usize {
            let ids = self.connected.lock().clone();
            let mut sent = self.sent.lock();
            for id in &ids {
                sent.push((id.clone(), message.clone()));
            }
            ids.len()
        }

        fn is_connected(&self, id: &str) -> bool {
            self.connected.lock().iter().any(|c| c == id)
        }

        fn list_connected(&self) -> Vec<String> {
            self.connected.lock().clone()
        }

        async fn disconnect(&self, id: &str) -> bool {
            self.connected.lock().retain(|c| c != id);
            self.disconnects.lock().push(id.to_string());
            true
        }

        fn role(&self) -> TransportRole {
            TransportRole::Server
        }
    }

    struct Harness {
        coordinator: DeviceCoordinator,
        transport: Arc<FakeTransport>,
        clock: Arc<ManualClock>,
        events: mpsc::UnboundedReceiver<CoordinatorEvent>,
    }

    fn harness() -> Harness {
        let mut config = CoordinatorConfig::default();
        config.local_id = "hub".into();
        // Keep the connect-time sync out of the way.
        config.timing.sync_settle_ms = 3_600_000;
        let clock = Arc::new(ManualClock::new(1_000));
        let transport = Arc::new(FakeTransport::default());
        let (coordinator, events) =
            DeviceCoordinator::new(config, transport.clone(), clock.clone()).unwrap();
        Harness {
            coordinator,
            transport,
            clock,
            events,
        }
    }

    impl Harness {
        async fn connect(&mut self, id: &str) {
            self.transport.attach(id);
            self.coordinator.inner.handle_connected(id).await;
            assert_eq!(
                self.events.try_recv().unwrap(),
                CoordinatorEvent::DeviceConnected {
                    endpoint_id: id.into()
                }
            );
        }

        fn drain(&mut self) -> Vec<CoordinatorEvent> {
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }
    }

    #[tokio::test]
    async fn liveness_walks_to_eviction_and_closes_the_socket() {
        let mut h = harness();
        h.connect("phone-a").await;
        let t0 = Instant::now();
        let inner = h.coordinator.inner.clone();

        inner.sweep(t0 + Duration::from_secs(61)).await;
        assert_eq!(h.coordinator.get_status("phone-a").unwrap().liveness, Liveness::Suspect);
        assert!(h.drain().is_empty());

        inner.sweep(t0 + Duration::from_secs(91)).await;
        assert_eq!(h.coordinator.get_status("phone-a").unwrap().liveness, Liveness::Lost);
        assert_eq!(
            h.drain(),
            vec![CoordinatorEvent::ConnectionLost {
                endpoint_id: "phone-a".into()
            }]
        );

        inner.sweep(t0 + Duration::from_secs(149)).await;
        assert!(h.coordinator.get_status("phone-a").is_some());

        inner.sweep(t0 + Duration::from_secs(151)).await;
        assert!(h.coordinator.get_status("phone-a").is_none());
        assert_eq!(
            h.drain(),
            vec![CoordinatorEvent::ConnectionPermanentlyLost {
                endpoint_id: "phone-a".into()
            }]
        );
        assert_eq!(*h.transport.disconnects.lock(), vec!["phone-a".to_string()]);
    }

    #[tokio::test]
    async fn traffic_after_loss_recovers_and_resyncs() {
        let mut h = harness();
        h.connect("phone-a").await;
        let inner = h.coordinator.inner.clone();
        inner.sweep(Instant::now() + Duration::from_secs(100)).await;
        h.drain();

        let hb = CommandMessage::new(CommandType::Heartbeat, "phone-a", 5, "", vec![]);
        inner.handle_message("phone-a", hb.into()).await;
        assert_eq!(
            h.drain(),
            vec![CoordinatorEvent::ConnectionRecovered {
                endpoint_id: "phone-a".into()
            }]
        );
        assert_eq!(h.coordinator.get_status("phone-a").unwrap().liveness, Liveness::Connected);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            h.transport.sent_kinds("phone-a"),
            vec![CommandType::Heartbeat, CommandType::SyncPing]
        );
    }

    #[tokio::test]
    async fn silent_endpoint_is_probed_directly() {
        let mut h = harness();
        h.connect("phone-a").await;
        let t0 = Instant::now();
        let inner = h.coordinator.inner.clone();

        inner.sweep(t0 + Duration::from_secs(61)).await;
        assert_eq!(h.transport.sent_kinds("phone-a"), vec![CommandType::Heartbeat]);
        let (_, probe) = h.transport.sent.lock().last().cloned().unwrap();
        assert_eq!(probe.sender_id(), "hub");

        inner.sweep(t0 + Duration::from_secs(91)).await;
        assert_eq!(
            h.transport.sent_kinds("phone-a"),
            vec![CommandType::Heartbeat, CommandType::Heartbeat]
        );

        // Evicted in the same sweep that would have probed it again.
        inner.sweep(t0 + Duration::from_secs(400)).await;
        assert_eq!(h.transport.sent_kinds("phone-a").len(), 2);
        assert!(h.coordinator.get_status("phone-a").is_none());
        assert_eq!(*h.transport.disconnects.lock(), vec!["phone-a".to_string()]);
    }

    #[tokio::test]
    async fn failed_probe_leaves_the_record_to_the_transport() {
        let mut h = harness();
        h.connect("phone-a").await;
        h.transport.connected.lock().clear();
        let inner = h.coordinator.inner.clone();

        inner.sweep(Instant::now() + Duration::from_secs(61)).await;
        assert!(h.transport.sent_kinds("phone-a").is_empty());
        assert_eq!(h.coordinator.get_status("phone-a").unwrap().liveness, Liveness::Suspect);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn record_tracks_monitor_across_loss_and_recovery() {
        let mut h = harness();
        h.connect("phone-a").await;
        let inner = h.coordinator.inner.clone();

        inner.sweep(Instant::now() + Duration::from_secs(100)).await;
        let hb = CommandMessage::new(CommandType::Heartbeat, "phone-a", 5, "", vec![]);
        inner.handle_message("phone-a", hb.clone().into()).await;
        assert_eq!(
            h.drain(),
            vec![
                CoordinatorEvent::ConnectionLost {
                    endpoint_id: "phone-a".into()
                },
                CoordinatorEvent::ConnectionRecovered {
                    endpoint_id: "phone-a".into()
                },
            ]
        );

        // Nothing is due yet, and nothing stale lands afterwards.
        inner.sweep(Instant::now() + Duration::from_secs(30)).await;
        inner.handle_message("phone-a", hb.into()).await;
        assert!(h.drain().is_empty());

        let registry = inner.registry.lock();
        let tracked = &registry.endpoints["phone-a"];
        assert_eq!(tracked.record.liveness, Liveness::Connected);
        assert_eq!(registry.monitor.state("phone-a"), Some(Liveness::Connected));
        assert!(!tracked.resync_pending);
    }

    #[tokio::test]
    async fn eviction_spares_a_re_registered_endpoint() {
        let mut h = harness();
        h.connect("phone-a").await;
        let inner = h.coordinator.inner.clone();

        // Monitor still tracks it: a stale eviction is ignored.
        let followups = inner
            .registry
            .lock()
            .apply_transitions(vec![MonitorEvent::PermanentlyLost("phone-a".into())]);
        assert!(followups.events.is_empty());
        assert!(followups.evict.is_empty());
        assert!(h.coordinator.get_status("phone-a").is_some());

        // Back in the registry by the time the socket would be closed.
        inner
            .carry_out(Followups {
                evict: vec!["phone-a".into()],
                ..Followups::default()
            })
            .await;
        assert!(h.transport.disconnects.lock().is_empty());
        assert!(h.transport.is_connected("phone-a"));
    }

    #[tokio::test]
    async fn pong_updates_offset() {
        let mut h = harness();
        h.connect("phone-a").await;
        assert_eq!(h.coordinator.get_clock_offset("phone-a"), 0);

        h.clock.set(1_120);
        let pong = SyncMessage::new(CommandType::SyncPong, "phone-a", 1_060, 1_000, 1_050, 1_060);
        h.coordinator.inner.handle_message("phone-a", pong.into()).await;

        assert_eq!(
            h.drain(),
            vec![CoordinatorEvent::SyncCompleted {
                endpoint_id: "phone-a".into(),
                offset_millis: 45,
                round_trip_millis: 70,
            }]
        );
        let record = h.coordinator.get_status("phone-a").unwrap();
        assert_eq!(record.clock_offset_millis, 45);
        assert_eq!(record.round_trip_millis, 70);
        assert_eq!(record.sync_samples, 1);
        assert_eq!(h.coordinator.get_clock_offset("phone-a"), 45);
        assert_eq!(h.coordinator.to_endpoint_time("phone-a", 2_000), 2_045);
        assert_eq!(h.coordinator.get_clock_offset("unknown"), 0);
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let mut h = harness();
        h.connect("phone-a").await;
        h.clock.set(5_000);

        let ping = SyncMessage::new(CommandType::SyncPing, "phone-a", 4_000, 4_000, 0, 0);
        h.coordinator.inner.handle_message("phone-a", ping.into()).await;

        let sent = h.transport.sent.lock();
        let (to, pong) = sent.last().unwrap();
        assert_eq!(to, "phone-a");
        let pong = pong.as_sync().unwrap();
        assert_eq!(pong.kind, CommandType::SyncPong);
        assert_eq!(pong.sender_id, "hub");
        assert_eq!(pong.origin_timestamp, 4_000);
        assert_eq!(pong.receive_timestamp, 5_000);
        assert_eq!(pong.transmit_timestamp, 5_000);
        drop(sent);
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn status_reports_update_registry_and_are_forwarded() {
        let mut h = harness();
        h.connect("phone-a").await;

        let report = ResponseMessage::new(
            CommandType::StatusQuery,
            "phone-a",
            1_000,
            StatusCode::Ok,
            "status",
            vec!["87".into(), "12GB".into(), "gsr:true,rgb:false".into()],
        );
        h.coordinator.inner.handle_message("phone-a", report.clone().into()).await;

        let status = h.coordinator.get_status("phone-a").unwrap().status;
        assert_eq!(status.battery_level.as_deref(), Some("87"));
        assert!(status.is_stream_active("gsr"));
        assert!(!status.is_stream_active("rgb"));
        assert_eq!(
            h.drain(),
            vec![CoordinatorEvent::MessageReceived {
                endpoint_id: "phone-a".into(),
                message: report.into(),
            }]
        );
    }

    #[tokio::test]
    async fn heartbeats_are_consumed_and_other_commands_forwarded() {
        let mut h = harness();
        h.connect("phone-a").await;
        h.clock.set(9_000);

        let hb = CommandMessage::new(CommandType::Heartbeat, "phone-a", 1, "", vec![]);
        h.coordinator.inner.handle_message("phone-a", hb.into()).await;
        assert!(h.drain().is_empty());
        assert_eq!(h.coordinator.get_status("phone-a").unwrap().last_heartbeat_at, 9_000);

        let start = CommandMessage::new(CommandType::Start, "phone-a", 2, "s1", vec![]);
        h.coordinator.inner.handle_message("phone-a", start.clone().into()).await;
        assert_eq!(
            h.drain(),
            vec![CoordinatorEvent::MessageReceived {
                endpoint_id: "phone-a".into(),
                message: start.into(),
            }]
        );
    }

    #[tokio::test]
    async fn transport_disconnect_removes_the_record_once() {
        let mut h = harness();
        h.connect("phone-a").await;
        let inner = h.coordinator.inner.clone();

        inner.handle_disconnected("phone-a", "connection closed by peer").await;
        assert!(h.coordinator.connected_endpoints().is_empty());
        assert_eq!(
            h.drain(),
            vec![CoordinatorEvent::DeviceDisconnected {
                endpoint_id: "phone-a".into(),
                reason: "connection closed by peer".into(),
            }]
        );

        inner.handle_disconnected("phone-a", "again").await;
        assert!(h.drain().is_empty());
        // Monitor no longer tracks it either.
        inner.sweep(Instant::now() + Duration::from_secs(1_000)).await;
        assert!(h.drain().is_empty());
    }

    #[tokio::test]
    async fn commands_carry_local_identity() {
        let mut h = harness();
        h.connect("phone-a").await;
        h.connect("phone-b").await;

        h.coordinator
            .send_command(CommandType::Start, "phone-a", "s1", vec!["gsr".into()])
            .await
            .unwrap();
        let (to, msg) = h.transport.sent.lock().last().cloned().unwrap();
        assert_eq!(to, "phone-a");
        let cmd = msg.as_command().unwrap();
        assert_eq!(cmd.sender_id, "hub");
        assert_eq!(cmd.session_id, "s1");
        assert_eq!(cmd.parameters, vec!["gsr".to_string()]);

        assert!(matches!(
            h.coordinator
                .send_command(CommandType::Stop, "ghost", "s1", vec![])
                .await,
            Err(CapsyncError::NotConnected(_))
        ));
        assert_eq!(
            h.coordinator.broadcast_command(CommandType::Stop, "s1", vec![]).await,
            2
        );
        assert_eq!(h.coordinator.sync_with_all().await, 2);
        assert!(h.coordinator.sync_with("ghost").await.is_err());
    }

    #[tokio::test]
    async fn markers_are_broadcast_and_recorded() {
        let mut h = harness();
        h.connect("phone-a").await;

        let (marker_id, reached) = h
            .coordinator
            .broadcast_marker(MarkerType::StartRecording, "s1")
            .await;
        assert_eq!(reached, 1);
        assert_eq!(marker_id, "start_recording_1000");

        let (_, msg) = h.transport.sent.lock().last().cloned().unwrap();
        let cmd = msg.as_command().unwrap().clone();
        h.clock.set(1_500);
        let event = h.coordinator.record_marker("phone-a", &cmd).unwrap();
        assert_eq!(event.local_timestamp, 1_500);
        // Never synced with phone-a, so no mapped time.
        assert_eq!(event.coordinator_timestamp, None);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = CoordinatorConfig::default();
        config.timing.sweep_interval_ms = 0;
        let result = DeviceCoordinator::new(
            config,
            Arc::new(FakeTransport::default()),
            Arc::new(ManualClock::new(0)),
        );
        assert!(matches!(result, Err(CapsyncError::InvalidConfig(_))));
    }
}
