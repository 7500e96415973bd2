//! # Connection Manager
//!
//! The one gateway event stream: dial, authenticate, heartbeat, reconnect,
//! and follow the registry's active endpoint.
//!
//! ## Connection Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Gateway Stream Phases                                │
//! │                                                                         │
//! │  ┌────────────┐   connect()   ┌────────────┐                           │
//! │  │Disconnected│ ────────────► │ Connecting │ ◄──────────────┐          │
//! │  └────────────┘  (waits for   └─────┬──────┘                │          │
//! │        ▲          an active         │                       │          │
//! │        │          endpoint)  open + auth (+ auth_ok)        │ timer    │
//! │        │                            ▼                       │          │
//! │        │                     ┌────────────┐  close/error ┌──┴─────────┐│
//! │        │  disconnect()       │ Connected  │ ───────────► │Reconnecting││
//! │        ├──────────────────── │ ping 30s   │              └──┬─────────┘│
//! │        │                     └────────────┘                 │          │
//! │        │                                                    │          │
//! │        └──────────── max attempts / auth give-up ───────────┘          │
//! │                      (gaveUp = true)                                   │
//! │                                                                         │
//! │  Failover (active endpoint changed) in Connecting, Connected or       │
//! │  Reconnecting: drop the stream, reset backoff, dial the new endpoint. │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Inbound Path
//! frame ──► `parse_frame` ──► [`EventRouter`] (cache effects) ──► [`EventBus`]
//!
//! Every transition into and out of `Connected` also publishes an internal
//! `agent_status` event with `status: connected | disconnected`. The same
//! event arriving from the gateway is recorded as `gatewayReported`.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use gatewatch_core::clock::{Clock, SystemClock};
use gatewatch_core::connection::{ConnectionPhase, ConnectionState};
use gatewatch_core::endpoint::EndpointConfig;
use gatewatch_core::event::{EventSource, RealtimeEvent};

use crate::config::ConnectionSettings;
use crate::error::{SyncError, SyncResult};
use crate::event_bus::EventBus;
use crate::invalidation::EventRouter;
use crate::protocol::{is_auth_close_code, parse_frame, stream_url, ClientMessage, InboundFrame};
use crate::reconnect::ReconnectPolicy;
use crate::registry::EndpointRegistry;

// =============================================================================
// Connection Configuration
// =============================================================================

/// Stream behavior.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Path appended to the endpoint URL.
    pub stream_path: String,

    /// Dial timeout.
    pub connect_timeout: Duration,

    /// Interval between `ping` frames.
    pub heartbeat_interval: Duration,

    /// First reconnect delay.
    pub initial_backoff: Duration,

    /// Reconnect delay ceiling.
    pub max_backoff: Duration,

    /// Reconnect attempts before giving up (0 = infinite).
    pub max_reconnect_attempts: u32,

    /// Wait for `auth_ok` before reporting connected.
    pub require_auth_ack: bool,

    /// How long to wait for `auth_ok`.
    pub auth_timeout: Duration,

    /// Stop reconnecting after an auth rejection.
    pub give_up_on_auth_rejection: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::from(&ConnectionSettings::default())
    }
}

impl From<&ConnectionSettings> for ConnectionConfig {
    fn from(settings: &ConnectionSettings) -> Self {
        ConnectionConfig {
            stream_path: settings.stream_path.clone(),
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            heartbeat_interval: Duration::from_secs(settings.heartbeat_interval_secs),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            require_auth_ack: settings.require_auth_ack,
            auth_timeout: Duration::from_secs(settings.auth_timeout_secs),
            give_up_on_auth_rejection: settings.give_up_on_auth_rejection,
        }
    }
}

// =============================================================================
// Connection Handle
// =============================================================================

enum Command {
    Connect,
    Disconnect(oneshot::Sender<()>),
    Shutdown,
}

/// Handle for driving the manager from other components.
#[derive(Clone)]
pub struct ConnectionHandle {
    /// Lifecycle commands.
    command_tx: mpsc::Sender<Command>,

    /// Outbound frames.
    outgoing_tx: mpsc::Sender<ClientMessage>,

    /// Latest state.
    state_rx: watch::Receiver<ConnectionState>,
}

impl ConnectionHandle {
    /// Arms the manager. It dials the active endpoint, or waits for one.
    pub async fn connect(&self) -> SyncResult<()> {
        self.command_tx
            .send(Command::Connect)
            .await
            .map_err(|_| SyncError::ChannelError("Connection manager stopped".into()))
    }

    /// Closes the stream (code 1000), cancels heartbeat and any pending
    /// reconnect, and waits until the manager is `Disconnected`.
    /// Calling it again is a no-op.
    pub async fn disconnect(&self) -> SyncResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Disconnect(ack_tx))
            .await
            .map_err(|_| SyncError::ChannelError("Connection manager stopped".into()))?;
        ack_rx
            .await
            .map_err(|_| SyncError::ChannelError("Connection manager dropped disconnect".into()))
    }

    /// Sends a frame on the open stream.
    pub async fn send(&self, message: ClientMessage) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.outgoing_tx
            .send(message)
            .await
            .map_err(|_| SyncError::ChannelError("Failed to send message".into()))
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state_rx.borrow().clone()
    }

    /// Receiver that observes every state change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Returns true if the stream is open.
    pub fn is_connected(&self) -> bool {
        self.state_rx.borrow().is_connected()
    }

    /// Stops the manager task. Stopping a stopped manager is fine.
    pub async fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown).await;
    }
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Why a stream session ended.
enum SessionEnd {
    /// Stream failed; schedule a reconnect.
    Failed {
        error: SyncError,
        auth_rejected: bool,
    },
    /// The active endpoint changed.
    Failover,
    /// `disconnect()` or shutdown.
    Interrupted(Interrupt),
}

enum Interrupt {
    Disconnect(oneshot::Sender<()>),
    Shutdown,
}

/// Whether `run` keeps serving commands.
enum Flow {
    Idle,
    Stop,
}

fn interrupt(command: Option<Command>) -> Option<Interrupt> {
    match command {
        Some(Command::Connect) => None,
        Some(Command::Disconnect(ack)) => Some(Interrupt::Disconnect(ack)),
        Some(Command::Shutdown) | None => Some(Interrupt::Shutdown),
    }
}

fn failed(error: SyncError) -> SessionEnd {
    SessionEnd::Failed {
        error,
        auth_rejected: false,
    }
}

/// True when `next` requires a new stream.
fn differs(bound: &EndpointConfig, next: &EndpointConfig) -> bool {
    bound.id != next.id || bound.url != next.url || bound.credential != next.credential
}

async fn send_frame<S>(sink: &mut S, frame: &ClientMessage) -> SyncResult<()>
where
    S: Sink<WsMessage, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = frame.to_json()?;
    debug!(msg_type = %frame.type_name(), "Sending frame");
    sink.send(WsMessage::Text(json.into())).await?;
    Ok(())
}

async fn close_stream<S>(sink: &mut S, reason: &str)
where
    S: Sink<WsMessage> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: reason.to_string().into(),
    };
    let _ = sink.send(WsMessage::Close(Some(frame))).await;
}

/// Owns the stream. Run it with [`spawn`](Self::spawn).
///
/// ## Usage
/// ```rust,ignore
/// let (manager, handle) = ConnectionManager::new(config, registry.clone(), bus.clone());
/// manager.with_router(EventRouter::new(cache)).spawn();
///
/// handle.connect().await?;
/// let mut state = handle.subscribe();
/// state.wait_for(|s| s.is_connected()).await?;
/// ```
pub struct ConnectionManager {
    config: ConnectionConfig,
    registry: EndpointRegistry,
    bus: EventBus,
    router: Option<EventRouter>,
    clock: Arc<dyn Clock>,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    active_rx: watch::Receiver<Option<EndpointConfig>>,
    command_rx: mpsc::Receiver<Command>,
    outgoing_rx: mpsc::Receiver<ClientMessage>,
}

impl ConnectionManager {
    /// Creates a manager bound to `registry`'s active endpoint.
    pub fn new(
        config: ConnectionConfig,
        registry: EndpointRegistry,
        bus: EventBus,
    ) -> (Self, ConnectionHandle) {
        let (command_tx, command_rx) = mpsc::channel(16);
        let (outgoing_tx, outgoing_rx) = mpsc::channel(100);
        let (state_tx, state_rx) = watch::channel(ConnectionState::default());

        let policy = ReconnectPolicy::new(
            config.initial_backoff,
            config.max_backoff,
            config.max_reconnect_attempts,
        );
        let active_rx = registry.watch_active();

        let manager = ConnectionManager {
            config,
            registry,
            bus,
            router: None,
            clock: Arc::new(SystemClock),
            policy,
            state_tx,
            active_rx,
            command_rx,
            outgoing_rx,
        };
        let handle = ConnectionHandle {
            command_tx,
            outgoing_tx,
            state_rx,
        };

        (manager, handle)
    }

    /// Applies cache effects through `router` before publishing events.
    pub fn with_router(mut self, router: EventRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Replaces the clock used for timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Spawns the manager on the current runtime.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Main loop: idle until `connect()`, then drive the stream until
    /// `disconnect()`, give-up or shutdown.
    pub async fn run(mut self) {
        info!("Connection manager starting");

        loop {
            match self.command_rx.recv().await {
                Some(Command::Connect) => {
                    if let Flow::Stop = self.drive().await {
                        break;
                    }
                }
                Some(Command::Disconnect(ack)) => {
                    self.set_disconnected();
                    let _ = ack.send(());
                }
                Some(Command::Shutdown) | None => break,
            }
        }

        self.set_disconnected();
        info!("Connection manager stopped");
    }

    // =========================================================================
    // Drive Loop
    // =========================================================================

    async fn drive(&mut self) -> Flow {
        self.policy.reset();
        self.state_tx.send_modify(|s| {
            s.gave_up = false;
            s.last_error = None;
        });

        loop {
            let active = self.active_rx.borrow_and_update().clone();
            let endpoint = match active {
                Some(endpoint) => endpoint,
                None => {
                    self.state_tx.send_modify(|s| {
                        s.phase = ConnectionPhase::Disconnected;
                        s.bound_endpoint_id = None;
                        s.reconnect_attempt = 0;
                        s.next_retry_ms = None;
                    });
                    info!("No active endpoint, waiting for the registry");

                    tokio::select! {
                        changed = self.active_rx.changed() => {
                            if changed.is_err() {
                                return self.interrupted(Interrupt::Shutdown, None).await;
                            }
                        }
                        command = self.command_rx.recv() => {
                            if let Some(i) = interrupt(command) {
                                return self.interrupted(i, None).await;
                            }
                        }
                    }
                    continue;
                }
            };

            self.state_tx.send_modify(|s| {
                s.phase = ConnectionPhase::Connecting;
                s.bound_endpoint_id = Some(endpoint.id.clone());
                s.next_retry_ms = None;
            });

            let end = self.session(&endpoint).await;
            let was_connected = self.state_tx.borrow().is_connected();
            let left = was_connected.then_some(endpoint.id.as_str());

            match end {
                SessionEnd::Interrupted(i) => return self.interrupted(i, left).await,
                SessionEnd::Failover => {
                    info!(from = %endpoint.id, "Active endpoint changed, redialing");
                    self.policy.reset();
                    self.state_tx.send_modify(|s| {
                        s.phase = ConnectionPhase::Connecting;
                        s.reconnect_attempt = 0;
                        s.next_retry_ms = None;
                    });
                    self.announce_disconnected(left).await;
                }
                SessionEnd::Failed {
                    error,
                    auth_rejected,
                } => {
                    let reason = error.to_string();

                    if auth_rejected && self.config.give_up_on_auth_rejection {
                        error!(endpoint_id = %endpoint.id, error = %reason, "Authentication rejected, giving up");
                        self.give_up(reason);
                        self.announce_disconnected(left).await;
                        return Flow::Idle;
                    }

                    let Some((attempt, delay)) = self.policy.next_attempt() else {
                        error!(
                            endpoint_id = %endpoint.id,
                            max_attempts = self.policy.max_attempts(),
                            error = %reason,
                            "Max reconnection attempts reached"
                        );
                        self.give_up(reason);
                        self.announce_disconnected(left).await;
                        return Flow::Idle;
                    };

                    let delay_ms = delay.as_millis() as u64;
                    warn!(
                        endpoint_id = %endpoint.id,
                        attempt,
                        delay_ms,
                        error = %reason,
                        "Stream lost, reconnecting"
                    );
                    self.state_tx.send_modify(|s| {
                        s.phase = ConnectionPhase::Reconnecting;
                        s.consecutive_error_count = s.consecutive_error_count.saturating_add(1);
                        s.reconnect_attempt = attempt;
                        s.next_retry_ms = Some(delay_ms);
                        s.last_error = Some(reason);
                    });
                    self.announce_disconnected(left).await;

                    if let Some(i) = self.wait_backoff(&endpoint, delay).await {
                        return self.interrupted(i, None).await;
                    }
                }
            }
        }
    }

    /// Sleeps out a backoff delay. Cut short by a failover (which also resets
    /// the schedule). Returns an interrupt if one arrived.
    async fn wait_backoff(&mut self, bound: &EndpointConfig, delay: Duration) -> Option<Interrupt> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                changed = self.active_rx.changed() => {
                    if changed.is_err() {
                        return Some(Interrupt::Shutdown);
                    }
                    if self.superseded(bound) {
                        info!(from = %bound.id, "Active endpoint changed during backoff");
                        self.policy.reset();
                        return None;
                    }
                }
                command = self.command_rx.recv() => {
                    if let Some(i) = interrupt(command) {
                        return Some(i);
                    }
                }
            }
        }
    }

    // =========================================================================
    // Stream Session
    // =========================================================================

    /// Dials `endpoint` and runs the stream until it ends.
    async fn session(&mut self, endpoint: &EndpointConfig) -> SessionEnd {
        let url = match stream_url(&endpoint.url, &self.config.stream_path) {
            Ok(url) => url,
            Err(e) => return failed(e),
        };
        info!(endpoint_id = %endpoint.id, url = %url, "Dialing gateway stream");

        let connect_timeout = self.config.connect_timeout;
        let dial = timeout(connect_timeout, connect_async(url.as_str()));
        tokio::pin!(dial);

        let ws_stream = loop {
            tokio::select! {
                result = &mut dial => break match result {
                    Ok(Ok((ws_stream, response))) => {
                        debug!(status = ?response.status(), "WebSocket handshake complete");
                        ws_stream
                    }
                    Ok(Err(e)) => return failed(SyncError::from(e)),
                    Err(_) => return failed(SyncError::Timeout(connect_timeout.as_millis() as u64)),
                },
                changed = self.active_rx.changed() => {
                    if changed.is_err() {
                        return SessionEnd::Interrupted(Interrupt::Shutdown);
                    }
                    if self.superseded(endpoint) {
                        return SessionEnd::Failover;
                    }
                }
                command = self.command_rx.recv() => {
                    if let Some(i) = interrupt(command) {
                        return SessionEnd::Interrupted(i);
                    }
                }
            }
        };

        let (mut write, mut read) = ws_stream.split();

        let mut authenticated = true;
        if let Some(token) = &endpoint.credential {
            let auth = ClientMessage::Auth {
                token: token.clone(),
            };
            if let Err(e) = send_frame(&mut write, &auth).await {
                return failed(e);
            }
            authenticated = !self.config.require_auth_ack;
        }
        if authenticated {
            self.mark_connected(endpoint).await;
        }

        let auth_deadline = tokio::time::sleep(self.config.auth_timeout);
        tokio::pin!(auth_deadline);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                incoming = read.next() => match incoming {
                    Some(Ok(WsMessage::Text(text))) => match parse_frame(text.as_str()) {
                        Ok(InboundFrame::Event(event)) => {
                            debug!(event_type = %event.kind, "Received event");
                            self.dispatch(event).await;
                        }
                        Ok(InboundFrame::AuthOk) => {
                            if !authenticated {
                                authenticated = true;
                                heartbeat.reset();
                                self.mark_connected(endpoint).await;
                            }
                        }
                        Ok(InboundFrame::AuthRejected { reason }) => {
                            warn!(endpoint_id = %endpoint.id, reason = %reason, "Gateway rejected credential");
                            close_stream(&mut write, "auth rejected").await;
                            return SessionEnd::Failed {
                                error: SyncError::AuthRejected(reason),
                                auth_rejected: true,
                            };
                        }
                        Ok(InboundFrame::Pong) => debug!("Received pong"),
                        Ok(InboundFrame::Unknown(kind)) => {
                            debug!(frame_type = %kind, "Ignoring unknown frame");
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed frame"),
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        if let Err(e) = write.send(WsMessage::Pong(data)).await {
                            return failed(SyncError::from(e));
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code));
                        info!(endpoint_id = %endpoint.id, ?code, "Gateway closed the stream");
                        return match code {
                            Some(code) if is_auth_close_code(code) => SessionEnd::Failed {
                                error: SyncError::AuthRejected(format!("closed with code {}", code)),
                                auth_rejected: true,
                            },
                            _ => failed(SyncError::Disconnected),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return failed(SyncError::from(e)),
                    None => return failed(SyncError::Disconnected),
                },

                _ = heartbeat.tick(), if authenticated => {
                    if let Err(e) = send_frame(&mut write, &ClientMessage::Ping).await {
                        return failed(e);
                    }
                }

                _ = &mut auth_deadline, if !authenticated => {
                    warn!(endpoint_id = %endpoint.id, "No auth acknowledgement in time");
                    close_stream(&mut write, "auth timeout").await;
                    return failed(SyncError::Timeout(self.config.auth_timeout.as_millis() as u64));
                }

                Some(message) = self.outgoing_rx.recv() => {
                    if let Err(e) = send_frame(&mut write, &message).await {
                        return failed(e);
                    }
                }

                changed = self.active_rx.changed() => {
                    if changed.is_err() {
                        close_stream(&mut write, "shutdown").await;
                        return SessionEnd::Interrupted(Interrupt::Shutdown);
                    }
                    if self.superseded(endpoint) {
                        close_stream(&mut write, "failover").await;
                        return SessionEnd::Failover;
                    }
                }

                command = self.command_rx.recv() => {
                    if let Some(i) = interrupt(command) {
                        close_stream(&mut write, "client disconnect").await;
                        return SessionEnd::Interrupted(i);
                    }
                }
            }
        }
    }

    /// True if the registry's active endpoint is now a different stream
    /// target. An active of none keeps the current stream.
    fn superseded(&mut self, bound: &EndpointConfig) -> bool {
        let next = self.active_rx.borrow_and_update();
        next.as_ref().is_some_and(|next| differs(bound, next))
    }

    async fn dispatch(&self, event: RealtimeEvent) {
        if event.source == EventSource::Gateway {
            if let Some(connected) = event.connection_signal() {
                info!(connected, "Gateway reported agent status");
                self.state_tx
                    .send_modify(|s| s.gateway_reported = Some(connected));
            }
        }
        if let Some(router) = &self.router {
            router.apply(&event).await;
        }
        self.bus.publish(event).await;
    }

    // =========================================================================
    // State Transitions
    // =========================================================================

    async fn mark_connected(&mut self, endpoint: &EndpointConfig) {
        self.policy.reset();
        let now = self.clock.now();
        let id = endpoint.id.clone();
        self.state_tx.send_modify(|s| {
            s.phase = ConnectionPhase::Connected;
            s.bound_endpoint_id = Some(id);
            s.last_connected_at = Some(now);
            s.consecutive_error_count = 0;
            s.reconnect_attempt = 0;
            s.next_retry_ms = None;
            s.last_error = None;
            s.gave_up = false;
            s.gateway_reported = None;
        });
        info!(endpoint_id = %endpoint.id, "Gateway stream connected");

        self.bus
            .publish(RealtimeEvent::connection(true, Some(&endpoint.id), now))
            .await;
    }

    async fn announce_disconnected(&self, endpoint_id: Option<&str>) {
        if let Some(id) = endpoint_id {
            let event = RealtimeEvent::connection(false, Some(id), self.clock.now());
            self.bus.publish(event).await;
        }
    }

    fn set_disconnected(&self) {
        self.state_tx.send_modify(|s| {
            s.phase = ConnectionPhase::Disconnected;
            s.reconnect_attempt = 0;
            s.next_retry_ms = None;
        });
    }

    fn give_up(&self, reason: String) {
        self.state_tx
            .send_modify(|s| *s = std::mem::take(s).exhausted(reason));
    }

    async fn interrupted(&self, interrupt: Interrupt, left: Option<&str>) -> Flow {
        self.set_disconnected();
        self.announce_disconnected(left).await;

        match interrupt {
            Interrupt::Disconnect(ack) => {
                info!("Disconnected by client");
                let _ = ack.send(());
                Flow::Idle
            }
            Interrupt::Shutdown => Flow::Stop,
        }
    }

    /// Registry this manager follows.
    pub fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryConfig;
    use crate::testing::{AuthMode, MockGateway, ScriptedProbe};
    use gatewatch_core::event::RealtimeEventType;
    use serde_json::json;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(200),
            max_reconnect_attempts: 0,
            auth_timeout: Duration::from_millis(300),
            ..Default::default()
        }
    }

    struct Fixture {
        probe: Arc<ScriptedProbe>,
        registry: EndpointRegistry,
        bus: EventBus,
        handle: ConnectionHandle,
    }

    async fn fixture(config: ConnectionConfig, endpoints: &[(&str, &str, i32)]) -> Fixture {
        let probe = Arc::new(ScriptedProbe::default());
        let registry = EndpointRegistry::new(probe.clone(), RegistryConfig::default());
        for (id, url, priority) in endpoints {
            probe.set(id, Some(10));
            registry
                .register(
                    EndpointConfig::new(*id, *url)
                        .with_priority(*priority)
                        .with_credential("tok"),
                )
                .await
                .unwrap();
        }

        let bus = EventBus::new();
        let (manager, handle) = ConnectionManager::new(config, registry.clone(), bus.clone());
        manager.spawn();

        Fixture {
            probe,
            registry,
            bus,
            handle,
        }
    }

    async fn wait_state<F>(handle: &ConnectionHandle, mut predicate: F) -> ConnectionState
    where
        F: FnMut(&ConnectionState) -> bool,
    {
        let mut rx = handle.subscribe();
        let state = tokio::time::timeout(WAIT, rx.wait_for(|s| predicate(s)))
            .await
            .expect("timed out waiting for connection state")
            .expect("connection manager gone")
            .clone();
        state
    }

    #[test]
    fn test_config_from_settings() {
        let config = ConnectionConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.initial_backoff, Duration::from_secs(1));
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert!(!config.require_auth_ack);
        assert!(!config.give_up_on_auth_rejection);
    }

    #[tokio::test]
    async fn test_connect_authenticates_and_fans_out_events() {
        let gw = MockGateway::start().await;
        let f = fixture(fast_config(), &[("a", &gw.url(), 1)]).await;
        let mut events = f.bus.subscribe();

        f.handle.connect().await.unwrap();
        let state = wait_state(&f.handle, |s| s.is_connected()).await;
        assert_eq!(state.bound_endpoint_id.as_deref(), Some("a"));
        assert!(state.last_connected_at.is_some());

        let auth = gw.wait_for_frames("auth", 1).await;
        assert_eq!(auth[0]["token"], "tok");

        let connected = events.recv().await.unwrap();
        assert_eq!(connected.connection_signal(), Some(true));
        assert_eq!(connected.source, EventSource::Internal);

        gw.push(json!({
            "type": "session_created",
            "data": {"sessionKey": "s9", "timestamp": "2026-01-01T00:00:00Z"}
        }));
        let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(event.kind, RealtimeEventType::SessionCreated);
        assert_eq!(event.data.session_key.as_deref(), Some("s9"));

        f.handle.send(ClientMessage::Ping).await.unwrap();
        gw.wait_for_frames("ping", 1).await;
    }

    #[tokio::test]
    async fn test_gateway_agent_status_recorded() {
        let gw = MockGateway::start().await;
        let f = fixture(fast_config(), &[("a", &gw.url(), 1)]).await;
        let mut events = f.bus.subscribe();

        f.handle.connect().await.unwrap();
        wait_state(&f.handle, |s| s.is_connected()).await;
        gw.wait_for_frames("auth", 1).await;
        assert_eq!(f.handle.state().gateway_reported, None);

        gw.push(json!({
            "type": "agent_status",
            "data": {"status": "disconnected", "timestamp": "2026-01-01T00:00:00Z"}
        }));
        let state = wait_state(&f.handle, |s| s.gateway_reported == Some(false)).await;
        assert!(state.is_connected());

        // Still fanned out to subscribers, after the internal connected signal.
        let internal = events.recv().await.unwrap();
        assert_eq!(internal.source, EventSource::Internal);
        let reported = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
        assert_eq!(reported.source, EventSource::Gateway);
        assert_eq!(reported.connection_signal(), Some(false));

        gw.push(json!({
            "type": "agent_status",
            "data": {"status": "connected", "timestamp": "2026-01-01T00:00:01Z"}
        }));
        wait_state(&f.handle, |s| s.gateway_reported == Some(true)).await;
    }

    #[tokio::test]
    async fn test_heartbeat_sends_pings() {
        let gw = MockGateway::start().await;
        let config = ConnectionConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..fast_config()
        };
        let f = fixture(config, &[("a", &gw.url(), 1)]).await;

        f.handle.connect().await.unwrap();
        wait_state(&f.handle, |s| s.is_connected()).await;
        gw.wait_for_frames("ping", 2).await;
    }

    #[tokio::test]
    async fn test_auth_ack_required() {
        let gw = MockGateway::start().await;
        let config = ConnectionConfig {
            require_auth_ack: true,
            ..fast_config()
        };
        let f = fixture(config, &[("a", &gw.url(), 1)]).await;

        f.handle.connect().await.unwrap();
        wait_state(&f.handle, |s| s.is_connected()).await;
    }

    #[tokio::test]
    async fn test_missing_auth_ack_times_out_and_retries() {
        let gw = MockGateway::start().await;
        gw.set_auth_mode(AuthMode::Silent);
        let config = ConnectionConfig {
            require_auth_ack: true,
            ..fast_config()
        };
        let f = fixture(config, &[("a", &gw.url(), 1)]).await;

        f.handle.connect().await.unwrap();
        let state = wait_state(&f.handle, |s| {
            s.last_error.as_deref().is_some_and(|e| e.contains("Timeout"))
        })
        .await;
        assert!(state.reconnect_attempt >= 1);
        assert!(!state.gave_up);
        assert!(!state.is_connected());
    }

    #[tokio::test]
    async fn test_auth_rejection_retried_by_default() {
        let gw = MockGateway::start().await;
        gw.set_auth_mode(AuthMode::Reject);
        let f = fixture(
            ConnectionConfig {
                require_auth_ack: true,
                ..fast_config()
            },
            &[("a", &gw.url(), 1)],
        )
        .await;

        f.handle.connect().await.unwrap();
        wait_state(&f.handle, |s| s.reconnect_attempt >= 2).await;
        assert!(gw.sessions() >= 2);
    }

    #[tokio::test]
    async fn test_auth_rejection_gives_up_when_configured() {
        let gw = MockGateway::start().await;
        gw.set_auth_mode(AuthMode::Reject);
        let config = ConnectionConfig {
            require_auth_ack: true,
            give_up_on_auth_rejection: true,
            ..fast_config()
        };
        let f = fixture(config, &[("a", &gw.url(), 1)]).await;

        f.handle.connect().await.unwrap();
        let state = wait_state(&f.handle, |s| s.gave_up).await;
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert!(state.last_error.unwrap().contains("bad token"));
    }

    #[tokio::test]
    async fn test_auth_close_code_counts_as_rejection() {
        let gw = MockGateway::start().await;
        let config = ConnectionConfig {
            give_up_on_auth_rejection: true,
            ..fast_config()
        };
        let f = fixture(config, &[("a", &gw.url(), 1)]).await;

        f.handle.connect().await.unwrap();
        wait_state(&f.handle, |s| s.is_connected()).await;
        gw.wait_for_frames("auth", 1).await;

        gw.kick(4001);
        let state = wait_state(&f.handle, |s| s.gave_up).await;
        assert!(state.last_error.unwrap().contains("4001"));
    }

    #[tokio::test]
    async fn test_reconnects_after_server_close() {
        let gw = MockGateway::start().await;
        let f = fixture(fast_config(), &[("a", &gw.url(), 1)]).await;
        let mut events = f.bus.subscribe();

        f.handle.connect().await.unwrap();
        wait_state(&f.handle, |s| s.is_connected()).await;
        gw.wait_for_frames("auth", 1).await;

        gw.kick(1001);
        gw.wait_for_frames("auth", 2).await;
        let state = wait_state(&f.handle, |s| s.is_connected()).await;
        assert_eq!(state.consecutive_error_count, 0);
        assert_eq!(gw.sessions(), 2);

        let signals: Vec<Option<bool>> = [
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
            events.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.connection_signal())
        .collect();
        assert_eq!(signals, vec![Some(true), Some(false), Some(true)]);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        // Bind and drop to get a port nobody listens on.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let config = ConnectionConfig {
            max_reconnect_attempts: 2,
            ..fast_config()
        };
        let f = fixture(config, &[("a", &url, 1)]).await;

        f.handle.connect().await.unwrap();
        let state = wait_state(&f.handle, |s| s.gave_up).await;
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert_eq!(state.reconnect_attempt, 0);
        assert!(state.last_error.is_some());

        // connect() re-arms after a give-up.
        f.handle.connect().await.unwrap();
        wait_state(&f.handle, |s| !s.gave_up).await;
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let gw = MockGateway::start().await;
        let f = fixture(fast_config(), &[("a", &gw.url(), 1)]).await;

        f.handle.disconnect().await.unwrap();

        f.handle.connect().await.unwrap();
        wait_state(&f.handle, |s| s.is_connected()).await;

        f.handle.disconnect().await.unwrap();
        assert_eq!(f.handle.state().phase, ConnectionPhase::Disconnected);
        f.handle.disconnect().await.unwrap();

        let state = f.handle.state();
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert!(!state.gave_up);
        assert!(matches!(
            f.handle.send(ClientMessage::Ping).await,
            Err(SyncError::NotConnected)
        ));

        // No redial after a manual disconnect.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(gw.sessions(), 1);
    }

    #[tokio::test]
    async fn test_connect_waits_for_active_endpoint() {
        let gw = MockGateway::start().await;
        let probe = Arc::new(ScriptedProbe::default());
        probe.set("a", None);
        let registry = EndpointRegistry::new(probe.clone(), RegistryConfig::default());
        registry
            .register(EndpointConfig::new("a", gw.url()))
            .await
            .unwrap();

        let (manager, handle) =
            ConnectionManager::new(fast_config(), registry.clone(), EventBus::new());
        manager.spawn();

        handle.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let state = handle.state();
        assert_eq!(state.phase, ConnectionPhase::Disconnected);
        assert!(!state.gave_up);

        probe.set("a", Some(5));
        registry.run_health_cycle().await;
        let state = wait_state(&handle, |s| s.is_connected()).await;
        assert_eq!(state.bound_endpoint_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_failover_rebinds_stream() {
        let gw_a = MockGateway::start().await;
        let gw_b = MockGateway::start().await;
        let f = fixture(
            fast_config(),
            &[("a", &gw_a.url(), 10), ("b", &gw_b.url(), 5)],
        )
        .await;

        f.handle.connect().await.unwrap();
        let state = wait_state(&f.handle, |s| s.is_connected()).await;
        assert_eq!(state.bound_endpoint_id.as_deref(), Some("a"));

        f.probe.set("a", None);
        f.registry.run_health_cycle().await;

        let state = wait_state(&f.handle, |s| {
            s.is_connected() && s.bound_endpoint_id.as_deref() == Some("b")
        })
        .await;
        assert!(!state.gave_up);
        gw_b.wait_for_frames("auth", 1).await;
    }

    #[tokio::test]
    async fn test_shutdown_stops_manager() {
        let gw = MockGateway::start().await;
        let f = fixture(fast_config(), &[("a", &gw.url(), 1)]).await;

        f.handle.connect().await.unwrap();
        wait_state(&f.handle, |s| s.is_connected()).await;

        f.handle.shutdown().await;
        wait_state(&f.handle, |s| s.phase == ConnectionPhase::Disconnected).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(f.handle.connect().await.is_err());
    }
}
