//! One broker session: a single WebSocket plus its login and heartbeat cycle.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          Session                             │
//! │                                                              │
//! │  connect() ──┐                                               │
//! │  disconnect()├─▶ Link (mutex) ── generation, socket, flags   │
//! │  send()  ────┘        │                                      │
//! │                       ▼                                      │
//! │   ┌──────────────────────────┐   ┌────────────────────────┐  │
//! │   │ socket task (per socket) │   │ session task (per open)│  │
//! │   │  read → classify → bus   │   │  login loop            │  │
//! │   │  outbound → write        │   │  heartbeat loop        │  │
//! │   └──────────────────────────┘   └────────────────────────┘  │
//! │                       │                                      │
//! │   events ◀────────────┘  (pushes, state changes)             │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every socket is stamped with a generation number taken under the link
//! lock. Callbacks from a socket whose generation is no longer current are
//! ignored, which is what keeps overlapping reconnects and replaced sockets
//! from stepping on each other.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use wlink_core::prelude::*;
use wlink_core::{ConnectionConfig, Partition};

use crate::bus::ResponseBus;
use crate::channel::CommandChannel;
use crate::protocol::{
    classify, cmd, BrokerMessage, DeviceNotification, Envelope, LoginResponse, OnlineStatus,
    NORMAL_CLOSURE,
};

#[cfg(test)]
mod tests;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

// ---------------------------------------------------------------------------
// Timing, state, events
// ---------------------------------------------------------------------------

/// Delays and timeouts driving one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTiming {
    /// How long to wait for `login_res` after sending `login_req`.
    pub login_timeout: Duration,
    /// Pause before retrying a rejected or unanswered login.
    pub login_retry_delay: Duration,
    /// Pause before retrying a login that could not be sent at all.
    pub send_retry_delay: Duration,
    pub heartbeat_interval: Duration,
    /// Pause between an abnormal close and the next connect attempt.
    pub reconnect_delay: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            login_timeout: Duration::from_millis(1500),
            login_retry_delay: Duration::from_millis(2000),
            send_retry_delay: Duration::from_millis(1500),
            heartbeat_interval: Duration::from_millis(15000),
            reconnect_delay: Duration::from_millis(2000),
        }
    }
}

/// Where a session is in its connect cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No socket and no intent to have one.
    Disconnected,
    /// Socket handshake in progress.
    Connecting,
    /// Socket open, login not yet accepted.
    OpenUnauthenticated,
    /// Logged in and heartbeating.
    Authenticated,
    /// Socket lost; a reconnect is scheduled.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::OpenUnauthenticated => "open_unauthenticated",
            SessionState::Authenticated => "authenticated",
            SessionState::Closed => "closed",
        }
    }
}

/// Events a session reports to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged {
        partition: Partition,
        state: SessionState,
    },
    /// Login accepted. Emitted once per connect cycle, before heartbeating.
    Authenticated { partition: Partition },
    /// `s2c_online_status` push.
    ConnectionState {
        partition: Partition,
        status: OnlineStatus,
    },
    /// `s2c_noti` push (also the reply to reads and writes).
    DeviceState {
        partition: Partition,
        notification: DeviceNotification,
    },
}

impl SessionEvent {
    pub fn partition(&self) -> Partition {
        match self {
            SessionEvent::StateChanged { partition, .. }
            | SessionEvent::Authenticated { partition }
            | SessionEvent::ConnectionState { partition, .. }
            | SessionEvent::DeviceState { partition, .. } => *partition,
        }
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// A long-lived broker session for one partition.
///
/// The session outlives its sockets: `connect` and `disconnect` may be called
/// any number of times. Socket work runs on spawned tokio tasks, so
/// [`Session::connect`] must be called from within a runtime.
///
/// Dropping the session disconnects it.
#[derive(Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    partition: Partition,
    timing: SessionTiming,
    bus: ResponseBus,
    events: mpsc::UnboundedSender<SessionEvent>,
    link: Mutex<Link>,
}

/// Mutable connection state, only touched under the link lock.
#[derive(Debug)]
struct Link {
    config: Option<ConnectionConfig>,
    /// True between `connect` and `disconnect`, regardless of socket health.
    logically_connected: bool,
    /// Bumped whenever the current socket is replaced or torn down.
    generation: u64,
    socket: Option<SocketHandle>,
    /// True between the open callback and the close/failure callback.
    open: bool,
    state: SessionState,
    session_task: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct SocketHandle {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
}

#[derive(Debug)]
enum Outbound {
    Text(String),
    Close(u16),
}

impl Session {
    pub fn new(
        partition: Partition,
        timing: SessionTiming,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                partition,
                timing,
                bus: ResponseBus::new(),
                events,
                link: Mutex::new(Link {
                    config: None,
                    logically_connected: false,
                    generation: 0,
                    socket: None,
                    open: false,
                    state: SessionState::Disconnected,
                    session_task: None,
                }),
            }),
        }
    }

    pub fn partition(&self) -> Partition {
        self.inner.partition
    }

    pub fn timing(&self) -> SessionTiming {
        self.inner.timing
    }

    /// Bus carrying every decoded inbound envelope.
    pub fn responses(&self) -> &ResponseBus {
        &self.inner.bus
    }

    /// True between `connect` and `disconnect`.
    pub fn is_connected(&self) -> bool {
        self.inner.lock_link().logically_connected
    }

    /// True while the current socket is open.
    pub fn is_open(&self) -> bool {
        self.inner.lock_link().open
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_link().state
    }

    /// Config of the current or most recent connection.
    pub fn config(&self) -> Option<ConnectionConfig> {
        self.inner.lock_link().config.clone()
    }

    /// Bring the session up with `config`.
    ///
    /// Already connected with the same identity for this partition: no-op.
    /// Already connected with a different identity: the old socket is closed
    /// normally and replaced. Returns `true` if a new socket was opened.
    pub fn connect(&self, config: &ConnectionConfig) -> bool {
        let partition = self.inner.partition;
        let mut link = self.inner.lock_link();

        if link.logically_connected {
            let unchanged = link
                .config
                .as_ref()
                .is_some_and(|current| current.same_identity(config, partition));
            if unchanged {
                link.config = Some(config.clone());
                return false;
            }
            info!("[{}] connection identity changed, replacing socket", partition);
            self.inner.close_socket(&mut link, NORMAL_CLOSURE);
        }

        link.config = Some(config.clone());
        link.logically_connected = true;
        SessionInner::open_socket(&self.inner, &mut link);
        true
    }

    /// Tear the socket down with a normal closure. Returns `false` if the
    /// session was not connected.
    pub fn disconnect(&self) -> bool {
        let mut link = self.inner.lock_link();
        if !link.logically_connected {
            return false;
        }
        info!("[{}] disconnecting", self.inner.partition);
        self.inner.close_socket(&mut link, NORMAL_CLOSURE);
        link.logically_connected = false;
        self.inner.set_state(&mut link, SessionState::Disconnected);
        true
    }

    /// Queue `envelope` on the open socket. Returns `false` (and sends
    /// nothing) unless the session is connected and the socket is open.
    pub fn send(&self, envelope: &Envelope) -> bool {
        self.inner.send(envelope)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl CommandChannel for Session {
    fn partition(&self) -> Partition {
        self.inner.partition
    }

    fn send_command(&self, envelope: &Envelope) -> bool {
        self.inner.send(envelope)
    }

    async fn request(
        &self,
        envelope: &Envelope,
        response_command: &str,
        timeout: Duration,
    ) -> Option<Envelope> {
        let pending = self.inner.bus.expect(response_command);
        if !self.inner.send(envelope) {
            return None;
        }
        pending.wait(timeout).await
    }
}

// ---------------------------------------------------------------------------
// Link transitions
// ---------------------------------------------------------------------------

impl SessionInner {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn set_state(&self, link: &mut Link, state: SessionState) {
        if link.state == state {
            return;
        }
        debug!("[{}] {} -> {}", self.partition, link.state.as_str(), state.as_str());
        link.state = state;
        self.emit(SessionEvent::StateChanged {
            partition: self.partition,
            state,
        });
    }

    /// Start a fresh socket against the stored config.
    fn open_socket(this: &Arc<Self>, link: &mut Link) {
        let Some(config) = link.config.as_ref() else {
            return;
        };
        let url = config.endpoint(this.partition).to_string();

        link.generation += 1;
        let generation = link.generation;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        link.socket = Some(SocketHandle {
            generation,
            outbound: outbound_tx,
        });
        link.open = false;
        this.set_state(link, SessionState::Connecting);

        info!("[{}] connecting to {} (socket #{})", this.partition, url, generation);
        tokio::spawn(run_socket(Arc::clone(this), generation, url, outbound_rx));
    }

    /// Close the current socket with `code` and invalidate its callbacks.
    fn close_socket(&self, link: &mut Link, code: u16) {
        if let Some(socket) = link.socket.take() {
            debug!("[{}] closing socket #{} with code {}", self.partition, socket.generation, code);
            let _ = socket.outbound.send(Outbound::Close(code));
        }
        link.generation += 1;
        link.open = false;
        if let Some(task) = link.session_task.take() {
            task.abort();
        }
    }

    /// Socket handshake finished. Returns `false` if the socket is stale and
    /// should be closed instead.
    fn on_open(this: &Arc<Self>, generation: u64) -> bool {
        let mut link = this.lock_link();
        if link.generation != generation || !link.logically_connected {
            return false;
        }
        link.open = true;
        this.set_state(&mut link, SessionState::OpenUnauthenticated);

        if let Some(task) = link.session_task.take() {
            task.abort();
        }
        link.session_task = Some(tokio::spawn(run_session_task(Arc::clone(this), generation)));
        true
    }

    /// The socket failed or was closed by the peer.
    ///
    /// `close_code` is the peer's close code, or `None` for transport
    /// failures and closes without a code.
    fn on_socket_lost(this: &Arc<Self>, generation: u64, close_code: Option<u16>) {
        let mut link = this.lock_link();
        if link.generation != generation {
            trace!("[{}] ignoring loss of stale socket #{}", this.partition, generation);
            return;
        }

        link.open = false;
        link.socket = None;
        if let Some(task) = link.session_task.take() {
            task.abort();
        }

        if close_code == Some(NORMAL_CLOSURE) || !link.logically_connected {
            info!("[{}] socket #{} closed normally", this.partition, generation);
            link.logically_connected = false;
            this.set_state(&mut link, SessionState::Disconnected);
            return;
        }

        warn!(
            "[{}] socket #{} lost (close code {:?}), reconnecting in {:?}",
            this.partition, generation, close_code, this.timing.reconnect_delay
        );
        this.set_state(&mut link, SessionState::Closed);

        let inner = Arc::clone(this);
        let delay = this.timing.reconnect_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            SessionInner::reconnect(&inner, generation);
        });
    }

    /// Reopen the socket lost at `generation`, unless something replaced or
    /// tore it down in the meantime.
    fn reconnect(this: &Arc<Self>, generation: u64) {
        let mut link = this.lock_link();
        if link.generation != generation || !link.logically_connected || link.socket.is_some() {
            debug!("[{}] reconnect for socket #{} superseded", this.partition, generation);
            return;
        }
        SessionInner::open_socket(this, &mut link);
    }

    fn is_current_open(&self, generation: u64) -> bool {
        let link = self.lock_link();
        link.generation == generation && link.open
    }

    fn mark_authenticated(&self, generation: u64) -> bool {
        let mut link = self.lock_link();
        if link.generation != generation || !link.open {
            return false;
        }
        info!("[{}] login accepted", self.partition);
        self.set_state(&mut link, SessionState::Authenticated);
        self.emit(SessionEvent::Authenticated {
            partition: self.partition,
        });
        true
    }

    fn send(&self, envelope: &Envelope) -> bool {
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(err) => {
                warn!("[{}] failed to encode {}: {}", self.partition, envelope.command, err);
                return false;
            }
        };

        let link = self.lock_link();
        if !link.logically_connected || !link.open {
            trace!("[{}] dropping {}: session not open", self.partition, envelope.command);
            return false;
        }
        match &link.socket {
            Some(socket) => socket.outbound.send(Outbound::Text(text)).is_ok(),
            None => false,
        }
    }

    /// Route one inbound text frame.
    fn handle_text(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!(
                    "[{}] dropping malformed frame ({}): {}",
                    self.partition,
                    err,
                    text.chars().take(120).collect::<String>()
                );
                return;
            }
        };

        match classify(&envelope) {
            BrokerMessage::OnlineStatus(status) => self.emit(SessionEvent::ConnectionState {
                partition: self.partition,
                status,
            }),
            BrokerMessage::DeviceState(notification) => self.emit(SessionEvent::DeviceState {
                partition: self.partition,
                notification,
            }),
            BrokerMessage::Other => {}
        }

        self.bus.publish(envelope);
    }
}

// ---------------------------------------------------------------------------
// Socket task
// ---------------------------------------------------------------------------

async fn run_socket(
    inner: Arc<SessionInner>,
    generation: u64,
    url: String,
    outbound: mpsc::UnboundedReceiver<Outbound>,
) {
    let ws_stream = match connect_async(url.as_str()).await {
        Ok((ws_stream, _response)) => ws_stream,
        Err(err) => {
            let err = Error::transport(format!("failed to connect to {url}: {err}"));
            warn!("[{}] {}", inner.partition, err);
            SessionInner::on_socket_lost(&inner, generation, None);
            return;
        }
    };

    let (mut ws_sink, ws_stream) = ws_stream.split();

    if !SessionInner::on_open(&inner, generation) {
        debug!("[{}] socket #{} opened after being replaced", inner.partition, generation);
        send_close(&mut ws_sink, NORMAL_CLOSURE).await;
        return;
    }

    let close_code = run_io_loop(&inner, ws_sink, ws_stream, outbound).await;
    SessionInner::on_socket_lost(&inner, generation, close_code);
}

/// Read/write select loop for one open socket.
///
/// Returns the close code: ours for a local close, the peer's for a remote
/// close frame, `None` for errors and bare disconnects.
async fn run_io_loop(
    inner: &SessionInner,
    mut ws_sink: SplitSink<WsStream, WsMessage>,
    mut ws_stream: SplitStream<WsStream>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) -> Option<u16> {
    loop {
        tokio::select! {
            frame = ws_stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => inner.handle_text(text.as_str()),
                    Some(Ok(WsMessage::Close(frame))) => {
                        let code = frame.map(|frame| u16::from(frame.code));
                        debug!("[{}] received close frame {:?}", inner.partition, code);
                        return code;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!("[{}] websocket read error: {}", inner.partition, err);
                        return None;
                    }
                    None => {
                        debug!("[{}] websocket stream ended", inner.partition);
                        return None;
                    }
                }
            }

            out = outbound.recv() => {
                match out {
                    Some(Outbound::Text(text)) => {
                        if let Err(err) = ws_sink.send(WsMessage::Text(text.into())).await {
                            warn!("[{}] websocket write error: {}", inner.partition, err);
                            return None;
                        }
                    }
                    Some(Outbound::Close(code)) => {
                        send_close(&mut ws_sink, code).await;
                        return Some(code);
                    }
                    None => {
                        send_close(&mut ws_sink, NORMAL_CLOSURE).await;
                        return Some(NORMAL_CLOSURE);
                    }
                }
            }
        }
    }
}

async fn send_close(ws_sink: &mut SplitSink<WsStream, WsMessage>, code: u16) {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: "".into(),
    };
    let _ = ws_sink.send(WsMessage::Close(Some(frame))).await;
    let _ = ws_sink.close().await;
}

// ---------------------------------------------------------------------------
// Session task: login, then heartbeat
// ---------------------------------------------------------------------------

async fn run_session_task(inner: Arc<SessionInner>, generation: u64) {
    let timing = inner.timing;

    loop {
        if !inner.is_current_open(generation) {
            return;
        }
        let Some(config) = inner.lock_link().config.clone() else {
            return;
        };

        let pending = inner.bus.expect(cmd::LOGIN_RESPONSE);
        if !inner.send(&Envelope::login(&config)) {
            debug!("[{}] login send refused, retrying", inner.partition);
            tokio::time::sleep(timing.send_retry_delay).await;
            continue;
        }

        match pending
            .wait(timing.login_timeout)
            .await
            .map(|envelope| envelope.payload::<LoginResponse>())
        {
            Some(Some(LoginResponse { success: true })) => break,
            Some(_) => {
                let err = Error::LoginRejected {
                    app_id: config.app_id.clone(),
                };
                warn!("[{}] {}, retrying", inner.partition, err);
            }
            None => warn!("[{}] login timed out, retrying", inner.partition),
        }
        tokio::time::sleep(timing.login_retry_delay).await;
    }

    if !inner.mark_authenticated(generation) {
        return;
    }

    // First tick fires immediately: one ping right after login.
    let mut heartbeat = tokio::time::interval(timing.heartbeat_interval);
    loop {
        heartbeat.tick().await;
        if !inner.is_current_open(generation) {
            return;
        }
        if !inner.send(&Envelope::heartbeat()) {
            trace!("[{}] heartbeat dropped", inner.partition);
        }
    }
}
