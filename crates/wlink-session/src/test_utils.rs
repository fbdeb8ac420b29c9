//! Test utilities for broker sessions
//!
//! [`MockBroker`] is a loopback WebSocket server speaking the broker's
//! envelope protocol. It answers logins and reads according to a
//! [`BrokerBehavior`], records every envelope it receives, and lets tests
//! push frames or kill connections on demand.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};

use wlink_core::ConnectionConfig;

use crate::protocol::{cmd, Envelope};
use crate::session::SessionTiming;

/// How the mock broker answers requests.
#[derive(Debug, Clone)]
pub struct BrokerBehavior {
    /// Logins to reject (with `success:false`) before accepting one.
    pub login_failures: usize,
    /// When false, logins are never answered.
    pub answer_login: bool,
    /// When true, every `c2s_read` is answered with an `s2c_noti`.
    pub answer_reads: bool,
    /// Attributes reported in read replies.
    pub read_attrs: Map<String, Value>,
}

impl Default for BrokerBehavior {
    fn default() -> Self {
        Self {
            login_failures: 0,
            answer_login: true,
            answer_reads: true,
            read_attrs: Map::new(),
        }
    }
}

/// An envelope received from a client.
#[derive(Debug, Clone)]
pub struct Received {
    /// 1-based index of the connection it arrived on.
    pub connection: usize,
    pub envelope: Envelope,
}

#[derive(Debug)]
enum BrokerAction {
    Send(String),
    Close(u16),
    Drop,
}

#[derive(Debug, Default)]
struct BrokerShared {
    behavior: Mutex<BrokerBehavior>,
    received: Mutex<Vec<Received>>,
    client_close_codes: Mutex<Vec<Option<u16>>>,
    clients: Mutex<Vec<mpsc::UnboundedSender<BrokerAction>>>,
    connections: AtomicUsize,
    changed: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Loopback broker for session tests.
pub struct MockBroker {
    addr: SocketAddr,
    shared: Arc<BrokerShared>,
    accept_task: JoinHandle<()>,
}

impl MockBroker {
    pub async fn start() -> Self {
        Self::start_with(BrokerBehavior::default()).await
    }

    pub async fn start_with(behavior: BrokerBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock broker");
        let addr = listener.local_addr().expect("mock broker address");
        let shared = Arc::new(BrokerShared {
            behavior: Mutex::new(behavior),
            ..Default::default()
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let index = accept_shared.connections.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::spawn(serve_connection(Arc::clone(&accept_shared), index, tcp));
            }
        });

        Self {
            addr,
            shared,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    /// A config pointing both partitions at this broker.
    pub fn config(&self) -> ConnectionConfig {
        ConnectionConfig {
            app_id: "test-app".to_string(),
            user_id: "test-user".to_string(),
            user_token: "test-token".to_string(),
            production_url: self.url(),
            sandbox_url: self.url(),
            open_api_url: None,
            language: None,
        }
    }

    pub fn update_behavior(&self, f: impl FnOnce(&mut BrokerBehavior)) {
        f(&mut lock(&self.shared.behavior));
    }

    /// Connections accepted so far.
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        lock(&self.shared.received).clone()
    }

    /// Received envelopes carrying `command`.
    pub fn count(&self, command: &str) -> usize {
        lock(&self.shared.received)
            .iter()
            .filter(|r| r.envelope.is(command))
            .count()
    }

    /// Close codes of client-initiated closes, in arrival order.
    pub fn client_close_codes(&self) -> Vec<Option<u16>> {
        lock(&self.shared.client_close_codes).clone()
    }

    /// Send `envelope` on the most recent connection.
    pub fn push(&self, envelope: &Envelope) {
        self.push_raw(&envelope.encode().expect("encode pushed envelope"));
    }

    /// Send a raw text frame on the most recent connection.
    pub fn push_raw(&self, text: &str) {
        self.act(BrokerAction::Send(text.to_string()));
    }

    /// Close the most recent connection with a close frame carrying `code`.
    pub fn close_latest(&self, code: u16) {
        self.act(BrokerAction::Close(code));
    }

    /// Drop the most recent connection without a close frame.
    pub fn drop_latest(&self) {
        self.act(BrokerAction::Drop);
    }

    fn act(&self, action: BrokerAction) {
        if let Some(client) = lock(&self.shared.clients).last() {
            let _ = client.send(action);
        }
    }

    /// Wait until at least `count` envelopes carrying `command` arrived.
    pub async fn wait_for_command(&self, command: &str, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.count(command) >= count).await
    }

    /// Wait until at least `count` connections were accepted.
    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.connections() >= count).await
    }

    /// Wait until at least `count` client close frames arrived.
    pub async fn wait_for_client_closes(&self, count: usize, timeout: Duration) -> bool {
        self.wait_until(timeout, || self.client_close_codes().len() >= count)
            .await
    }

    async fn wait_until(&self, timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let changed = self.shared.changed.notified();
                if done() {
                    return;
                }
                changed.await;
            }
        })
        .await
        .is_ok()
    }
}

impl Drop for MockBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
        for client in lock(&self.shared.clients).iter() {
            let _ = client.send(BrokerAction::Drop);
        }
    }
}

impl BrokerShared {
    fn replies_for(&self, envelope: &Envelope) -> Vec<Envelope> {
        let mut behavior = lock(&self.behavior);
        match envelope.command.as_str() {
            cmd::LOGIN_REQUEST if behavior.answer_login => {
                let success = if behavior.login_failures > 0 {
                    behavior.login_failures -= 1;
                    false
                } else {
                    true
                };
                vec![login_response(success)]
            }
            cmd::READ_REQUEST if behavior.answer_reads => {
                let did = envelope.field("did").cloned().unwrap_or(Value::Null);
                vec![Envelope::decode(
                    &json!({
                        "cmd": cmd::DEVICE_STATE,
                        "data": { "did": did, "attrs": Value::Object(behavior.read_attrs.clone()) },
                    })
                    .to_string(),
                )
                .expect("read reply envelope")]
            }
            _ => Vec::new(),
        }
    }

    fn record(&self, connection: usize, envelope: Envelope) {
        lock(&self.received).push(Received {
            connection,
            envelope,
        });
        self.changed.notify_waiters();
    }
}

/// `login_res` envelope.
pub fn login_response(success: bool) -> Envelope {
    Envelope::decode(&json!({ "cmd": cmd::LOGIN_RESPONSE, "data": { "success": success } }).to_string())
        .expect("login response envelope")
}

/// `s2c_online_status` envelope.
pub fn online_status(device_id: &str, online: bool) -> Envelope {
    Envelope::decode(
        &json!({ "cmd": cmd::ONLINE_STATUS, "data": { "did": device_id, "online": online } })
            .to_string(),
    )
    .expect("online status envelope")
}

/// `s2c_noti` envelope.
pub fn device_state(device_id: &str, attrs: Value) -> Envelope {
    Envelope::decode(
        &json!({ "cmd": cmd::DEVICE_STATE, "data": { "did": device_id, "attrs": attrs } })
            .to_string(),
    )
    .expect("device state envelope")
}

/// Timings short enough for loopback tests.
pub fn fast_timing() -> SessionTiming {
    SessionTiming {
        login_timeout: Duration::from_millis(300),
        login_retry_delay: Duration::from_millis(50),
        send_retry_delay: Duration::from_millis(50),
        heartbeat_interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(100),
    }
}

async fn serve_connection(shared: Arc<BrokerShared>, index: usize, tcp: TcpStream) {
    let Ok(ws) = accept_async(tcp).await else {
        return;
    };
    let (mut sink, mut stream) = ws.split();
    let (action_tx, mut action_rx) = mpsc::unbounded_channel();
    lock(&shared.clients).push(action_tx);
    shared.changed.notify_waiters();

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Ok(envelope) = Envelope::decode(text.as_str()) else {
                            continue;
                        };
                        let replies = shared.replies_for(&envelope);
                        shared.record(index, envelope);
                        for reply in replies {
                            let Ok(text) = reply.encode() else { continue };
                            if sink.send(WsMessage::Text(text.into())).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        lock(&shared.client_close_codes).push(frame.map(|f| u16::from(f.code)));
                        shared.changed.notify_waiters();
                        return;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => return,
                }
            }

            action = action_rx.recv() => {
                match action {
                    Some(BrokerAction::Send(text)) => {
                        let _ = sink.send(WsMessage::Text(text.into())).await;
                    }
                    Some(BrokerAction::Close(code)) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        };
                        let _ = sink.send(WsMessage::Close(Some(frame))).await;
                        return;
                    }
                    Some(BrokerAction::Drop) | None => return,
                }
            }
        }
    }
}
