use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use wlink_core::{ConnectionConfig, Partition};

use super::*;
use crate::channel::CommandChannel;
use crate::test_utils::{device_state, fast_timing, online_status, BrokerBehavior, MockBroker};

const WAIT: Duration = Duration::from_secs(5);

fn new_session() -> (Session, mpsc::UnboundedReceiver<SessionEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Session::new(Partition::Sandbox, fast_timing(), tx), rx)
}

async fn wait_event(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    mut pred: impl FnMut(&SessionEvent) -> bool,
) -> Option<SessionEvent> {
    tokio::time::timeout(WAIT, async {
        while let Some(event) = rx.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

async fn wait_authenticated(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    let event = wait_event(rx, |e| matches!(e, SessionEvent::Authenticated { .. })).await;
    assert!(event.is_some(), "session never authenticated");
}

fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ─────────────────────────────────────────────────────────
// Login
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_login_retries_until_accepted_and_authenticates_once() {
    let broker = MockBroker::start_with(BrokerBehavior {
        login_failures: 2,
        ..Default::default()
    })
    .await;
    let (session, mut rx) = new_session();

    assert!(session.connect(&broker.config()));
    wait_authenticated(&mut rx).await;

    assert_eq!(broker.count("login_req"), 3);
    assert_eq!(session.state(), SessionState::Authenticated);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let later = drain(&mut rx);
    assert!(!later
        .iter()
        .any(|e| matches!(e, SessionEvent::Authenticated { .. })));
}

#[tokio::test]
async fn test_login_payload_carries_credentials() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    let login = broker
        .received()
        .into_iter()
        .find(|r| r.envelope.is("login_req"))
        .unwrap();
    assert_eq!(login.envelope.field("appid"), Some(&json!("test-app")));
    assert_eq!(login.envelope.field("uid"), Some(&json!("test-user")));
    assert_eq!(login.envelope.field("token"), Some(&json!("test-token")));
}

#[tokio::test]
async fn test_unanswered_login_keeps_retrying() {
    let broker = MockBroker::start_with(BrokerBehavior {
        answer_login: false,
        ..Default::default()
    })
    .await;
    let (session, _rx) = new_session();

    session.connect(&broker.config());
    assert!(broker.wait_for_command("login_req", 2, WAIT).await);
    assert_eq!(session.state(), SessionState::OpenUnauthenticated);
    assert_eq!(broker.count("ping"), 0);
}

#[tokio::test]
async fn test_heartbeat_follows_login() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    assert!(broker.wait_for_command("ping", 2, WAIT).await);
    let received = broker.received();
    let first_ping = received.iter().position(|r| r.envelope.is("ping")).unwrap();
    let last_login = received
        .iter()
        .rposition(|r| r.envelope.is("login_req"))
        .unwrap();
    assert!(last_login < first_ping);
}

#[tokio::test]
async fn test_first_ping_goes_out_right_after_login() {
    let broker = MockBroker::start().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let timing = SessionTiming {
        heartbeat_interval: Duration::from_secs(60),
        ..fast_timing()
    };
    let session = Session::new(Partition::Sandbox, timing, tx);

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    assert!(broker.wait_for_command("ping", 1, WAIT).await);
    assert_eq!(broker.count("ping"), 1);
}

// ─────────────────────────────────────────────────────────
// Connect / disconnect
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_connect_with_unchanged_identity_is_noop() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    let mut same = broker.config();
    same.language = Some("zh-CN".to_string());
    same.open_api_url = Some("https://api.example.com".to_string());
    assert!(!session.connect(&same));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.connections(), 1);
    assert!(broker.client_close_codes().is_empty());
    assert_eq!(session.config().unwrap().language.as_deref(), Some("zh-CN"));
}

#[tokio::test]
async fn test_connect_with_new_identity_replaces_socket() {
    let old_broker = MockBroker::start().await;
    let new_broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&old_broker.config());
    wait_authenticated(&mut rx).await;

    let mut replacement = new_broker.config();
    replacement.user_token = "rotated-token".to_string();
    assert!(session.connect(&replacement));

    wait_authenticated(&mut rx).await;
    assert!(old_broker.wait_for_client_closes(1, WAIT).await);
    assert_eq!(old_broker.client_close_codes(), vec![Some(NORMAL_CLOSURE)]);

    let login = new_broker
        .received()
        .into_iter()
        .find(|r| r.envelope.is("login_req"))
        .unwrap();
    assert_eq!(login.envelope.field("token"), Some(&json!("rotated-token")));
    assert_eq!(old_broker.connections(), 1);
}

#[tokio::test]
async fn test_disconnect_is_idempotent() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    assert!(session.disconnect());
    assert!(!session.disconnect());
    assert!(!session.is_connected());
    assert_eq!(session.state(), SessionState::Disconnected);

    assert!(broker.wait_for_client_closes(1, WAIT).await);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.client_close_codes(), vec![Some(NORMAL_CLOSURE)]);
    assert_eq!(broker.connections(), 1);
}

#[tokio::test]
async fn test_disconnect_before_connect_is_noop() {
    let (session, mut rx) = new_session();
    assert!(!session.disconnect());
    assert!(drain(&mut rx).is_empty());
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;
    session.disconnect();

    assert!(session.connect(&broker.config()));
    wait_authenticated(&mut rx).await;
    assert_eq!(broker.connections(), 2);
}

// ─────────────────────────────────────────────────────────
// Socket loss
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_abnormal_close_schedules_reconnect() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    broker.close_latest(4000);
    let closed = wait_event(&mut rx, |e| {
        matches!(e, SessionEvent::StateChanged { state: SessionState::Closed, .. })
    })
    .await;
    assert!(closed.is_some());

    wait_authenticated(&mut rx).await;
    assert_eq!(broker.connections(), 2);
    assert!(session.is_connected());
    assert!(broker
        .received()
        .iter()
        .any(|r| r.connection == 2 && r.envelope.is("login_req")));
}

#[tokio::test]
async fn test_dropped_connection_schedules_reconnect() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    broker.drop_latest();
    wait_authenticated(&mut rx).await;
    assert_eq!(broker.connections(), 2);
}

#[tokio::test]
async fn test_normal_close_from_broker_does_not_reconnect() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    broker.close_latest(NORMAL_CLOSURE);
    let disconnected = wait_event(&mut rx, |e| {
        matches!(e, SessionEvent::StateChanged { state: SessionState::Disconnected, .. })
    })
    .await;
    assert!(disconnected.is_some());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(broker.connections(), 1);
    assert!(!session.is_connected());
}

async fn next_state(rx: &mut mpsc::UnboundedReceiver<SessionEvent>, wanted: SessionState) {
    while let Some(event) = rx.recv().await {
        if matches!(event, SessionEvent::StateChanged { state, .. } if state == wanted) {
            return;
        }
    }
    panic!("event channel closed before {wanted:?}");
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_waits_full_delay() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let timing = SessionTiming::default();
    let session = Session::new(Partition::Sandbox, timing, tx);
    let config = ConnectionConfig {
        app_id: "test-app".to_string(),
        user_id: "test-user".to_string(),
        user_token: "test-token".to_string(),
        production_url: "ws://127.0.0.1:1".to_string(),
        sandbox_url: "ws://127.0.0.1:1".to_string(),
        open_api_url: None,
        language: None,
    };

    session.connect(&config);
    next_state(&mut rx, SessionState::Closed).await;
    let lost_at = tokio::time::Instant::now();

    tokio::time::sleep(timing.reconnect_delay - Duration::from_millis(1)).await;
    tokio::task::yield_now().await;
    let early = drain(&mut rx);
    assert!(
        !early.iter().any(|e| matches!(
            e,
            SessionEvent::StateChanged { state: SessionState::Connecting, .. }
        )),
        "reconnected before the delay: {early:?}"
    );

    next_state(&mut rx, SessionState::Connecting).await;
    let waited = lost_at.elapsed();
    assert!(waited >= timing.reconnect_delay, "reconnected after {waited:?}");
    assert!(waited < timing.reconnect_delay + Duration::from_millis(50));
    assert!(session.is_connected());
}

#[tokio::test]
async fn test_unreachable_endpoint_keeps_retrying() {
    let broker = MockBroker::start().await;
    let mut config = broker.config();
    drop(broker);
    config.sandbox_url = "ws://127.0.0.1:1".to_string();

    let (session, mut rx) = new_session();
    session.connect(&config);

    for _ in 0..2 {
        let closed = wait_event(&mut rx, |e| {
            matches!(e, SessionEvent::StateChanged { state: SessionState::Closed, .. })
        })
        .await;
        assert!(closed.is_some());
    }
    assert!(session.is_connected());
    assert!(!session.is_open());
}

// ─────────────────────────────────────────────────────────
// Sending and routing
// ─────────────────────────────────────────────────────────

#[tokio::test]
async fn test_send_refused_when_not_open() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    assert!(!session.send(&Envelope::read("d1")));

    session.connect(&broker.config());
    assert!(!session.send(&Envelope::read("d1")));

    wait_authenticated(&mut rx).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(broker.count("c2s_read"), 0);
}

#[tokio::test]
async fn test_pushes_reach_events_and_bus() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    let pending = session.responses().expect("s2c_online_status");
    broker.push(&online_status("d1", true));

    let event = wait_event(&mut rx, |e| matches!(e, SessionEvent::ConnectionState { .. }))
        .await
        .unwrap();
    match event {
        SessionEvent::ConnectionState { partition, status } => {
            assert_eq!(partition, Partition::Sandbox);
            assert_eq!(status.device_id, "d1");
            assert!(status.online);
        }
        other => panic!("unexpected event {other:?}"),
    }
    assert!(pending.wait(WAIT).await.is_some());

    broker.push(&device_state("d1", json!({ "power": false })));
    let event = wait_event(&mut rx, |e| matches!(e, SessionEvent::DeviceState { .. }))
        .await
        .unwrap();
    if let SessionEvent::DeviceState { notification, .. } = event {
        assert_eq!(notification.attrs.get("power"), Some(&json!(false)));
    }
}

#[tokio::test]
async fn test_malformed_frame_is_dropped() {
    let broker = MockBroker::start().await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    broker.push_raw("{not json");
    broker.push(&online_status("d2", false));

    let event = wait_event(&mut rx, |e| matches!(e, SessionEvent::ConnectionState { .. })).await;
    assert!(event.is_some());
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(broker.connections(), 1);
}

#[tokio::test]
async fn test_request_returns_correlated_notification() {
    let mut attrs = serde_json::Map::new();
    attrs.insert("power".to_string(), json!(true));
    let broker = MockBroker::start_with(BrokerBehavior {
        read_attrs: attrs,
        ..Default::default()
    })
    .await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    let reply = session
        .request(&Envelope::read("d1"), cmd::READ_RESPONSE, Duration::from_millis(1500))
        .await
        .unwrap();
    assert_eq!(reply.field("did"), Some(&json!("d1")));
    assert_eq!(reply.field("attrs"), Some(&json!({ "power": true })));
}

#[tokio::test]
async fn test_request_times_out_without_reply() {
    let broker = MockBroker::start_with(BrokerBehavior {
        answer_reads: false,
        ..Default::default()
    })
    .await;
    let (session, mut rx) = new_session();

    session.connect(&broker.config());
    wait_authenticated(&mut rx).await;

    let reply = session
        .request(&Envelope::read("d1"), cmd::READ_RESPONSE, Duration::from_millis(200))
        .await;
    assert!(reply.is_none());
    assert_eq!(broker.count("c2s_read"), 1);
}

#[tokio::test]
async fn test_request_refused_when_disconnected() {
    let (session, _rx) = new_session();
    let reply = session
        .request(&Envelope::read("d1"), cmd::READ_RESPONSE, Duration::from_millis(200))
        .await;
    assert!(reply.is_none());
}
