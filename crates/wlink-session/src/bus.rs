//! Response broadcast bus.
//!
//! Every decoded inbound envelope is published here. Call sites that need a
//! reply subscribe transiently and wait for the next envelope carrying a given
//! command, bounded by a timeout.
//!
//! ## Correlation is by command type only
//!
//! The broker protocol carries no request id. Two concurrent waiters for the
//! same command may each observe either reply, and a reply published while no
//! waiter is subscribed is lost. The bus keeps a single slot: a slow waiter
//! that falls behind skips to the latest envelope instead of blocking the
//! publisher.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::protocol::Envelope;

/// Slots held for a lagging subscriber. Older envelopes are overwritten.
const BUS_CAPACITY: usize = 1;

/// Single-slot multicast of inbound envelopes.
#[derive(Debug, Clone)]
pub struct ResponseBus {
    tx: broadcast::Sender<Envelope>,
}

impl Default for ResponseBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Publish without blocking. Having no subscribers is not an error.
    pub fn publish(&self, envelope: Envelope) {
        let _ = self.tx.send(envelope);
    }

    /// Register interest in the next envelope carrying `command`.
    ///
    /// Call this before sending the request so a fast reply cannot slip past.
    pub fn expect(&self, command: impl Into<String>) -> PendingResponse {
        PendingResponse {
            command: command.into(),
            rx: self.tx.subscribe(),
        }
    }
}

/// A registered wait for one envelope.
#[derive(Debug)]
pub struct PendingResponse {
    command: String,
    rx: broadcast::Receiver<Envelope>,
}

impl PendingResponse {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the first matching envelope, or `None` once `timeout` elapses.
    ///
    /// Non-matching envelopes are skipped. Lagging is tolerated: the receiver
    /// jumps to the newest slot and keeps looking.
    pub async fn wait(mut self, timeout: Duration) -> Option<Envelope> {
        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Err(_) => return None,
                Ok(Ok(envelope)) if envelope.is(&self.command) => return Some(envelope),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    tracing::trace!(
                        "response wait for {} lagged by {} envelope(s)",
                        self.command,
                        skipped
                    );
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, assert_ready};

    fn noti(did: &str) -> Envelope {
        Envelope::decode(&format!(
            r#"{{"cmd":"s2c_noti","data":{{"did":"{did}","attrs":{{}}}}}}"#
        ))
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_at_1499ms_is_accepted() {
        let bus = ResponseBus::new();
        let pending = bus.expect("s2c_noti");

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1499)).await;
            publisher.publish(noti("A"));
        });

        let got = pending.wait(Duration::from_millis(1500)).await;
        assert_eq!(got.unwrap().field("did").unwrap(), "A");
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_at_1501ms_times_out() {
        let bus = ResponseBus::new();
        let pending = bus.expect("s2c_noti");

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1501)).await;
            publisher.publish(noti("A"));
        });

        assert!(pending.wait(Duration::from_millis(1500)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_matching_envelopes_are_skipped() {
        let bus = ResponseBus::new();
        let pending = bus.expect("login_res");

        let publisher = bus.clone();
        tokio::spawn(async move {
            publisher.publish(noti("A"));
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(Envelope::decode(r#"{"cmd":"login_res","data":{"success":true}}"#).unwrap());
        });

        let got = pending.wait(Duration::from_millis(1500)).await.unwrap();
        assert!(got.is("login_res"));
    }

    #[tokio::test]
    async fn test_publish_without_waiters_is_silent() {
        let bus = ResponseBus::new();
        bus.publish(noti("A"));

        let pending = bus.expect("s2c_noti");
        assert!(pending.wait(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_envelope_published_before_expect_is_not_seen() {
        let bus = ResponseBus::new();
        bus.publish(noti("A"));

        let mut wait = tokio_test::task::spawn(bus.expect("s2c_noti").wait(Duration::from_secs(60)));
        assert_pending!(wait.poll());

        bus.publish(noti("B"));
        let got = assert_ready!(wait.poll());
        assert_eq!(got.unwrap().field("did").unwrap(), "B");
    }

    #[tokio::test]
    async fn test_lagging_waiter_sees_latest_value() {
        let bus = ResponseBus::new();
        let pending = bus.expect("s2c_noti");

        bus.publish(noti("A"));
        bus.publish(noti("B"));
        bus.publish(noti("C"));

        let got = pending.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(got.field("did").unwrap(), "C");
    }

    #[tokio::test]
    async fn test_concurrent_waiters_both_see_same_reply() {
        let bus = ResponseBus::new();
        let first = bus.expect("s2c_noti");
        let second = bus.expect("s2c_noti");

        bus.publish(noti("A"));

        let a = first.wait(Duration::from_millis(100)).await.unwrap();
        let b = second.wait(Duration::from_millis(100)).await.unwrap();
        assert_eq!(a, b);
    }
}
