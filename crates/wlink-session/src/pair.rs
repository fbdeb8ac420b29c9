//! Sandbox and production sessions driven as one unit.
//!
//! Devices live in one of two partitions, each with its own broker. The pair
//! owns one [`Session`] per partition, routes outbound commands by partition,
//! and reference-counts the clients that need the connection so the last one
//! to leave tears it down.

use std::sync::{Arc, Mutex};

use serde_json::{Map, Value};
use tokio::sync::mpsc;

use wlink_core::prelude::*;
use wlink_core::{ConnectionConfig, Partition};

use crate::protocol::Envelope;
use crate::session::{Session, SessionEvent, SessionTiming};

#[derive(Debug)]
pub struct SessionPair {
    sandbox: Arc<Session>,
    production: Arc<Session>,
    clients: Mutex<usize>,
}

impl SessionPair {
    /// Both sessions report to the same `events` channel; events carry their
    /// partition.
    pub fn new(timing: SessionTiming, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            sandbox: Arc::new(Session::new(Partition::Sandbox, timing, events.clone())),
            production: Arc::new(Session::new(Partition::Production, timing, events)),
            clients: Mutex::new(0),
        }
    }

    pub fn session(&self, partition: Partition) -> &Arc<Session> {
        match partition {
            Partition::Sandbox => &self.sandbox,
            Partition::Production => &self.production,
        }
    }

    pub fn sessions(&self) -> [&Arc<Session>; 2] {
        [&self.sandbox, &self.production]
    }

    /// Connect both sessions. Each decides independently whether `config`
    /// changes its identity.
    pub fn connect(&self, config: &ConnectionConfig) {
        for session in self.sessions() {
            session.connect(config);
        }
    }

    pub fn disconnect(&self) {
        for session in self.sessions() {
            session.disconnect();
        }
    }

    /// Register a client and (re)connect with `config`. Returns the client count.
    pub fn attach(&self, config: &ConnectionConfig) -> usize {
        let count = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            *clients += 1;
            *clients
        };
        debug!("session pair attach, {} client(s)", count);
        self.connect(config);
        count
    }

    /// Release a client. The last one out disconnects both sessions.
    /// Returns the remaining client count.
    pub fn detach(&self) -> usize {
        let remaining = {
            let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());
            if *clients == 0 {
                return 0;
            }
            *clients -= 1;
            *clients
        };
        debug!("session pair detach, {} client(s) left", remaining);
        if remaining == 0 {
            self.disconnect();
        }
        remaining
    }

    pub fn clients(&self) -> usize {
        *self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send through the session for `partition`.
    pub fn send_to(&self, partition: Partition, envelope: &Envelope) -> bool {
        self.session(partition).send(envelope)
    }

    /// Write `attrs` to `device_id` through its partition's session.
    pub fn write_attributes(
        &self,
        partition: Partition,
        device_id: &str,
        attrs: Map<String, Value>,
    ) -> bool {
        let sent = self.send_to(partition, &Envelope::write(device_id, attrs));
        if !sent {
            debug!("[{}] write to {} not sent", partition, device_id);
        }
        sent
    }
}
