//! Headless mode - NDJSON event output
//!
//! The `wlink` binary has no UI: it reports what the widget service sees as
//! newline-delimited JSON on stdout, one event per line. Each event has an
//! "event" field naming its type.
//!
//! # Example Output
//!
//! ```json
//! {"event":"session_state","partition":"production","state":"connecting","timestamp":1704700001000}
//! {"event":"authenticated","partition":"production","timestamp":1704700001200}
//! {"event":"device_online","group":"control","device_id":"lamp-1","online":true,"timestamp":1704700002000}
//! ```

pub mod runner;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use std::io::{self, Write};
use tracing::error;

use wlink_app::{ControlOutcome, DeviceEvent, GroupKind, SceneOutcome};
use wlink_session::SessionEvent;

/// Events emitted in headless mode
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// A broker session moved to a new lifecycle state
    SessionState {
        partition: String,
        state: String,
        timestamp: i64,
    },

    /// A broker session accepted the login
    Authenticated { partition: String, timestamp: i64 },

    DeviceOnline {
        group: GroupKind,
        device_id: String,
        online: bool,
        timestamp: i64,
    },

    DeviceAttributes {
        group: GroupKind,
        device_id: String,
        attributes: Map<String, Value>,
        timestamp: i64,
    },

    DeviceInfo {
        group: GroupKind,
        device_id: String,
        name: Option<String>,
        timestamp: i64,
    },

    /// Result of a `tap` command
    ControlResult {
        device_id: String,
        attr_key: String,
        result: ControlOutcome,
        timestamp: i64,
    },

    /// Result of a `scene` command
    SceneResult {
        home_id: i64,
        scene_id: i64,
        result: SceneOutcome,
        timestamp: i64,
    },

    /// Error occurred
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize headless event: {}", e);
                return;
            }
        };

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write headless event to stdout: {}", e);
            return;
        }

        if let Err(e) = stdout.flush() {
            error!("Failed to flush headless stdout: {}", e);
        }
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Conversions
    // ─────────────────────────────────────────────────────────

    /// Lifecycle events only. Pushes reach the output through the groups.
    pub fn from_session_event(event: &SessionEvent) -> Option<Self> {
        match event {
            SessionEvent::StateChanged { partition, state } => Some(Self::SessionState {
                partition: partition.to_string(),
                state: state.as_str().to_string(),
                timestamp: Self::now(),
            }),
            SessionEvent::Authenticated { partition } => Some(Self::Authenticated {
                partition: partition.to_string(),
                timestamp: Self::now(),
            }),
            SessionEvent::ConnectionState { .. } | SessionEvent::DeviceState { .. } => None,
        }
    }

    pub fn from_device_event(group: GroupKind, event: &DeviceEvent) -> Self {
        match event {
            DeviceEvent::ConnectionChanged { device_id, online } => Self::DeviceOnline {
                group,
                device_id: device_id.clone(),
                online: *online,
                timestamp: Self::now(),
            },
            DeviceEvent::AttributesChanged {
                device_id,
                attributes,
            } => Self::DeviceAttributes {
                group,
                device_id: device_id.clone(),
                attributes: attributes.clone(),
                timestamp: Self::now(),
            },
            DeviceEvent::InfoChanged { device_id, name } => Self::DeviceInfo {
                group,
                device_id: device_id.clone(),
                name: name.clone(),
                timestamp: Self::now(),
            },
        }
    }

    pub fn control_result(device_id: &str, attr_key: &str, result: ControlOutcome) -> Self {
        Self::ControlResult {
            device_id: device_id.to_string(),
            attr_key: attr_key.to_string(),
            result,
            timestamp: Self::now(),
        }
    }

    pub fn scene_result(home_id: i64, scene_id: i64, result: SceneOutcome) -> Self {
        Self::SceneResult {
            home_id,
            scene_id,
            result,
            timestamp: Self::now(),
        }
    }

    pub fn error(message: String, fatal: bool) -> Self {
        Self::Error {
            message,
            fatal,
            timestamp: Self::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wlink_core::Partition;
    use wlink_session::{OnlineStatus, SessionState};

    use super::*;

    fn to_value(event: &HeadlessEvent) -> Value {
        let json = serde_json::to_string(event).expect("serialization failed");
        serde_json::from_str(&json).expect("invalid JSON")
    }

    #[test]
    fn test_session_state_serialization() {
        let event = HeadlessEvent::from_session_event(&SessionEvent::StateChanged {
            partition: Partition::Sandbox,
            state: SessionState::OpenUnauthenticated,
        })
        .unwrap();
        let value = to_value(&event);

        assert_eq!(value["event"], "session_state");
        assert_eq!(value["partition"], "sandbox");
        assert_eq!(value["state"], "open_unauthenticated");
        assert!(value["timestamp"].is_i64());
    }

    #[test]
    fn test_pushes_are_not_session_output() {
        let event = SessionEvent::ConnectionState {
            partition: Partition::Production,
            status: OnlineStatus {
                device_id: "a".to_string(),
                online: true,
            },
        };
        assert!(HeadlessEvent::from_session_event(&event).is_none());
    }

    #[test]
    fn test_device_attributes_serialization() {
        let mut attributes = Map::new();
        attributes.insert("power".to_string(), json!(true));
        let event = HeadlessEvent::from_device_event(
            GroupKind::State,
            &DeviceEvent::AttributesChanged {
                device_id: "lamp".to_string(),
                attributes,
            },
        );
        let value = to_value(&event);

        assert_eq!(value["event"], "device_attributes");
        assert_eq!(value["group"], "state");
        assert_eq!(value["attributes"]["power"], true);
    }

    #[test]
    fn test_control_result_nests_outcome() {
        let event = HeadlessEvent::control_result(
            "lamp",
            "power",
            ControlOutcome::Sent { value: json!(false) },
        );
        let value = to_value(&event);

        assert_eq!(value["event"], "control_result");
        assert_eq!(value["result"]["outcome"], "sent");
        assert_eq!(value["result"]["value"], false);
    }

    #[test]
    fn test_scene_failure_carries_reason() {
        let event = HeadlessEvent::scene_result(
            1,
            2,
            SceneOutcome::Failed {
                reason: "error code 5".to_string(),
            },
        );
        let value = to_value(&event);

        assert_eq!(value["result"]["outcome"], "failed");
        assert_eq!(value["result"]["reason"], "error code 5");
    }

    #[test]
    fn test_error_serialization() {
        let value = to_value(&HeadlessEvent::error("bad config".to_string(), true));
        assert_eq!(value["event"], "error");
        assert_eq!(value["fatal"], true);
    }
}
