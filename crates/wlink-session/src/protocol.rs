//! Wire types for the broker's JSON-over-WebSocket protocol.
//!
//! Every frame in either direction is an envelope `{"cmd": <string>, "data": <object>?}`.
//! Requests and server pushes share the same shape; the `cmd` value is the
//! only routing key. Device-state notifications (`s2c_noti`) double as the
//! response to both read and write requests, since the broker re-notifies on
//! every state change.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use wlink_core::prelude::*;
use wlink_core::ConnectionConfig;

/// WebSocket close code for a caller-initiated, intentional closure.
/// Any other code (or no code at all) makes the session reconnect.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Attribute payload encoding requested at login.
pub const LOGIN_P0_TYPE: &str = "attrs_v4";

/// Heartbeat interval (seconds) advertised to the broker at login.
pub const LOGIN_HEARTBEAT_INTERVAL: u32 = 150;

/// Command names understood by the broker.
pub mod cmd {
    pub const LOGIN_REQUEST: &str = "login_req";
    pub const LOGIN_RESPONSE: &str = "login_res";
    pub const HEARTBEAT: &str = "ping";
    pub const ONLINE_STATUS: &str = "s2c_online_status";
    pub const DEVICE_STATE: &str = "s2c_noti";
    pub const READ_REQUEST: &str = "c2s_read";
    pub const WRITE_REQUEST: &str = "c2s_write";
    /// Reads are answered with a regular state notification.
    pub const READ_RESPONSE: &str = DEVICE_STATE;
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing key. Defaults to `""` when the peer omits it.
    #[serde(rename = "cmd", default)]
    pub command: String,
    /// Command payload. Absent for bare commands such as `ping`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl Envelope {
    /// An envelope with no payload.
    pub fn bare(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            data: None,
        }
    }

    /// Login request carrying the credentials from `config`.
    pub fn login(config: &ConnectionConfig) -> Self {
        Self::from_object(
            cmd::LOGIN_REQUEST,
            json!({
                "appid": config.app_id,
                "uid": config.user_id,
                "token": config.user_token,
                "p0_type": LOGIN_P0_TYPE,
                "heartbeat_interval": LOGIN_HEARTBEAT_INTERVAL,
                "auto_subscribe": true,
            }),
        )
    }

    /// Keep-alive frame. The broker does not answer it.
    pub fn heartbeat() -> Self {
        Self::bare(cmd::HEARTBEAT)
    }

    /// Request the current attributes of `device_id`.
    pub fn read(device_id: &str) -> Self {
        Self::from_object(cmd::READ_REQUEST, json!({ "did": device_id }))
    }

    /// Write `attrs` to `device_id`.
    pub fn write(device_id: &str, attrs: Map<String, Value>) -> Self {
        Self::from_object(
            cmd::WRITE_REQUEST,
            json!({ "did": device_id, "attrs": Value::Object(attrs) }),
        )
    }

    fn from_object(command: &str, value: Value) -> Self {
        let data = match value {
            Value::Object(map) => Some(map),
            _ => None,
        };
        Self {
            command: command.to_string(),
            data,
        }
    }

    /// Serialize to the text frame sent over the socket.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a text frame. Malformed frames are an error for the caller to
    /// log and drop; they are never retried.
    pub fn decode(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// True if this envelope carries `command`.
    pub fn is(&self, command: &str) -> bool {
        self.command == command
    }

    /// Raw payload field.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.as_ref().and_then(|data| data.get(key))
    }

    /// Decode the payload into `T`, or `None` if it is absent or the wrong shape.
    pub fn payload<T: DeserializeOwned>(&self) -> Option<T> {
        let data = self.data.clone()?;
        serde_json::from_value(Value::Object(data)).ok()
    }
}

// ---------------------------------------------------------------------------
// Typed payloads
// ---------------------------------------------------------------------------

/// `login_res` payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LoginResponse {
    #[serde(default)]
    pub success: bool,
}

/// `s2c_online_status` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnlineStatus {
    #[serde(rename = "did")]
    pub device_id: String,
    pub online: bool,
}

/// `s2c_noti` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceNotification {
    #[serde(rename = "did")]
    pub device_id: String,
    pub attrs: Map<String, Value>,
}

/// An envelope sorted by what the session has to do with it.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerMessage {
    /// A device came online or went offline.
    OnlineStatus(OnlineStatus),
    /// A device reported (some of) its attributes.
    DeviceState(DeviceNotification),
    /// Anything else; only interesting to correlation waiters.
    Other,
}

/// Classify a decoded envelope.
///
/// Push commands with a payload that does not decode (missing `did`, wrong
/// types) are reported as [`BrokerMessage::Other`] so they only reach the
/// response bus.
pub fn classify(envelope: &Envelope) -> BrokerMessage {
    match envelope.command.as_str() {
        cmd::ONLINE_STATUS => envelope
            .payload::<OnlineStatus>()
            .map(BrokerMessage::OnlineStatus)
            .unwrap_or(BrokerMessage::Other),
        cmd::DEVICE_STATE => envelope
            .payload::<DeviceNotification>()
            .map(BrokerMessage::DeviceState)
            .unwrap_or(BrokerMessage::Other),
        _ => BrokerMessage::Other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            app_id: "app-1".to_string(),
            user_id: "user-1".to_string(),
            user_token: "token-1".to_string(),
            production_url: "ws://localhost:1".to_string(),
            sandbox_url: "ws://localhost:2".to_string(),
            open_api_url: None,
            language: None,
        }
    }

    #[test]
    fn test_write_envelope_survives_peer_decode() {
        let mut attrs = Map::new();
        attrs.insert("k".to_string(), Value::Bool(true));
        let text = Envelope::write("X", attrs).encode().unwrap();

        let decoded = Envelope::decode(&text).unwrap();
        assert_eq!(decoded.command, "c2s_write");
        assert_eq!(decoded.field("did"), Some(&json!("X")));
        assert_eq!(decoded.field("attrs"), Some(&json!({ "k": true })));
    }

    #[test]
    fn test_login_envelope_fields() {
        let env = Envelope::login(&config());
        let val: Value = serde_json::from_str(&env.encode().unwrap()).unwrap();

        assert_eq!(val["cmd"], "login_req");
        assert_eq!(val["data"]["appid"], "app-1");
        assert_eq!(val["data"]["uid"], "user-1");
        assert_eq!(val["data"]["token"], "token-1");
        assert_eq!(val["data"]["p0_type"], "attrs_v4");
        assert_eq!(val["data"]["heartbeat_interval"], 150);
        assert_eq!(val["data"]["auto_subscribe"], true);
    }

    #[test]
    fn test_heartbeat_has_no_data_key() {
        let val: Value = serde_json::from_str(&Envelope::heartbeat().encode().unwrap()).unwrap();
        assert_eq!(val["cmd"], "ping");
        assert!(!val.as_object().unwrap().contains_key("data"));
    }

    #[test]
    fn test_decode_missing_cmd_defaults_to_empty() {
        let env = Envelope::decode(r#"{"data":{"did":"a"}}"#).unwrap();
        assert_eq!(env.command, "");
        assert_eq!(classify(&env), BrokerMessage::Other);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Envelope::decode("not json").is_err());
        assert!(Envelope::decode(r#"{"cmd":"s2c_noti","data":[1,2]}"#).is_err());
    }

    #[test]
    fn test_decode_null_data_is_absent() {
        let env = Envelope::decode(r#"{"cmd":"login_res","data":null}"#).unwrap();
        assert!(env.data.is_none());
        assert!(env.payload::<LoginResponse>().is_none());
    }

    #[test]
    fn test_login_response_success_defaults_false() {
        let env = Envelope::decode(r#"{"cmd":"login_res","data":{}}"#).unwrap();
        let res: LoginResponse = env.payload().unwrap();
        assert!(!res.success);
    }

    #[test]
    fn test_classify_online_status() {
        let env = Envelope::decode(r#"{"cmd":"s2c_online_status","data":{"did":"d1","online":true}}"#)
            .unwrap();
        assert_eq!(
            classify(&env),
            BrokerMessage::OnlineStatus(OnlineStatus {
                device_id: "d1".to_string(),
                online: true,
            })
        );
    }

    #[test]
    fn test_classify_device_state_keeps_raw_attrs() {
        let env = Envelope::decode(
            r#"{"cmd":"s2c_noti","data":{"did":"d1","attrs":{"power":true,"mode":2}}}"#,
        )
        .unwrap();
        match classify(&env) {
            BrokerMessage::DeviceState(n) => {
                assert_eq!(n.device_id, "d1");
                assert_eq!(n.attrs.get("mode"), Some(&json!(2)));
            }
            other => panic!("expected DeviceState, got {other:?}"),
        }
    }

    #[test]
    fn test_classify_push_without_did_is_other() {
        let env = Envelope::decode(r#"{"cmd":"s2c_online_status","data":{"online":true}}"#).unwrap();
        assert_eq!(classify(&env), BrokerMessage::Other);
    }
}
