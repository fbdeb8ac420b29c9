//! Configuration types for widget-link
//!
//! Defines:
//! - `Settings` - Everything loaded from `config.toml`
//! - `TimingSettings` - Millisecond overrides for every delay and timeout
//! - `GroupSettings` - Device ids tracked by each widget group

use std::time::Duration;

use serde::{Deserialize, Serialize};

use wlink_core::ConnectionConfig;
use wlink_session::SessionTiming;

use crate::cloud::BoundDevice;
use crate::refresh::RefreshTiming;
use crate::service::ServiceTiming;

/// Top-level settings file
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    /// Credentials and broker endpoints
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub timing: TimingSettings,

    #[serde(default)]
    pub groups: GroupSettings,

    /// Static bound-device directory, served in place of the cloud API
    #[serde(default)]
    pub devices: Vec<BoundDevice>,
}

/// Device ids per widget group
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct GroupSettings {
    #[serde(default)]
    pub control: Vec<String>,
    #[serde(default)]
    pub state: Vec<String>,
}

/// Optional overrides, all in milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimingSettings {
    #[serde(default)]
    pub login_timeout_ms: Option<u64>,
    #[serde(default)]
    pub login_retry_ms: Option<u64>,
    #[serde(default)]
    pub send_retry_ms: Option<u64>,
    #[serde(default)]
    pub heartbeat_ms: Option<u64>,
    #[serde(default)]
    pub reconnect_delay_ms: Option<u64>,
    #[serde(default)]
    pub read_timeout_ms: Option<u64>,
    #[serde(default)]
    pub read_retry_ms: Option<u64>,
    #[serde(default)]
    pub pacing_ms: Option<u64>,
    #[serde(default)]
    pub control_settle_ms: Option<u64>,
    #[serde(default)]
    pub directory_retry_ms: Option<u64>,
}

fn millis_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl TimingSettings {
    pub fn session_timing(&self) -> SessionTiming {
        let d = SessionTiming::default();
        SessionTiming {
            login_timeout: millis_or(self.login_timeout_ms, d.login_timeout),
            login_retry_delay: millis_or(self.login_retry_ms, d.login_retry_delay),
            send_retry_delay: millis_or(self.send_retry_ms, d.send_retry_delay),
            heartbeat_interval: millis_or(self.heartbeat_ms, d.heartbeat_interval),
            reconnect_delay: millis_or(self.reconnect_delay_ms, d.reconnect_delay),
        }
    }

    pub fn refresh_timing(&self) -> RefreshTiming {
        let d = RefreshTiming::default();
        RefreshTiming {
            read_timeout: millis_or(self.read_timeout_ms, d.read_timeout),
            retry_delay: millis_or(self.read_retry_ms, d.retry_delay),
            pacing: millis_or(self.pacing_ms, d.pacing),
        }
    }

    pub fn service_timing(&self) -> ServiceTiming {
        let d = ServiceTiming::default();
        ServiceTiming {
            session: self.session_timing(),
            refresh: self.refresh_timing(),
            directory_retry: millis_or(self.directory_retry_ms, d.directory_retry),
            control_settle: millis_or(self.control_settle_ms, d.control_settle),
            ..d
        }
    }
}
