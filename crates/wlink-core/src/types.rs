//! Domain types shared by the session and app layers

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Deployment stage of a device, selecting which broker session its
/// commands travel through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Partition {
    Sandbox,
    Production,
}

impl Partition {
    /// Both partitions, in the order sessions are brought up.
    pub const ALL: [Partition; 2] = [Partition::Sandbox, Partition::Production];

    /// Map the cloud API's `is_sandbox` flag onto a partition.
    pub fn from_sandbox_flag(is_sandbox: bool) -> Self {
        if is_sandbox {
            Partition::Sandbox
        } else {
            Partition::Production
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Partition::Sandbox => "sandbox",
            Partition::Production => "production",
        }
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Credentials and broker endpoints for one signed-in user.
///
/// Immutable per connection attempt. Sessions compare configs with
/// [`ConnectionConfig::same_identity`]; only the identity fields for their
/// own partition decide whether a reconnect is needed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub app_id: String,
    pub user_id: String,
    pub user_token: String,
    pub production_url: String,
    pub sandbox_url: String,
    /// Base URL of the cloud REST API. Not part of the session identity.
    #[serde(default)]
    pub open_api_url: Option<String>,
    /// Preferred language key for device labels. Not part of the session identity.
    #[serde(default)]
    pub language: Option<String>,
}

impl ConnectionConfig {
    /// Broker endpoint for `partition`.
    pub fn endpoint(&self, partition: Partition) -> &str {
        match partition {
            Partition::Sandbox => &self.sandbox_url,
            Partition::Production => &self.production_url,
        }
    }

    /// True when a session for `partition` would connect to the same broker
    /// with the same credentials under both configs.
    pub fn same_identity(&self, other: &ConnectionConfig, partition: Partition) -> bool {
        self.app_id == other.app_id
            && self.user_id == other.user_id
            && self.user_token == other.user_token
            && self.endpoint(partition) == other.endpoint(partition)
    }

    /// Check that the credentials are present and both endpoints are
    /// WebSocket URLs.
    pub fn validate(&self) -> Result<()> {
        if self.app_id.trim().is_empty() {
            return Err(Error::config_invalid("app_id must not be empty"));
        }
        if self.user_id.trim().is_empty() {
            return Err(Error::config_invalid("user_id must not be empty"));
        }
        if self.user_token.trim().is_empty() {
            return Err(Error::config_invalid("user_token must not be empty"));
        }
        for partition in Partition::ALL {
            let raw = self.endpoint(partition);
            let parsed = url::Url::parse(raw).map_err(|e| {
                Error::config_invalid(format!("{partition} endpoint '{raw}' is not a URL: {e}"))
            })?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(Error::config_invalid(format!(
                    "{partition} endpoint '{raw}' must use ws:// or wss://"
                )));
            }
        }
        Ok(())
    }
}
