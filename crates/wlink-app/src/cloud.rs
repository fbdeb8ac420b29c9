//! Cloud REST collaborator seam.
//!
//! The bound-device directory and scene execution live behind the vendor's
//! REST API. This crate only needs their results, so both calls sit behind
//! [`CloudApi`]; the binary plugs in [`StaticCloud`], tests plug in fakes.

use serde::{Deserialize, Serialize};

use wlink_core::prelude::*;
use wlink_core::Partition;

/// One device bound to the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundDevice {
    pub did: String,
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub is_sandbox: bool,
}

impl BoundDevice {
    pub fn partition(&self) -> Partition {
        Partition::from_sandbox_flag(self.is_sandbox)
    }
}

/// Bound-device list response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundDeviceList {
    #[serde(default)]
    pub devices: Vec<BoundDevice>,
    #[serde(default)]
    pub error_code: i64,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl BoundDeviceList {
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }

    /// Turn a non-zero `error_code` into [`Error::CloudStatus`].
    pub fn into_result(self) -> Result<Vec<BoundDevice>> {
        if self.is_success() {
            Ok(self.devices)
        } else {
            Err(Error::CloudStatus {
                code: self.error_code,
                message: self.error_message.unwrap_or_default(),
            })
        }
    }
}

/// Bare status response, used by scene execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiStatus {
    #[serde(default)]
    pub error_code: i64,
}

impl ApiStatus {
    pub fn is_success(&self) -> bool {
        self.error_code == 0
    }
}

#[trait_variant::make(CloudApi: Send)]
pub trait LocalCloudApi {
    /// Fetch the devices bound to the current user.
    async fn fetch_bound_devices(&self) -> Result<BoundDeviceList>;

    /// Run a cloud scene.
    async fn execute_scene(&self, home_id: i64, scene_id: i64) -> Result<ApiStatus>;
}

/// Cloud stand-in serving a fixed device list.
///
/// Scene execution needs the real REST API and always fails here.
#[derive(Debug, Clone, Default)]
pub struct StaticCloud {
    devices: Vec<BoundDevice>,
}

impl StaticCloud {
    pub fn new(devices: Vec<BoundDevice>) -> Self {
        Self { devices }
    }
}

impl CloudApi for StaticCloud {
    async fn fetch_bound_devices(&self) -> Result<BoundDeviceList> {
        Ok(BoundDeviceList {
            devices: self.devices.clone(),
            error_code: 0,
            error_message: None,
        })
    }

    async fn execute_scene(&self, home_id: i64, scene_id: i64) -> Result<ApiStatus> {
        Err(Error::cloud(format!(
            "scene {scene_id} in home {home_id}: no cloud API configured"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bound_device_list_parses_rest_payload() {
        let json = r#"{
            "devices": [
                {"did": "a", "product_name": "Lamp", "is_online": true, "is_sandbox": false},
                {"did": "b", "is_sandbox": true}
            ],
            "error_code": 0
        }"#;
        let list: BoundDeviceList = serde_json::from_str(json).unwrap();
        assert!(list.is_success());
        assert_eq!(list.devices[0].partition(), Partition::Production);
        assert_eq!(list.devices[1].partition(), Partition::Sandbox);
        assert_eq!(list.devices[1].product_name, None);
        assert!(!list.devices[1].is_online);
    }

    #[test]
    fn test_error_code_maps_to_cloud_status() {
        let list = BoundDeviceList {
            devices: Vec::new(),
            error_code: 9004,
            error_message: Some("token expired".to_string()),
        };
        match list.into_result() {
            Err(Error::CloudStatus { code, message }) => {
                assert_eq!(code, 9004);
                assert_eq!(message, "token expired");
            }
            other => panic!("expected CloudStatus, got {other:?}"),
        }
    }

    #[test]
    fn test_api_status_success_predicate() {
        assert!(ApiStatus { error_code: 0 }.is_success());
        assert!(!ApiStatus { error_code: 1 }.is_success());
        let parsed: ApiStatus = serde_json::from_str("{}").unwrap();
        assert!(parsed.is_success());
    }

    #[tokio::test]
    async fn test_static_cloud_serves_devices_and_refuses_scenes() {
        let cloud = StaticCloud::new(vec![BoundDevice {
            did: "a".to_string(),
            product_name: None,
            is_online: true,
            is_sandbox: false,
        }]);
        let list = CloudApi::fetch_bound_devices(&cloud).await.unwrap();
        assert_eq!(list.devices.len(), 1);
        assert!(CloudApi::execute_scene(&cloud, 1, 2).await.is_err());
    }
}
