//! wlink-app - Device state and orchestration for widget-link
//!
//! This crate sits on top of the broker sessions: it tracks bound devices per
//! widget group, keeps their state fresh with paced bulk reads, and executes
//! controls and cloud scenes with per-key supersession.

pub mod cloud;
pub mod config;
pub mod control;
pub mod refresh;
pub mod registry;
pub mod service;
pub mod supersede;

// Re-export primary types
pub use cloud::{ApiStatus, BoundDevice, BoundDeviceList, CloudApi, LocalCloudApi, StaticCloud};
pub use config::Settings;
pub use control::{ControlKind, ControlOutcome, ControlSpec, SceneOutcome};
pub use refresh::{BulkRefresher, RefreshTiming};
pub use registry::{DeviceEntry, DeviceEvent, DeviceRegistry, GroupKind};
pub use service::{ServiceTiming, WidgetService};
pub use supersede::TaskSlots;
