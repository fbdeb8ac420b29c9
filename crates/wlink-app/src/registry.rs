//! Device registry and push dispatcher.
//!
//! Each widget group registers the device ids it shows. Inbound pushes are
//! fanned out to every group tracking the device, at most one event per
//! group per push. A device's partition is learned from the bound-device
//! directory and gates which session's pushes it accepts.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;

use wlink_core::prelude::*;
use wlink_core::Partition;

use crate::cloud::BoundDevice;

/// Widget group kinds that subscribe to device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupKind {
    Control,
    State,
}

impl GroupKind {
    pub const ALL: [GroupKind; 2] = [GroupKind::Control, GroupKind::State];
}

/// What the registry knows about one device in one group.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEntry {
    pub device_id: String,
    /// `None` until the directory reports it.
    pub partition: Option<Partition>,
    pub online: bool,
    pub attributes: Map<String, Value>,
    pub name: Option<String>,
}

impl DeviceEntry {
    fn new(device_id: String) -> Self {
        Self {
            device_id,
            partition: None,
            online: false,
            attributes: Map::new(),
            name: None,
        }
    }
}

/// Event delivered to a group subscriber.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    ConnectionChanged {
        device_id: String,
        online: bool,
    },
    /// Raw attributes from the push; the subscriber picks its keys.
    AttributesChanged {
        device_id: String,
        attributes: Map<String, Value>,
    },
    InfoChanged {
        device_id: String,
        name: Option<String>,
    },
}

#[derive(Debug, Default)]
struct Group {
    entries: Vec<DeviceEntry>,
    subscriber: Option<mpsc::UnboundedSender<DeviceEvent>>,
}

impl Group {
    fn notify(&self, event: DeviceEvent) {
        if let Some(subscriber) = &self.subscriber {
            let _ = subscriber.send(event);
        }
    }
}

#[derive(Debug, Clone)]
struct KnownDevice {
    partition: Partition,
    online: bool,
    name: Option<String>,
}

#[derive(Debug, Default)]
struct RegistryState {
    groups: HashMap<GroupKind, Group>,
    /// Last directory snapshot, used to seed re-registered groups.
    known: HashMap<String, KnownDevice>,
}

/// Authoritative per-group device lists.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    state: Mutex<RegistryState>,
}

/// An entry accepts a push from `source` unless its partition is known and
/// differs.
fn accepts(entry: &DeviceEntry, source: Option<Partition>) -> bool {
    match (entry.partition, source) {
        (Some(partition), Some(source)) => partition == source,
        _ => true,
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replace `kind`'s device list and subscriber.
    ///
    /// The previous subscriber's receiver closes. Entries for devices the
    /// directory already reported start with that partition, online flag and
    /// name.
    pub fn register_group(
        &self,
        kind: GroupKind,
        device_ids: impl IntoIterator<Item = String>,
    ) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.lock();

        let entries: Vec<DeviceEntry> = device_ids
            .into_iter()
            .map(|device_id| {
                let mut entry = DeviceEntry::new(device_id);
                if let Some(known) = state.known.get(&entry.device_id) {
                    entry.partition = Some(known.partition);
                    entry.online = known.online;
                    entry.name = known.name.clone();
                }
                entry
            })
            .collect();

        debug!("registered {:?} group with {} device(s)", kind, entries.len());
        state.groups.insert(
            kind,
            Group {
                entries,
                subscriber: Some(tx),
            },
        );
        rx
    }

    /// Apply an online/offline push received on `source`'s session.
    ///
    /// Returns `true` if any group tracks the device.
    pub fn apply_connection_state(
        &self,
        source: Option<Partition>,
        device_id: &str,
        online: bool,
    ) -> bool {
        let mut state = self.lock();
        let mut tracked = false;

        for group in state.groups.values_mut() {
            let mut matched = false;
            for entry in group
                .entries
                .iter_mut()
                .filter(|e| e.device_id == device_id && accepts(e, source))
            {
                entry.online = online;
                matched = true;
            }
            if matched {
                tracked = true;
                group.notify(DeviceEvent::ConnectionChanged {
                    device_id: device_id.to_string(),
                    online,
                });
            }
        }

        if let Some(known) = state.known.get_mut(device_id) {
            known.online = online;
        }
        if !tracked {
            trace!("online status for untracked device {}", device_id);
        }
        tracked
    }

    /// Apply an attribute push received on `source`'s session. Attributes are
    /// merged into the entry; subscribers get the raw push.
    pub fn apply_attributes(
        &self,
        source: Option<Partition>,
        device_id: &str,
        attributes: &Map<String, Value>,
    ) -> bool {
        let mut state = self.lock();
        let mut tracked = false;

        for group in state.groups.values_mut() {
            let mut matched = false;
            for entry in group
                .entries
                .iter_mut()
                .filter(|e| e.device_id == device_id && accepts(e, source))
            {
                for (key, value) in attributes {
                    entry.attributes.insert(key.clone(), value.clone());
                }
                matched = true;
            }
            if matched {
                tracked = true;
                group.notify(DeviceEvent::AttributesChanged {
                    device_id: device_id.to_string(),
                    attributes: attributes.clone(),
                });
            }
        }

        if !tracked {
            trace!("attributes for untracked device {}", device_id);
        }
        tracked
    }

    /// Record a locally written attribute value, as if the device had
    /// reported it.
    pub fn set_attribute(&self, device_id: &str, key: &str, value: Value) -> bool {
        let mut attributes = Map::new();
        attributes.insert(key.to_string(), value);
        self.apply_attributes(None, device_id, &attributes)
    }

    /// Learn partition, online flag and product name from a directory fetch.
    pub fn apply_directory(&self, devices: &[BoundDevice]) {
        let mut state = self.lock();

        for device in devices {
            let partition = device.partition();
            state.known.insert(
                device.did.clone(),
                KnownDevice {
                    partition,
                    online: device.is_online,
                    name: device.product_name.clone(),
                },
            );

            for group in state.groups.values_mut() {
                let mut matched = false;
                for entry in group.entries.iter_mut().filter(|e| e.device_id == device.did) {
                    entry.partition = Some(partition);
                    entry.online = device.is_online;
                    entry.name = device.product_name.clone();
                    matched = true;
                }
                if matched {
                    group.notify(DeviceEvent::ConnectionChanged {
                        device_id: device.did.clone(),
                        online: device.is_online,
                    });
                    group.notify(DeviceEvent::InfoChanged {
                        device_id: device.did.clone(),
                        name: device.product_name.clone(),
                    });
                }
            }
        }
        debug!("directory applied: {} bound device(s)", devices.len());
    }

    /// Online tracked devices whose partition is `partition`, without
    /// duplicates. Offline devices and devices with an unknown partition are
    /// left out.
    pub fn devices_in(&self, partition: Partition) -> Vec<String> {
        let state = self.lock();
        let mut ids: Vec<String> = Vec::new();
        for kind in GroupKind::ALL {
            let Some(group) = state.groups.get(&kind) else {
                continue;
            };
            for entry in &group.entries {
                if entry.partition == Some(partition)
                    && entry.online
                    && !ids.contains(&entry.device_id)
                {
                    ids.push(entry.device_id.clone());
                }
            }
        }
        ids
    }

    pub fn partition_of(&self, device_id: &str) -> Option<Partition> {
        let state = self.lock();
        if let Some(known) = state.known.get(device_id) {
            return Some(known.partition);
        }
        state
            .groups
            .values()
            .flat_map(|g| g.entries.iter())
            .find(|e| e.device_id == device_id)
            .and_then(|e| e.partition)
    }

    pub fn is_online(&self, device_id: &str) -> bool {
        self.lock()
            .groups
            .values()
            .flat_map(|g| g.entries.iter())
            .any(|e| e.device_id == device_id && e.online)
    }

    /// Last known value of `key` on `device_id`.
    pub fn attribute(&self, device_id: &str, key: &str) -> Option<Value> {
        self.lock()
            .groups
            .values()
            .flat_map(|g| g.entries.iter())
            .filter(|e| e.device_id == device_id)
            .find_map(|e| e.attributes.get(key).cloned())
    }

    pub fn snapshot(&self, kind: GroupKind) -> Vec<DeviceEntry> {
        self.lock()
            .groups
            .get(&kind)
            .map(|g| g.entries.clone())
            .unwrap_or_default()
    }
}
