//! Widget service: the object widget hosts talk to.
//!
//! Owns the session pair, the device registry, the bulk refresher and the
//! cloud collaborator, and wires them together:
//!
//! - session pushes are applied to the registry, filtered by the partition of
//!   the session they arrived on
//! - a session login triggers a bulk refresh of that partition
//! - registering a group syncs the bound-device directory, which learns
//!   device partitions and then refreshes the authenticated partitions
//!
//! Control and scene executions are keyed and superseded: a new execution
//! for the same key cancels and joins the previous one first.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Map;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use wlink_core::prelude::*;
use wlink_core::{ConnectionConfig, Partition};
use wlink_session::{SessionEvent, SessionPair, SessionState, SessionTiming};

use crate::cloud::{BoundDeviceList, CloudApi};
use crate::control::{next_value, ControlOutcome, ControlSpec, SceneOutcome};
use crate::refresh::{BulkRefresher, RefreshTiming};
use crate::registry::{DeviceEvent, DeviceRegistry, GroupKind};
use crate::supersede::TaskSlots;


/// Every delay the service and the layers below it use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceTiming {
    pub session: SessionTiming,
    pub refresh: RefreshTiming,
    /// Pause between failed directory fetches.
    pub directory_retry: Duration,
    /// How long a control key stays busy after a write.
    pub control_settle: Duration,
    /// How long a scene key stays busy after execution.
    pub scene_settle: Duration,
}

impl Default for ServiceTiming {
    fn default() -> Self {
        Self {
            session: SessionTiming::default(),
            refresh: RefreshTiming::default(),
            directory_retry: Duration::from_millis(2000),
            control_settle: Duration::from_millis(2000),
            scene_settle: Duration::from_millis(2000),
        }
    }
}

type ControlKey = (String, String);
type SceneKey = (i64, i64);

pub struct WidgetService<A> {
    inner: Arc<ServiceInner<A>>,
    dispatch_task: JoinHandle<()>,
}

struct ServiceInner<A> {
    pair: Arc<SessionPair>,
    registry: Arc<DeviceRegistry>,
    cloud: Arc<A>,
    refresher: BulkRefresher,
    timing: ServiceTiming,
    directory: TaskSlots<()>,
    controls: TaskSlots<ControlKey>,
    scenes: TaskSlots<SceneKey>,
    session_subscriber: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
}

impl<A> WidgetService<A>
where
    A: CloudApi + Sync + 'static,
{
    /// Build the service and start its dispatch task. Must be called inside
    /// a tokio runtime.
    pub fn new(cloud: A, timing: ServiceTiming) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(DeviceRegistry::new());
        let inner = Arc::new(ServiceInner {
            pair: Arc::new(SessionPair::new(timing.session, events_tx)),
            refresher: BulkRefresher::new(Arc::clone(&registry), timing.refresh),
            registry,
            cloud: Arc::new(cloud),
            timing,
            directory: TaskSlots::new(),
            controls: TaskSlots::new(),
            scenes: TaskSlots::new(),
            session_subscriber: Mutex::new(None),
        });
        let dispatch_task = tokio::spawn(run_dispatch(Arc::clone(&inner), events_rx));
        Self {
            inner,
            dispatch_task,
        }
    }

    pub fn pair(&self) -> &Arc<SessionPair> {
        &self.inner.pair
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.inner.registry
    }

    pub fn timing(&self) -> ServiceTiming {
        self.inner.timing
    }

    /// Receive every session event (lifecycle and pushes) from now on.
    /// Replaces any earlier subscriber.
    pub fn subscribe_sessions(&self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .session_subscriber
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(tx);
        rx
    }

    // ─────────────────────────────────────────────────────────
    // Connection lifecycle
    // ─────────────────────────────────────────────────────────

    /// Register a client of the connection. See [`SessionPair::attach`].
    pub fn attach(&self, config: &ConnectionConfig) -> usize {
        self.inner.pair.attach(config)
    }

    /// Release a client. The last one out disconnects and stops background
    /// refresh and directory work.
    pub async fn detach(&self) -> usize {
        let remaining = self.inner.pair.detach();
        if remaining == 0 {
            self.stop_background().await;
        }
        remaining
    }

    pub fn connect(&self, config: &ConnectionConfig) {
        self.inner.pair.connect(config);
    }

    pub async fn disconnect(&self) {
        self.inner.pair.disconnect();
        self.stop_background().await;
    }

    async fn stop_background(&self) {
        self.inner.directory.cancel_all().await;
        self.inner.refresher.cancel_all().await;
    }

    // ─────────────────────────────────────────────────────────
    // Groups and directory
    // ─────────────────────────────────────────────────────────

    /// Replace `kind`'s device list, then sync the directory and refresh.
    pub async fn register_group(
        &self,
        kind: GroupKind,
        device_ids: Vec<String>,
    ) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let rx = self.inner.registry.register_group(kind, device_ids);
        self.sync_devices().await;
        rx
    }

    /// Fetch the bound-device directory (retrying until it succeeds), apply
    /// it, then refresh every authenticated partition. Supersedes a sync
    /// already in progress.
    pub async fn sync_devices(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .directory
            .supersede((), async move { inner.sync_directory().await })
            .await;
    }

    /// Wait for the running directory sync to finish.
    pub async fn wait_for_sync(&self) {
        self.inner.directory.join(&()).await;
    }

    /// Re-read every device of `partition`, superseding a running refresh.
    pub async fn refresh(&self, partition: Partition) {
        self.inner.refresh(partition).await;
    }

    // ─────────────────────────────────────────────────────────
    // Controls and scenes
    // ─────────────────────────────────────────────────────────

    /// Apply one tap of `spec` to `device_id`.
    ///
    /// Cancels and joins a running execution of the same control first.
    /// The key stays busy for the settle window after a successful write.
    pub async fn execute_control(&self, device_id: &str, spec: &ControlSpec) -> ControlOutcome {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let key = (device_id.to_string(), spec.control_id.clone());
        let device_id = device_id.to_string();
        let spec = spec.clone();

        self.inner
            .controls
            .supersede(key, async move {
                let outcome = inner.write_control(&device_id, &spec);
                let settle = matches!(outcome, ControlOutcome::Sent { .. });
                let _ = tx.send(outcome);
                if settle {
                    tokio::time::sleep(inner.timing.control_settle).await;
                }
            })
            .await;

        rx.await.unwrap_or(ControlOutcome::Superseded)
    }

    /// Run a cloud scene. Cancels and joins a running execution of the same
    /// scene first.
    pub async fn execute_scene(&self, home_id: i64, scene_id: i64) -> SceneOutcome {
        let (tx, rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);

        self.inner
            .scenes
            .supersede((home_id, scene_id), async move {
                let outcome = match inner.cloud.execute_scene(home_id, scene_id).await {
                    Ok(status) if status.is_success() => SceneOutcome::Succeeded,
                    Ok(status) => SceneOutcome::Failed {
                        reason: format!("error code {}", status.error_code),
                    },
                    Err(err) => SceneOutcome::Failed {
                        reason: err.to_string(),
                    },
                };
                info!("scene {} in home {}: {:?}", scene_id, home_id, outcome);
                let _ = tx.send(outcome);
                tokio::time::sleep(inner.timing.scene_settle).await;
            })
            .await;

        rx.await.unwrap_or(SceneOutcome::Superseded)
    }
}

impl<A> Drop for WidgetService<A> {
    fn drop(&mut self) {
        self.dispatch_task.abort();
    }
}

impl<A> ServiceInner<A>
where
    A: CloudApi + Sync + 'static,
{
    fn forward(&self, event: &SessionEvent) {
        let subscriber = self
            .session_subscriber
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = subscriber.as_ref() {
            let _ = tx.send(event.clone());
        }
    }

    async fn refresh(&self, partition: Partition) {
        self.refresher
            .refresh(Arc::clone(self.pair.session(partition)))
            .await;
    }

    async fn sync_directory(&self) {
        let mut attempt: u32 = 1;
        let devices = loop {
            match self
                .cloud
                .fetch_bound_devices()
                .await
                .and_then(BoundDeviceList::into_result)
            {
                Ok(devices) => break devices,
                Err(err) => warn!("device directory fetch failed (attempt {}): {}", attempt, err),
            }
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(self.timing.directory_retry).await;
        };

        self.registry.apply_directory(&devices);

        for partition in Partition::ALL {
            if self.pair.session(partition).state() == SessionState::Authenticated {
                self.refresh(partition).await;
            }
        }
    }

    fn write_control(&self, device_id: &str, spec: &ControlSpec) -> ControlOutcome {
        let Some(partition) = self.registry.partition_of(device_id) else {
            debug!("control {} on {}: partition unknown", spec.control_id, device_id);
            return ControlOutcome::Offline;
        };
        if !self.registry.is_online(device_id) {
            debug!("control {} on {}: device offline", spec.control_id, device_id);
            return ControlOutcome::Offline;
        }

        let current = self.registry.attribute(device_id, &spec.attr_key);
        let Some(value) = next_value(&spec.kind, current.as_ref()) else {
            return ControlOutcome::NotDelivered;
        };

        let mut attrs = Map::new();
        attrs.insert(spec.attr_key.clone(), value.clone());
        if !self.pair.write_attributes(partition, device_id, attrs) {
            return ControlOutcome::NotDelivered;
        }

        self.registry
            .set_attribute(device_id, &spec.attr_key, value.clone());
        ControlOutcome::Sent { value }
    }
}

/// Route session events into the registry and refresher.
async fn run_dispatch<A>(inner: Arc<ServiceInner<A>>, mut events: mpsc::UnboundedReceiver<SessionEvent>)
where
    A: CloudApi + Sync + 'static,
{
    while let Some(event) = events.recv().await {
        inner.forward(&event);
        match event {
            SessionEvent::ConnectionState { partition, status } => {
                inner.registry.apply_connection_state(
                    Some(partition),
                    &status.device_id,
                    status.online,
                );
            }
            SessionEvent::DeviceState {
                partition,
                notification,
            } => {
                inner.registry.apply_attributes(
                    Some(partition),
                    &notification.device_id,
                    &notification.attrs,
                );
            }
            SessionEvent::Authenticated { partition } => inner.refresh(partition).await,
            SessionEvent::StateChanged { .. } => {}
        }
    }
}
