//! Bulk state refresh after login.
//!
//! For one partition, every tracked device gets its own read-until-answered
//! loop. Loop launches are paced; once launched the loops run concurrently.
//! A new refresh for a partition cancels and joins the running one (all of
//! its per-device loops included) before issuing any new read.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};

use wlink_core::prelude::*;
use wlink_core::Partition;
use wlink_session::{cmd, CommandChannel, Envelope};

use crate::registry::DeviceRegistry;
use crate::supersede::TaskSlots;

/// Delays driving a bulk refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshTiming {
    /// How long one read waits for a reply.
    pub read_timeout: Duration,
    /// Pause before re-reading a device that did not answer.
    pub retry_delay: Duration,
    /// Gap between launching successive device loops.
    pub pacing: Duration,
}

impl Default for RefreshTiming {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(1500),
            retry_delay: Duration::from_millis(2000),
            pacing: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
pub struct BulkRefresher {
    registry: Arc<DeviceRegistry>,
    timing: RefreshTiming,
    slots: TaskSlots<Partition>,
}

impl BulkRefresher {
    pub fn new(registry: Arc<DeviceRegistry>, timing: RefreshTiming) -> Self {
        Self {
            registry,
            timing,
            slots: TaskSlots::new(),
        }
    }

    pub fn timing(&self) -> RefreshTiming {
        self.timing
    }

    /// Refresh every online tracked device of `channel`'s partition,
    /// superseding a refresh already running for it.
    pub async fn refresh<C>(&self, channel: Arc<C>)
    where
        C: CommandChannel + Sync + 'static,
    {
        let partition = channel.partition();
        let devices = self.registry.devices_in(partition);
        info!("[{}] bulk refresh of {} device(s)", partition, devices.len());
        self.slots
            .supersede(partition, refresh_devices(channel, devices, self.timing))
            .await;
    }

    pub async fn cancel_all(&self) {
        self.slots.cancel_all().await;
    }

    pub async fn is_running(&self, partition: Partition) -> bool {
        self.slots.is_running(&partition).await
    }

    /// Wait for the running refresh of `partition` to finish.
    pub async fn join(&self, partition: Partition) {
        self.slots.join(&partition).await;
    }
}

async fn refresh_devices<C>(channel: Arc<C>, devices: Vec<String>, timing: RefreshTiming)
where
    C: CommandChannel + Sync + 'static,
{
    let mut loops = FuturesUnordered::new();

    for (index, device_id) in devices.into_iter().enumerate() {
        if index > 0 {
            // Keep driving launched loops while waiting out the pacing gap.
            let pacing = tokio::time::sleep(timing.pacing);
            tokio::pin!(pacing);
            loop {
                tokio::select! {
                    _ = &mut pacing => break,
                    Some(()) = loops.next(), if !loops.is_empty() => {}
                }
            }
        }
        loops.push(read_until_answered(Arc::clone(&channel), device_id, timing));
    }

    while loops.next().await.is_some() {}
    debug!("[{}] bulk refresh complete", channel.partition());
}

/// Read `device_id` until any reply arrives.
async fn read_until_answered<C>(channel: Arc<C>, device_id: String, timing: RefreshTiming)
where
    C: CommandChannel + Sync + 'static,
{
    let envelope = Envelope::read(&device_id);
    let mut attempt: u32 = 1;
    loop {
        let reply = channel
            .request(&envelope, cmd::READ_RESPONSE, timing.read_timeout)
            .await;
        if reply.is_some() {
            trace!("[{}] read of {} answered", channel.partition(), device_id);
            return;
        }
        debug!(
            "[{}] read of {} unanswered (attempt {}), retrying in {:?}",
            channel.partition(),
            device_id,
            attempt,
            timing.retry_delay
        );
        attempt = attempt.saturating_add(1);
        tokio::time::sleep(timing.retry_delay).await;
    }
}
