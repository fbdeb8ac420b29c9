//! Keyed task slots with cancel-and-join supersession.
//!
//! Starting a task under a key aborts the task already running under that
//! key and waits for it to finish tearing down before the new one is
//! spawned, so two tasks with the same key never overlap.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use wlink_core::prelude::*;

#[derive(Debug)]
pub struct TaskSlots<K> {
    slots: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K> Default for TaskSlots<K> {
    fn default() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> TaskSlots<K>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel-and-join the task under `key`, then spawn `task` in its place.
    ///
    /// Concurrent calls for the same key are serialized by the slot lock.
    pub async fn supersede<F>(&self, key: K, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slots = self.slots.lock().await;
        if let Some(previous) = slots.remove(&key) {
            if !previous.is_finished() {
                debug!("superseding task {:?}", key);
                previous.abort();
            }
            let _ = previous.await;
        }
        slots.retain(|_, handle| !handle.is_finished());
        slots.insert(key, tokio::spawn(task));
    }

    /// Cancel-and-join the task under `key`. Returns `true` if one was running.
    pub async fn cancel(&self, key: &K) -> bool {
        let previous = self.slots.lock().await.remove(key);
        match previous {
            Some(handle) => {
                let running = !handle.is_finished();
                handle.abort();
                let _ = handle.await;
                running
            }
            None => false,
        }
    }

    /// Cancel-and-join every task.
    pub async fn cancel_all(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut slots = self.slots.lock().await;
            slots.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub async fn is_running(&self, key: &K) -> bool {
        self.slots
            .lock()
            .await
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Wait for the task under `key` to finish on its own.
    pub async fn join(&self, key: &K) {
        let handle = self.slots.lock().await.remove(key);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
