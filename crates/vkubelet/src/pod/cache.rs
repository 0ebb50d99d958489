//! Local copy of the desired pod state published by the cluster API.
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};

use super::{Pod, PodKey};

/// Desired-state cache filled by the watch layer.
///
/// Writes come from watch delivery (and from a worker purging a pod the
/// provider confirmed gone). Workers and the reconciler read under the lock
/// and clone what they need; nothing borrowed from the cache outlives a call.
///
/// The cache also tracks whether it reflects a complete list of the watched
/// pods. It starts stale, becomes synced on the first full list, and goes
/// stale again whenever the watch breaks until the relist completes.
#[derive(Clone)]
pub struct PodCache {
    pods: Arc<RwLock<HashMap<PodKey, Pod>>>,
    synced_tx: Arc<watch::Sender<bool>>,
    synced_rx: watch::Receiver<bool>,
}

impl Default for PodCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PodCache {
    /// An empty, stale cache.
    pub fn new() -> Self {
        let (synced_tx, synced_rx) = watch::channel(false);
        PodCache {
            pods: Arc::new(RwLock::new(HashMap::new())),
            synced_tx: Arc::new(synced_tx),
            synced_rx,
        }
    }

    /// Returns a copy of the desired pod for `key`.
    pub async fn get(&self, key: &PodKey) -> Option<Pod> {
        self.pods.read().await.get(key).cloned()
    }

    /// Inserts or replaces a pod, returning the previous version.
    pub async fn upsert(&self, key: PodKey, pod: Pod) -> Option<Pod> {
        self.pods.write().await.insert(key, pod)
    }

    /// Removes a pod, returning it if it was present.
    pub async fn remove(&self, key: &PodKey) -> Option<Pod> {
        self.pods.write().await.remove(key)
    }

    /// Replaces the whole content, returning the keys that disappeared.
    pub async fn replace(&self, pods: HashMap<PodKey, Pod>) -> Vec<PodKey> {
        let mut guard = self.pods.write().await;
        let removed = guard
            .keys()
            .filter(|k| !pods.contains_key(k))
            .cloned()
            .collect();
        *guard = pods;
        removed
    }

    /// All keys currently desired.
    pub async fn keys(&self) -> Vec<PodKey> {
        self.pods.read().await.keys().cloned().collect()
    }

    /// Number of desired pods.
    pub async fn len(&self) -> usize {
        self.pods.read().await.len()
    }

    /// Whether no pods are desired.
    pub async fn is_empty(&self) -> bool {
        self.pods.read().await.is_empty()
    }

    /// Records that the cache reflects a full list.
    pub fn mark_synced(&self) {
        self.synced_tx.send_replace(true);
    }

    /// Records that the cache may be missing events.
    pub fn mark_stale(&self) {
        self.synced_tx.send_replace(false);
    }

    /// Whether the cache reflects a full list.
    pub fn is_synced(&self) -> bool {
        *self.synced_rx.borrow()
    }

    /// Waits until the cache reflects a full list.
    pub async fn wait_synced(&self) {
        let mut rx = self.synced_rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
