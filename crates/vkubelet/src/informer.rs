//! Keeps the desired-state cache in step with the API server and feeds the
//! work queue.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod as KubePod;
use kube_runtime::watcher::Event;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::backoff::{BackoffStrategy, ExponentialBackoffStrategy};
use crate::client::PodClient;
use crate::pod::{Pod, PodCache, PodKey};
use crate::queue::WorkQueue;

/// A change to the set of pods assigned to this node.
///
/// Workers only ever see the keys these events carry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PodEvent {
    /// A pod was assigned to the node.
    Added(PodKey),
    /// The desired state of a pod changed.
    Updated(PodKey),
    /// A pod is gone from the API.
    Deleted(PodKey),
    /// Every known pod should be looked at again.
    Resync,
}

/// Watches the pods bound to one node.
pub struct Informer {
    client: Arc<dyn PodClient>,
    cache: PodCache,
    queue: WorkQueue<PodKey>,
    node_name: String,
    namespace: Option<String>,
    resync_period: Duration,
}

impl Informer {
    /// Creates an informer for `node_name`, watching `namespace` or every
    /// namespace when `None`.
    pub fn new(
        client: Arc<dyn PodClient>,
        cache: PodCache,
        queue: WorkQueue<PodKey>,
        node_name: impl Into<String>,
        namespace: Option<String>,
        resync_period: Duration,
    ) -> Self {
        Informer {
            client,
            cache,
            queue,
            node_name: node_name.into(),
            namespace,
            resync_period,
        }
    }

    /// Runs the watch and the resync ticker until `token` is cancelled.
    ///
    /// A watch that fails is dropped and reopened after a backoff. The new
    /// watch starts with a full list, so the cache stays stale until that
    /// list has been applied.
    pub async fn run(self, token: CancellationToken) {
        let mut backoff =
            ExponentialBackoffStrategy::new(Duration::from_millis(500), Duration::from_secs(30));
        let mut resync = tokio::time::interval_at(
            tokio::time::Instant::now() + self.resync_period,
            self.resync_period,
        );
        let mut stream = self.open();

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("pod informer stopping");
                    return;
                }
                _ = resync.tick() => {
                    if self.cache.is_synced() {
                        self.dispatch(PodEvent::Resync).await;
                    }
                }
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        backoff.reset();
                        self.apply(event).await;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "pod watch failed, reconnecting");
                        self.cache.mark_stale();
                        tokio::select! {
                            _ = token.cancelled() => return,
                            _ = backoff.wait() => {}
                        }
                        stream = self.open();
                    }
                    None => {
                        debug!("pod watch ended, reconnecting");
                        self.cache.mark_stale();
                        stream = self.open();
                    }
                },
            }
        }
    }

    fn open(&self) -> futures::stream::BoxStream<'static, anyhow::Result<Event<KubePod>>> {
        info!(node = %self.node_name, namespace = ?self.namespace, "watching pods");
        self.client
            .watch(&self.node_name, self.namespace.as_deref())
    }

    /// Applies a watch event to the cache and dispatches what it means.
    pub async fn apply(&self, event: Event<KubePod>) {
        match event {
            Event::Applied(pod) => {
                let pod = Pod::from(pod);
                let key = match pod.key() {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(error = %e, "ignoring pod without a name");
                        return;
                    }
                };
                if !self.is_assigned(&pod) {
                    // Rebound elsewhere; forget it here.
                    if self.cache.remove(&key).await.is_some() {
                        self.dispatch(PodEvent::Deleted(key)).await;
                    }
                    return;
                }
                let event = match self.cache.upsert(key.clone(), pod.clone()).await {
                    None => PodEvent::Added(key),
                    Some(old) if old.same_desired_state(&pod) => {
                        trace!(%key, "status-only update");
                        return;
                    }
                    Some(_) => PodEvent::Updated(key),
                };
                self.dispatch(event).await;
            }
            Event::Deleted(pod) => {
                let pod = Pod::from(pod);
                if let Ok(key) = pod.key() {
                    self.cache.remove(&key).await;
                    self.dispatch(PodEvent::Deleted(key)).await;
                }
            }
            Event::Restarted(pods) => {
                let pods: HashMap<PodKey, Pod> = pods
                    .into_iter()
                    .map(Pod::from)
                    .filter(|pod| self.is_assigned(pod))
                    .filter_map(|pod| pod.key().ok().map(|key| (key, pod)))
                    .collect();
                let count = pods.len();
                let removed = self.cache.replace(pods).await;
                for key in removed {
                    self.dispatch(PodEvent::Deleted(key)).await;
                }
                self.cache.mark_synced();
                info!(pods = count, "pod cache synced");
                self.dispatch(PodEvent::Resync).await;
            }
        }
    }

    /// Feeds the keys an event concerns into the work queue.
    pub async fn dispatch(&self, event: PodEvent) {
        match event {
            PodEvent::Added(key) | PodEvent::Updated(key) | PodEvent::Deleted(key) => {
                trace!(%key, "enqueueing pod");
                self.queue.add(key).await;
            }
            PodEvent::Resync => {
                for key in self.cache.keys().await {
                    self.queue.add(key).await;
                }
            }
        }
    }

    fn is_assigned(&self, pod: &Pod) -> bool {
        pod.node_name() == Some(self.node_name.as_str())
            && self
                .namespace
                .as_deref()
                .map_or(true, |ns| ns == pod.namespace())
    }
}
