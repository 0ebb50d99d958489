//! Pushes the pod statuses a provider reports back to the API server.
//!
//! The provider writes to a bounded channel through a [`StatusNotifier`].
//! A full channel never blocks the provider: the status is dropped with a
//! warning and the provider is expected to report the latest state again.
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::client::PodClient;
use crate::pod::{Pod, PodCache};

/// Capacity of the status channel.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Handle a provider uses to report pod status changes.
#[derive(Clone, Debug)]
pub struct StatusNotifier {
    tx: mpsc::Sender<Pod>,
}

/// The consuming end of a [`StatusNotifier`].
pub struct StatusReceiver {
    rx: mpsc::Receiver<Pod>,
}

impl StatusNotifier {
    /// A connected notifier and receiver.
    pub fn channel(capacity: usize) -> (StatusNotifier, StatusReceiver) {
        let (tx, rx) = mpsc::channel(capacity);
        (StatusNotifier { tx }, StatusReceiver { rx })
    }

    /// Reports the current state of a pod. The pod's status is what gets
    /// published.
    ///
    /// Returns `false` if the status was dropped because the channel is full
    /// or closed.
    pub fn notify(&self, pod: Pod) -> bool {
        match self.tx.try_send(pod) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(pod)) => {
                warn!(
                    namespace = pod.namespace(),
                    name = pod.name(),
                    "status channel full, dropping pod status"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("status channel closed");
                false
            }
        }
    }

    /// Whether the consumer has gone away.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl StatusReceiver {
    /// The next reported pod, or `None` once every notifier is dropped.
    pub async fn recv(&mut self) -> Option<Pod> {
        self.rx.recv().await
    }
}

/// Consumes provider statuses until `token` is cancelled or every notifier is
/// dropped.
///
/// Statuses are applied one at a time in the order received. A status is
/// dropped when its pod is no longer desired, when the cached pod already
/// reached a terminal phase, or when it matches the cached status.
pub async fn run_status_notifier(
    mut receiver: StatusReceiver,
    cache: PodCache,
    client: Arc<dyn PodClient>,
    token: CancellationToken,
) {
    loop {
        let reported = tokio::select! {
            _ = token.cancelled() => break,
            pod = receiver.rx.recv() => match pod {
                Some(pod) => pod,
                None => break,
            },
        };
        let key = match reported.key() {
            Ok(key) => key,
            Err(e) => {
                warn!(error = %e, "provider reported a pod without a name");
                continue;
            }
        };
        let cached = match cache.get(&key).await {
            Some(pod) => pod,
            None => {
                trace!(%key, "pod not desired, dropping status");
                continue;
            }
        };
        if cached.is_terminal() {
            trace!(%key, "pod already terminal, dropping status");
            continue;
        }
        if cached.status() == reported.status() {
            trace!(%key, "status unchanged");
            continue;
        }

        let mut update = cached.into_kube_pod();
        update.status = reported.into_kube_pod().status;
        let update = Pod::from(update);
        match client.update_status(&update).await {
            Ok(()) => debug!(%key, phase = ?update.phase(), "pod status updated"),
            Err(e) => warn!(%key, error = %e, "failed to update pod status"),
        }
    }
    receiver.rx.close();
    debug!("status notifier stopped");
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{kube_pod, FakePodClient};
    use k8s_openapi::api::core::v1::PodStatus;
    use std::time::Duration;

    fn with_phase(name: &str, phase: &str) -> Pod {
        let mut pod = kube_pod("default", name, "vk");
        pod.status = Some(PodStatus {
            phase: Some(phase.to_owned()),
            ..Default::default()
        });
        pod.into()
    }

    async fn run_with(cache: PodCache, statuses: Vec<Pod>) -> Arc<FakePodClient> {
        let client = Arc::new(FakePodClient::default());
        let (notifier, receiver) = StatusNotifier::channel(16);
        for pod in statuses {
            assert!(notifier.notify(pod));
        }
        drop(notifier);
        tokio::time::timeout(
            Duration::from_secs(1),
            run_status_notifier(receiver, cache, client.clone(), CancellationToken::new()),
        )
        .await
        .expect("notifier did not stop after the channel closed");
        client
    }

    #[tokio::test]
    async fn publishes_status_of_desired_pods() {
        let cache = PodCache::new();
        let desired = Pod::from(kube_pod("default", "nginx", "vk"));
        cache.upsert(desired.key().unwrap(), desired).await;

        let client = run_with(cache, vec![with_phase("nginx", "Running")]).await;
        let updates = client.status_updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].phase(), Some("Running"));
        // Desired spec is kept, only the status comes from the provider.
        assert_eq!(updates[0].node_name(), Some("vk"));
    }

    #[tokio::test]
    async fn drops_unknown_terminal_and_unchanged() {
        let cache = PodCache::new();
        let done = with_phase("done", "Succeeded");
        cache.upsert(done.key().unwrap(), done).await;
        let steady = with_phase("steady", "Running");
        cache.upsert(steady.key().unwrap(), steady).await;

        let client = run_with(
            cache,
            vec![
                with_phase("unknown", "Running"),
                with_phase("done", "Running"),
                with_phase("steady", "Running"),
            ],
        )
        .await;
        assert!(client.status_updates().is_empty());
    }

    #[tokio::test]
    async fn statuses_are_applied_in_order() {
        let cache = PodCache::new();
        let desired = Pod::from(kube_pod("default", "nginx", "vk"));
        cache.upsert(desired.key().unwrap(), desired).await;

        let client = run_with(
            cache,
            vec![with_phase("nginx", "Pending"), with_phase("nginx", "Running")],
        )
        .await;
        let phases: Vec<_> = client
            .status_updates()
            .iter()
            .map(|p| p.phase().map(str::to_owned))
            .collect();
        assert_eq!(
            phases,
            vec![Some("Pending".to_owned()), Some("Running".to_owned())]
        );
    }

    #[test]
    fn full_channel_drops_without_blocking() {
        let (notifier, _receiver) = StatusNotifier::channel(1);
        assert!(notifier.notify(with_phase("a", "Running")));
        assert!(!notifier.notify(with_phase("b", "Running")));
    }
}
