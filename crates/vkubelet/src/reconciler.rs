//! Periodic safety net that re-enqueues every pod either side knows about.
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::pod::{PodCache, PodKey};
use crate::provider::Provider;
use crate::queue::WorkQueue;

/// Diffs desired against provider-reported pods on a timer.
pub struct Reconciler {
    provider: Arc<dyn Provider>,
    cache: PodCache,
    queue: WorkQueue<PodKey>,
    period: Duration,
    provider_timeout: Duration,
}

impl Reconciler {
    /// Creates a reconciler running every `period`.
    pub fn new(
        provider: Arc<dyn Provider>,
        cache: PodCache,
        queue: WorkQueue<PodKey>,
        period: Duration,
        provider_timeout: Duration,
    ) -> Self {
        Reconciler {
            provider,
            cache,
            queue,
            period,
            provider_timeout,
        }
    }

    /// Enqueues the union of desired and provider-reported keys.
    ///
    /// Returns how many keys were enqueued. If the provider cannot list its
    /// pods, the desired keys are still enqueued and the error is returned.
    pub async fn reconcile_once(&self) -> anyhow::Result<usize> {
        let mut keys: BTreeSet<PodKey> = self.cache.keys().await.into_iter().collect();

        let reported = tokio::time::timeout(self.provider_timeout, self.provider.get_pods())
            .await
            .map_err(anyhow::Error::from)
            .and_then(|r| r)
            .context("listing provider pods");
        let result = match reported {
            Ok(pods) => {
                keys.extend(pods.iter().filter_map(|pod| pod.key().ok()));
                Ok(keys.len())
            }
            Err(e) => Err(e),
        };

        for key in keys {
            self.queue.add(key).await;
        }
        result
    }

    /// Reconciles immediately, then every period, until `token` is
    /// cancelled. Passes are skipped while the cache is stale.
    pub async fn run(self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.period);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            if !self.cache.is_synced() {
                debug!("pod cache stale, skipping reconciliation");
                continue;
            }
            match self.reconcile_once().await {
                Ok(n) => debug!(keys = n, "reconciliation enqueued pods"),
                Err(e) => warn!(error = ?e, "reconciliation incomplete"),
            }
        }
        debug!("reconciler stopped");
    }
}
