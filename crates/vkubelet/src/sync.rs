//! Pod sync workers.
//!
//! Each worker takes a key off the queue, compares the desired pod with what
//! the provider reports and issues at most one mutating provider call. The
//! queue guarantees a key is only ever held by one worker, so calls for a
//! single pod are totally ordered.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

use crate::client::PodClient;
use crate::error::{classify, is_not_found, ErrorKind};
use crate::pod::{Pod, PodCache, PodKey, PHASE_FAILED, PHASE_PENDING};
use crate::provider::{Capabilities, Provider};
use crate::queue::WorkQueue;

/// Consecutive transient failures after which a key is dropped.
pub const MAX_RETRIES: u32 = 20;

/// Status reason set on pods the provider refused.
pub const REASON_PROVIDER_FAILED: &str = "ProviderFailed";

/// What a worker does for one key.
#[derive(Clone, Debug, PartialEq)]
pub enum SyncAction {
    /// Start the desired pod.
    Create(Pod),
    /// Bring the running pod in line with the desired one.
    Update(Pod),
    /// Stop the pod.
    Delete(Pod),
    /// The pod is being deleted and the provider no longer has it: drop it
    /// from the cache and remove the API object.
    Purge(Pod),
    /// Nothing to do.
    Skip(&'static str),
}

/// Picks the action for a desired and an observed pod.
///
/// `differs` is only consulted when both exist and the pod is not being
/// deleted.
pub fn decide(
    desired: Option<Pod>,
    observed: Option<Pod>,
    differs: impl FnOnce(&Pod, &Pod) -> bool,
) -> SyncAction {
    match (desired, observed) {
        (Some(desired), observed) if desired.deletion_timestamp().is_some() => match observed {
            Some(_) => SyncAction::Delete(desired),
            None => SyncAction::Purge(desired),
        },
        (Some(desired), _) if desired.is_terminal() => SyncAction::Skip("pod is terminal"),
        (Some(desired), None) => SyncAction::Create(desired),
        (Some(desired), Some(observed)) => {
            if differs(&desired, &observed) {
                SyncAction::Update(desired)
            } else {
                SyncAction::Skip("pod is up to date")
            }
        }
        (None, Some(observed)) => SyncAction::Delete(observed),
        (None, None) => SyncAction::Skip("pod is absent"),
    }
}

/// Result of a successful sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The pod is where it should be.
    Done,
    /// The provider accepted a deletion; look again later to confirm it.
    Recheck,
}

/// Reconciles single pods against the provider.
pub struct PodSyncer {
    provider: Arc<dyn Provider>,
    capabilities: Capabilities,
    cache: PodCache,
    queue: WorkQueue<PodKey>,
    client: Arc<dyn PodClient>,
    provider_timeout: Duration,
    max_retries: u32,
}

impl PodSyncer {
    /// Creates a syncer. Every provider call is bounded by `provider_timeout`.
    pub fn new(
        provider: Arc<dyn Provider>,
        capabilities: Capabilities,
        cache: PodCache,
        queue: WorkQueue<PodKey>,
        client: Arc<dyn PodClient>,
        provider_timeout: Duration,
    ) -> Self {
        PodSyncer {
            provider,
            capabilities,
            cache,
            queue,
            client,
            provider_timeout,
            max_retries: MAX_RETRIES,
        }
    }

    /// Overrides how many consecutive transient failures a key may have.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    async fn bounded<T>(&self, call: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
        tokio::time::timeout(self.provider_timeout, call).await?
    }

    /// Reconciles one pod.
    pub async fn sync(&self, key: &PodKey) -> anyhow::Result<SyncOutcome> {
        let desired = self.cache.get(key).await;
        let observed = match self
            .bounded(self.provider.get_pod(key.namespace(), key.name()))
            .await
        {
            Ok(pod) => Some(pod),
            Err(e) if is_not_found(&e) => None,
            Err(e) => return Err(e.context("getting pod from provider")),
        };

        if desired.is_none() && observed.is_some() && !self.cache.is_synced() {
            // The pod may only be missing because the watch is catching up.
            anyhow::bail!("desired state cache is stale, deferring deletion of {}", key);
        }

        let supports_update = self.capabilities.supports_update();
        let action = decide(desired, observed, |desired, observed| {
            let differs = self.provider.pod_differs(desired, observed);
            if differs && !supports_update {
                debug!(%key, "pod differs but provider cannot update in place");
            }
            differs && supports_update
        });

        match action {
            SyncAction::Create(pod) => {
                info!(%key, "creating pod in provider");
                if let Err(e) = self.bounded(self.provider.create_pod(&pod)).await {
                    self.report_provider_failure(&pod, &e).await;
                    return Err(e.context("creating pod"));
                }
                Ok(SyncOutcome::Done)
            }
            SyncAction::Update(pod) => {
                info!(%key, "updating pod in provider");
                if let Err(e) = self.bounded(self.provider.update_pod(&pod)).await {
                    self.report_provider_failure(&pod, &e).await;
                    return Err(e.context("updating pod"));
                }
                Ok(SyncOutcome::Done)
            }
            SyncAction::Delete(pod) => {
                info!(%key, "deleting pod in provider");
                match self.bounded(self.provider.delete_pod(&pod)).await {
                    Ok(()) => (),
                    Err(e) if is_not_found(&e) => debug!(%key, "pod already gone from provider"),
                    Err(e) => return Err(e.context("deleting pod")),
                }
                if self.cache.get(key).await.is_some() {
                    Ok(SyncOutcome::Recheck)
                } else {
                    Ok(SyncOutcome::Done)
                }
            }
            SyncAction::Purge(pod) => {
                self.bounded(self.client.delete(pod.namespace(), pod.name()))
                    .await
                    .context("deleting pod from the API")?;
                self.cache.remove(key).await;
                info!(%key, "pod deleted");
                Ok(SyncOutcome::Done)
            }
            SyncAction::Skip(reason) => {
                trace!(%key, reason, "nothing to do");
                Ok(SyncOutcome::Done)
            }
        }
    }

    /// Marks a pod the provider refused so the cluster can see why.
    async fn report_provider_failure(&self, pod: &Pod, error: &anyhow::Error) {
        if !matches!(
            classify(error),
            ErrorKind::PermanentProviderFailure | ErrorKind::InvalidInput
        ) {
            return;
        }
        let phase = if pod.restart_policy() == "Never" {
            PHASE_FAILED
        } else {
            PHASE_PENDING
        };
        let mut update = pod.clone().into_kube_pod();
        update.metadata.resource_version = None;
        let status = update.status.get_or_insert_with(Default::default);
        status.phase = Some(phase.to_owned());
        status.reason = Some(REASON_PROVIDER_FAILED.to_owned());
        status.message = Some(format!("{:#}", error));

        if let Err(e) = self.client.update_status(&Pod::from(update)).await {
            warn!(
                namespace = pod.namespace(),
                name = pod.name(),
                error = %e,
                "failed to record provider failure on pod"
            );
        }
    }

    /// Syncs one dequeued key and settles it with the queue.
    async fn process(&self, key: PodKey, token: &CancellationToken) {
        let result = tokio::select! {
            _ = token.cancelled() => {
                debug!(%key, "sync cancelled");
                self.queue.done(&key).await;
                return;
            }
            result = self.sync(&key) => result,
        };

        match result {
            Ok(SyncOutcome::Done) => self.queue.forget(&key).await,
            Ok(SyncOutcome::Recheck) => self.queue.add_rate_limited(key.clone()).await,
            Err(e) => self.handle_error(&key, e).await,
        }
        self.queue.done(&key).await;
    }

    async fn handle_error(&self, key: &PodKey, e: anyhow::Error) {
        match classify(&e) {
            ErrorKind::Transient | ErrorKind::NotFound => {
                let retries = self.queue.num_requeues(key).await;
                if retries < self.max_retries {
                    warn!(%key, retries, error = ?e, "pod sync failed, retrying");
                    self.queue.add_rate_limited(key.clone()).await;
                } else {
                    error!(%key, retries, error = ?e, "pod sync failed too many times, dropping");
                    self.queue.forget(key).await;
                }
            }
            kind => {
                error!(%key, ?kind, error = ?e, "pod sync failed");
                self.queue.forget(key).await;
            }
        }
    }

    async fn worker(&self, token: CancellationToken) {
        loop {
            let key = tokio::select! {
                _ = token.cancelled() => break,
                key = self.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            self.process(key, &token).await;
        }
        debug!("worker stopped");
    }
}

/// Runs `workers` sync workers until the queue shuts down and drains, or
/// `token` is cancelled.
pub async fn run_workers(syncer: Arc<PodSyncer>, workers: usize, token: CancellationToken) {
    let handles: Vec<_> = (0..workers)
        .map(|id| {
            let syncer = syncer.clone();
            let token = token.clone();
            tokio::spawn(
                async move { syncer.worker(token).await }.instrument(info_span!("worker", id)),
            )
        })
        .collect();
    for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
            error!(error = %e, "pod sync worker panicked");
        }
    }
}
