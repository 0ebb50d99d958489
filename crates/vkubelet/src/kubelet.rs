//! The virtual kubelet: wires a provider to the cluster and supervises every
//! component from startup to shutdown.
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::client::{KubeClient, NodeClient, PodClient};
use crate::config::Config;
use crate::error::StartupError;
use crate::informer::Informer;
use crate::node::NodeController;
use crate::notifier::{run_status_notifier, StatusNotifier, DEFAULT_CAPACITY};
use crate::pod::{PodCache, PodKey};
use crate::provider::registry::{ProviderInitConfig, Registry};
use crate::provider::{BuiltProvider, Capabilities, Provider};
use crate::queue::WorkQueue;
use crate::reconciler::Reconciler;
use crate::resource_manager::ResourceManager;
use crate::sync::{run_workers, PodSyncer};
use crate::webserver;

/// A virtual kubelet backed by a single provider.
///
/// The virtual kubelet registers a node, watches the pods bound to it and
/// drives the provider until they match. It runs one instance of its
/// provider for its whole lifetime.
pub struct VirtualKubelet {
    config: Config,
    provider: Arc<dyn Provider>,
    capabilities: Capabilities,
    pod_client: Arc<dyn PodClient>,
    node_client: Arc<dyn NodeClient>,
    serve_http: bool,
}

/// Handles of the components running after startup.
#[derive(Default)]
struct Running {
    informer: Option<(CancellationToken, JoinHandle<()>)>,
    reconciler: Option<(CancellationToken, JoinHandle<()>)>,
    workers: Option<(CancellationToken, JoinHandle<()>)>,
    node: Option<(CancellationToken, JoinHandle<()>)>,
    notifier: Option<(CancellationToken, JoinHandle<()>)>,
    http: Option<(CancellationToken, JoinHandle<()>)>,
    queue: Option<WorkQueue<PodKey>>,
}

impl VirtualKubelet {
    /// Create a virtual kubelet from an already built provider and the
    /// clients it should talk to the cluster through.
    pub fn new(
        config: Config,
        provider: BuiltProvider,
        pod_client: Arc<dyn PodClient>,
        node_client: Arc<dyn NodeClient>,
    ) -> Self {
        VirtualKubelet {
            config,
            provider: provider.provider,
            capabilities: provider.capabilities,
            pod_client,
            node_client,
            serve_http: true,
        }
    }

    /// Validate `config`, build the configured provider from `registry` and
    /// talk to the cluster through `client`.
    pub fn from_registry(
        config: Config,
        registry: &Registry,
        client: kube::Client,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let init = ProviderInitConfig {
            config_path: config.provider_config.clone(),
            node_name: config.node_name.clone(),
            operating_system: config.operating_system.clone(),
            internal_ip: config.internal_ip,
            daemon_port: config.server_config.port,
            resource_manager: ResourceManager::new(client.clone()),
        };
        let built = registry.build(&config.provider, init)?;
        info!(provider = %config.provider, capabilities = ?built.capabilities, "provider built");
        let kube = Arc::new(KubeClient::new(client));
        Ok(Self::new(config, built, kube.clone(), kube))
    }

    /// Do not start the HTTP servers.
    pub fn without_http(mut self) -> Self {
        self.serve_http = false;
        self
    }

    /// Run until `token` is cancelled.
    ///
    /// Startup publishes the node, then waits for the first full pod list
    /// before any pod is reconciled. Shutdown stops the watch, drains the
    /// workers, reports the node NotReady and releases the provider, in that
    /// order.
    pub async fn run(self, token: CancellationToken) -> Result<(), StartupError> {
        let mut running = Running::default();
        let result = self.start(&token, &mut running).await;
        if let Err(e) = &result {
            error!(error = %e, "startup failed");
        } else {
            token.cancelled().await;
            info!("shutting down");
        }
        self.stop(running).await;
        result
    }

    async fn start(
        &self,
        token: &CancellationToken,
        running: &mut Running,
    ) -> Result<(), StartupError> {
        let cache = PodCache::new();
        let queue = WorkQueue::default();

        let mut node = NodeController::new(
            &self.config,
            self.provider.clone(),
            self.capabilities.clone(),
            self.node_client.clone(),
        );
        tokio::select! {
            _ = token.cancelled() => return Err(StartupError::Cancelled),
            res = node.register() => res.map_err(StartupError::NodeRegistration)?,
        }
        running.node = Some(spawn(|t| node.run(t), "node"));

        let informer = Informer::new(
            self.pod_client.clone(),
            cache.clone(),
            queue.clone(),
            self.config.node_name.clone(),
            self.config.namespace.clone(),
            self.config.full_resync_period,
        );
        running.informer = Some(spawn(|t| informer.run(t), "informer"));
        wait_for_initial_list(&cache, self.config.startup_timeout, token).await?;
        let pods = cache.len().await;
        info!(pods, "initial pod list received");

        let (notifier, receiver) = StatusNotifier::channel(DEFAULT_CAPACITY);
        self.provider.notify_pods(notifier).await;
        let notifier_cache = cache.clone();
        let pod_client = self.pod_client.clone();
        running.notifier = Some(spawn(
            |t| run_status_notifier(receiver, notifier_cache, pod_client, t),
            "notifier",
        ));

        let syncer = Arc::new(PodSyncer::new(
            self.provider.clone(),
            self.capabilities.clone(),
            cache.clone(),
            queue.clone(),
            self.pod_client.clone(),
            self.config.provider_timeout,
        ));
        let workers = self.config.pod_sync_workers;
        running.workers = Some(spawn(|t| run_workers(syncer, workers, t), "workers"));
        running.queue = Some(queue.clone());

        let reconciler = Reconciler::new(
            self.provider.clone(),
            cache,
            queue,
            self.config.reconcile_period,
            self.config.provider_timeout,
        );
        running.reconciler = Some(spawn(|t| reconciler.run(t), "reconciler"));

        if self.serve_http {
            let server_config = self.config.server_config.clone();
            let capabilities = self.capabilities.clone();
            running.http = Some(spawn(
                |t| async move {
                    if let Err(e) = webserver::start(&server_config, capabilities, t).await {
                        error!(error = ?e, "HTTP server failed");
                    }
                },
                "http",
            ));
        }

        info!(node = %self.config.node_name, workers = self.config.pod_sync_workers, "virtual kubelet started");
        Ok(())
    }

    async fn stop(&self, mut running: Running) {
        // Stop taking in new work.
        for (name, component) in [
            ("informer", running.informer.take()),
            ("reconciler", running.reconciler.take()),
        ] {
            stop_component(name, component).await;
        }

        // Drain the workers.
        if let Some(queue) = running.queue.take() {
            queue.shut_down().await;
        }
        if let Some((workers_token, mut handle)) = running.workers.take() {
            match tokio::time::timeout(self.config.shutdown_grace, &mut handle).await {
                Ok(_) => debug!("pod sync workers drained"),
                Err(_) => {
                    warn!(grace = ?self.config.shutdown_grace, "pod sync workers did not drain in time, cancelling");
                    workers_token.cancel();
                    let _ = handle.await;
                }
            }
        }

        stop_component("node", running.node.take()).await;
        stop_component("notifier", running.notifier.take()).await;
        stop_component("http", running.http.take()).await;

        if let Err(e) = self.provider.shutdown().await {
            warn!(error = ?e, "provider shutdown failed");
        }
        info!("virtual kubelet stopped");
    }
}

/// Spawns a component with its own cancellation token.
fn spawn<F>(
    run: impl FnOnce(CancellationToken) -> F,
    name: &'static str,
) -> (CancellationToken, JoinHandle<()>)
where
    F: Future<Output = ()> + Send + 'static,
{
    let token = CancellationToken::new();
    let handle = tokio::spawn(run(token.clone()).instrument(info_span!("component", name)));
    (token, handle)
}

async fn stop_component(name: &str, component: Option<(CancellationToken, JoinHandle<()>)>) {
    if let Some((token, handle)) = component {
        token.cancel();
        if let Err(e) = handle.await {
            error!(component = name, error = %e, "component panicked");
        }
    }
}

/// Waits until the cache holds the first full pod list.
async fn wait_for_initial_list(
    cache: &PodCache,
    timeout: Duration,
    token: &CancellationToken,
) -> Result<(), StartupError> {
    if cache.is_synced() {
        return Ok(());
    }
    tokio::select! {
        _ = token.cancelled() => Err(StartupError::Cancelled),
        res = tokio::time::timeout(timeout, cache.wait_synced()) => {
            res.map_err(|_| StartupError::CacheSyncTimeout(timeout))
        }
    }
}

/// Cancels `token` on SIGINT, or SIGTERM on unix.
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut term =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(term) => term,
                    Err(e) => {
                        error!(error = %e, "unable to listen for SIGTERM");
                        let _ = tokio::signal::ctrl_c().await;
                        warn!("Caught keyboard interrupt.");
                        token.cancel();
                        return;
                    }
                };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => warn!("Caught keyboard interrupt."),
                _ = term.recv() => warn!("Caught SIGTERM."),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            warn!("Caught keyboard interrupt.");
        }
        token.cancel();
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pod::PHASE_RUNNING;
    use crate::testing::{kube_pod, Call, FakeNodeClient, FakePodClient, RecordingProvider};
    use kube_runtime::watcher::Event;

    fn test_config() -> Config {
        let mut config = Config::default_config("vk", "mock");
        config.startup_timeout = Duration::from_secs(5);
        config.heartbeat_interval = Duration::from_secs(60);
        config.provider_timeout = Duration::from_secs(5);
        config.shutdown_grace = Duration::from_secs(1);
        config
    }

    struct Harness {
        provider: Arc<RecordingProvider>,
        pods: Arc<FakePodClient>,
        nodes: Arc<FakeNodeClient>,
    }

    impl Harness {
        fn new() -> Self {
            Harness {
                provider: Arc::new(RecordingProvider::default()),
                pods: Arc::new(FakePodClient::default()),
                nodes: Arc::new(FakeNodeClient::default()),
            }
        }

        fn kubelet(&self, config: Config) -> VirtualKubelet {
            VirtualKubelet::new(
                config,
                BuiltProvider::new(self.provider.clone(), Capabilities::new()),
                self.pods.clone(),
                self.nodes.clone(),
            )
            .without_http()
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition never held");
    }

    fn ready_status(nodes: &FakeNodeClient) -> Option<String> {
        nodes
            .node()?
            .status?
            .conditions?
            .into_iter()
            .find(|c| c.type_ == "Ready")
            .map(|c| c.status)
    }

    #[tokio::test]
    async fn create_path_end_to_end() {
        let h = Harness::new();
        h.pods.push_watch_event(Ok(Event::Restarted(vec![]))).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(h.kubelet(test_config()).run(token.clone()));

        h.pods
            .push_watch_event(Ok(Event::Applied(kube_pod("default", "nginx", "vk"))))
            .await;
        let provider = h.provider.clone();
        eventually(|| provider.calls() == vec![Call::Create("default/nginx".to_owned())]).await;
        let pods = h.pods.clone();
        eventually(|| {
            pods.status_updates()
                .iter()
                .any(|p| p.phase() == Some(PHASE_RUNNING))
        })
        .await;
        assert_eq!(ready_status(&h.nodes).as_deref(), Some("True"));

        token.cancel();
        handle.await.unwrap().unwrap();
        assert_eq!(h.provider.notify_calls(), 1);
        assert_eq!(h.provider.shutdown_calls(), 1);
        assert_eq!(ready_status(&h.nodes).as_deref(), Some("False"));
        assert_eq!(
            h.provider
                .calls()
                .iter()
                .filter(|c| matches!(c, Call::Create(_)))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn reconciler_recreates_forgotten_pods() {
        let h = Harness::new();
        h.pods
            .push_watch_event(Ok(Event::Restarted(vec![kube_pod("default", "redis", "vk")])))
            .await;
        let mut config = test_config();
        config.reconcile_period = Duration::from_millis(50);
        let token = CancellationToken::new();
        let handle = tokio::spawn(h.kubelet(config).run(token.clone()));

        let key = PodKey::new("default", "redis").unwrap();
        let provider = h.provider.clone();
        eventually(|| provider.has_pod(&key)).await;
        h.provider.forget(&key);
        eventually(|| provider.calls().len() >= 2 && provider.has_pod(&key)).await;
        assert!(h
            .provider
            .calls()
            .iter()
            .all(|c| *c == Call::Create("default/redis".to_owned())));

        token.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_initial_list_times_out() {
        let h = Harness::new();
        let mut config = test_config();
        config.startup_timeout = Duration::from_millis(50);

        let result = h.kubelet(config).run(CancellationToken::new()).await;
        assert!(matches!(result, Err(StartupError::CacheSyncTimeout(_))));
        assert_eq!(h.provider.shutdown_calls(), 1);
    }

    #[tokio::test]
    async fn cancellation_during_startup_is_reported() {
        let h = Harness::new();
        let mut config = test_config();
        config.startup_timeout = Duration::from_secs(60);
        let token = CancellationToken::new();
        let handle = tokio::spawn(h.kubelet(config).run(token.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        token.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(StartupError::Cancelled)));
    }

    #[tokio::test]
    async fn node_registration_failure_aborts_startup() {
        let h = Harness::new();
        h.nodes.fail_all(true);
        let result = h.kubelet(test_config()).run(CancellationToken::new()).await;
        assert!(matches!(result, Err(StartupError::NodeRegistration(_))));
        assert!(h.provider.calls().is_empty());
    }

    #[tokio::test]
    async fn zero_startup_timeout_accepts_an_available_list() {
        let cache = PodCache::new();
        let token = CancellationToken::new();
        assert!(matches!(
            wait_for_initial_list(&cache, Duration::ZERO, &token).await,
            Err(StartupError::CacheSyncTimeout(_))
        ));

        cache.mark_synced();
        assert!(wait_for_initial_list(&cache, Duration::ZERO, &token)
            .await
            .is_ok());
    }
}
