//! A provider that runs nothing.
//!
//! Every pod handed to the mock provider is stored in memory and reported as
//! `Running` with all of its containers ready. Logs, exec and stats are served
//! from canned data. It is meant for exercising a virtual kubelet against a
//! real cluster without a real backend.
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateRunning, ContainerStatus, DaemonEndpoint, NodeAddress,
    NodeCondition, NodeDaemonEndpoints, PodCondition, PodStatus,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};
use vkubelet::log::{self, Sender};
use vkubelet::node::Builder;
use vkubelet::notifier::StatusNotifier;
use vkubelet::pod::{Pod, PodKey, PHASE_RUNNING};
use vkubelet::provider::registry::{ProviderInitConfig, Registry};
use vkubelet::provider::{
    BuiltProvider, Capabilities, ContainerExec, ContainerLogs, ExecRequest, NodeConfigurer,
    Provider, ProviderError, StatsProvider,
};
use vkubelet::resource_manager::ResourceManager;
use vkubelet::stats::{
    ContainerStats, CpuStats, MemoryStats, NodeStats, PodReference, PodStats, Summary,
};

mod config;

pub use config::MockConfig;

/// The name the mock provider is registered under.
pub const PROVIDER_NAME: &str = "mock";

const MOCK_HOST_IP: &str = "1.2.3.4";
const MOCK_POD_IP: &str = "5.6.7.8";
const CANNED_LOG_LINES: usize = 10;

/// Registers the mock provider under [`PROVIDER_NAME`].
pub fn register(registry: &mut Registry) {
    registry.register(PROVIDER_NAME, |init: ProviderInitConfig| {
        let config = match init.config_path.as_deref() {
            Some(path) => MockConfig::load(path, &init.node_name)?,
            None => MockConfig::default(),
        };
        Ok(MockProvider::new(init, config).build())
    });
}

/// Stores pods in memory and reports them as running.
pub struct MockProvider {
    node_name: String,
    operating_system: String,
    internal_ip: Option<IpAddr>,
    daemon_port: u16,
    config: MockConfig,
    start_time: DateTime<Utc>,
    resource_manager: ResourceManager,
    pods: RwLock<HashMap<PodKey, Pod>>,
    notifier: Mutex<Option<StatusNotifier>>,
}

impl MockProvider {
    /// A provider for the node described by `init`.
    pub fn new(init: ProviderInitConfig, config: MockConfig) -> Self {
        MockProvider {
            node_name: init.node_name,
            operating_system: init.operating_system,
            internal_ip: init.internal_ip,
            daemon_port: init.daemon_port,
            config,
            start_time: Utc::now(),
            resource_manager: init.resource_manager,
            pods: RwLock::new(HashMap::new()),
            notifier: Mutex::new(None),
        }
    }

    /// Bundles the provider with every optional capability.
    pub fn build(self) -> BuiltProvider {
        let provider = Arc::new(self);
        let capabilities = Capabilities::new()
            .with_logs(provider.clone())
            .with_exec(provider.clone())
            .with_stats(provider.clone())
            .with_node_configurer(provider.clone());
        BuiltProvider::new(provider, capabilities)
    }

    async fn report(&self, pod: &Pod) {
        if let Some(notifier) = self.notifier.lock().await.as_ref() {
            notifier.notify(pod.clone());
        }
    }

    async fn stored(&self, namespace: &str, name: &str) -> anyhow::Result<Pod> {
        let key = PodKey::new(namespace, name)?;
        self.pods
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                ProviderError::PodNotFound {
                    pod_name: name.to_owned(),
                }
                .into()
            })
    }

    async fn container(&self, namespace: &str, pod: &str, container: &str) -> anyhow::Result<Pod> {
        let pod = self.stored(namespace, pod).await?;
        if !pod.containers().iter().any(|c| c.name == container) {
            return Err(ProviderError::ContainerNotFound {
                pod_name: pod.name().to_owned(),
                container_name: container.to_owned(),
            }
            .into());
        }
        Ok(pod)
    }
}

/// The status the mock reports for every pod it holds.
fn running_status(pod: &Pod, now: DateTime<Utc>) -> PodStatus {
    let condition = |type_: &str| PodCondition {
        type_: type_.to_owned(),
        status: "True".to_owned(),
        last_transition_time: Some(Time(now)),
        ..Default::default()
    };
    let container_statuses = pod
        .containers()
        .iter()
        .map(|c| ContainerStatus {
            name: c.name.clone(),
            image: c.image.clone().unwrap_or_default(),
            ready: true,
            started: Some(true),
            restart_count: 0,
            state: Some(ContainerState {
                running: Some(ContainerStateRunning {
                    started_at: Some(Time(now)),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    PodStatus {
        phase: Some(PHASE_RUNNING.to_owned()),
        host_ip: Some(MOCK_HOST_IP.to_owned()),
        pod_ip: Some(MOCK_POD_IP.to_owned()),
        start_time: Some(Time(now)),
        conditions: Some(vec![
            condition("Initialized"),
            condition("Ready"),
            condition("PodScheduled"),
        ]),
        container_statuses: Some(container_statuses),
        ..Default::default()
    }
}

fn with_status(pod: &Pod, status: PodStatus) -> Pod {
    let mut kube_pod = pod.as_kube_pod().clone();
    kube_pod.status = Some(status);
    Pod::from(kube_pod)
}

#[async_trait]
impl Provider for MockProvider {
    async fn create_pod(&self, pod: &Pod) -> anyhow::Result<()> {
        let key = pod.key()?;
        info!(%key, "mock provider creating pod");
        let running = {
            let mut pods = self.pods.write().await;
            if pods.contains_key(&key) {
                debug!(%key, "pod already running");
                return Ok(());
            }
            let running = with_status(pod, running_status(pod, Utc::now()));
            pods.insert(key, running.clone());
            running
        };
        self.report(&running).await;
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> anyhow::Result<()> {
        let key = pod.key()?;
        info!(%key, "mock provider updating pod");
        let updated = {
            let mut pods = self.pods.write().await;
            let previous = pods.get(&key).and_then(|p| p.status().cloned());
            let status = match previous {
                Some(status) => status,
                None => running_status(pod, Utc::now()),
            };
            let updated = with_status(pod, status);
            pods.insert(key, updated.clone());
            updated
        };
        self.report(&updated).await;
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod) -> anyhow::Result<()> {
        let key = pod.key()?;
        info!(%key, "mock provider deleting pod");
        match self.pods.write().await.remove(&key) {
            Some(_) => Ok(()),
            None => Err(ProviderError::PodNotFound {
                pod_name: pod.name().to_owned(),
            }
            .into()),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Pod> {
        self.stored(namespace, name).await
    }

    async fn get_pod_status(&self, namespace: &str, name: &str) -> anyhow::Result<PodStatus> {
        let pod = self.stored(namespace, name).await?;
        Ok(pod
            .status()
            .cloned()
            .unwrap_or_else(|| running_status(&pod, Utc::now())))
    }

    async fn get_pods(&self) -> anyhow::Result<Vec<Pod>> {
        Ok(self.pods.read().await.values().cloned().collect())
    }

    fn operating_system(&self) -> String {
        self.operating_system.clone()
    }

    async fn node_conditions(&self) -> anyhow::Result<Vec<NodeCondition>> {
        let now = Some(Time(Utc::now()));
        let condition = |type_: &str, status: &str, reason: &str, message: &str| NodeCondition {
            type_: type_.to_owned(),
            status: status.to_owned(),
            last_heartbeat_time: now.clone(),
            last_transition_time: now.clone(),
            reason: Some(reason.to_owned()),
            message: Some(message.to_owned()),
        };
        Ok(vec![
            condition("Ready", "True", "KubeletReady", "kubelet is ready."),
            condition(
                "OutOfDisk",
                "False",
                "KubeletHasSufficientDisk",
                "kubelet has sufficient disk space available",
            ),
            condition(
                "MemoryPressure",
                "False",
                "KubeletHasSufficientMemory",
                "kubelet has sufficient memory available",
            ),
            condition(
                "DiskPressure",
                "False",
                "KubeletHasNoDiskPressure",
                "kubelet has no disk pressure",
            ),
            condition(
                "NetworkUnavailable",
                "False",
                "RouteCreated",
                "RouteController created a route",
            ),
        ])
    }

    async fn node_addresses(&self) -> anyhow::Result<Vec<NodeAddress>> {
        Ok(self
            .internal_ip
            .iter()
            .map(|ip| NodeAddress {
                type_: "InternalIP".to_owned(),
                address: ip.to_string(),
            })
            .collect())
    }

    async fn node_daemon_endpoints(&self) -> anyhow::Result<NodeDaemonEndpoints> {
        Ok(NodeDaemonEndpoints {
            kubelet_endpoint: Some(DaemonEndpoint {
                port: i32::from(self.daemon_port),
            }),
        })
    }

    async fn capacity(&self) -> anyhow::Result<BTreeMap<String, Quantity>> {
        Ok(self.config.capacity())
    }

    async fn notify_pods(&self, notifier: StatusNotifier) {
        for pod in self.pods.read().await.values() {
            notifier.notify(pod.clone());
        }
        *self.notifier.lock().await = Some(notifier);
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        let count = self.pods.read().await.len();
        info!(pods = count, "mock provider shutting down");
        self.notifier.lock().await.take();
        Ok(())
    }
}

#[async_trait]
impl ContainerLogs for MockProvider {
    async fn get_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        sender: Sender,
    ) -> anyhow::Result<()> {
        let pod = self.container(namespace, pod, container).await?;
        let now = Utc::now();
        // One canned line a minute, the last one written now.
        let canned: String = (1..=CANNED_LOG_LINES)
            .map(|n| {
                let at = now - chrono::Duration::minutes((CANNED_LOG_LINES - n) as i64);
                format!(
                    "{} {} {}/{}: mock log line {}\n",
                    at.to_rfc3339(),
                    container,
                    pod.namespace(),
                    pod.name(),
                    n
                )
            })
            .collect();
        if sender.follow() {
            debug!("mock logs never grow, follow ends with the canned lines");
        }
        let sender = sender.without_follow();

        tokio::spawn(async move {
            let canned = std::io::Cursor::new(canned.into_bytes());
            if let Err(e) = log::stream(canned, sender).await {
                warn!(error = %e, "error streaming mock logs");
            }
        });
        Ok(())
    }
}

#[async_trait]
impl ContainerExec for MockProvider {
    async fn run_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        request: ExecRequest,
    ) -> anyhow::Result<Vec<String>> {
        let pod = self.container(namespace, pod, container).await?;
        let (program, args) = match request.command.split_first() {
            Some(split) => split,
            None => {
                return Err(ProviderError::InvalidInput("exec requires a command".to_owned()).into())
            }
        };
        info!(namespace, pod = pod.name(), container, %program, "mock exec");

        match program.as_str() {
            "env" => {
                let spec = pod.containers().iter().find(|c| c.name == container);
                let mut env: Vec<(String, String)> = match spec {
                    Some(c) => self
                        .resource_manager
                        .env_vars(c, &pod)
                        .await
                        .into_iter()
                        .collect(),
                    None => Vec::new(),
                };
                env.sort();
                Ok(env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect())
            }
            "cat" if args.is_empty() => Ok(request
                .stdin
                .map(|input| {
                    String::from_utf8_lossy(&input)
                        .lines()
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default()),
            _ => Ok(vec![request.command.join(" ")]),
        }
    }
}

#[async_trait]
impl StatsProvider for MockProvider {
    async fn get_stats_summary(&self) -> anyhow::Result<Summary> {
        let now = Utc::now();
        let pods = self.pods.read().await;
        let mut summary = Summary {
            node: NodeStats {
                node_name: self.node_name.clone(),
                start_time: Some(self.start_time),
                ..Default::default()
            },
            pods: Vec::with_capacity(pods.len()),
        };

        for (key, pod) in pods.iter() {
            let start_time = pod
                .as_kube_pod()
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0);
            let mut total_cores = 0u64;
            let mut total_bytes = 0u64;
            let containers = pod
                .containers()
                .iter()
                .map(|c| {
                    let cores = dummy_usage(key, &c.name, "cpu");
                    let bytes = dummy_usage(key, &c.name, "memory");
                    total_cores += cores;
                    total_bytes += bytes;
                    ContainerStats {
                        name: c.name.clone(),
                        start_time,
                        cpu: Some(cpu_stats(now, cores)),
                        memory: Some(memory_stats(now, bytes)),
                    }
                })
                .collect();
            summary.pods.push(PodStats {
                pod_ref: PodReference {
                    name: pod.name().to_owned(),
                    namespace: pod.namespace().to_owned(),
                    uid: pod.as_kube_pod().metadata.uid.clone().unwrap_or_default(),
                },
                start_time,
                containers,
                cpu: Some(cpu_stats(now, total_cores)),
                memory: Some(memory_stats(now, total_bytes)),
            });
        }
        Ok(summary)
    }
}

#[async_trait]
impl NodeConfigurer for MockProvider {
    async fn configure_node(&self, builder: &mut Builder) -> anyhow::Result<()> {
        builder.set_architecture(node_architecture());
        builder.add_label("node.kubernetes.io/instance-type", PROVIDER_NAME);
        Ok(())
    }
}

/// A stable per-container usage figure. It fits a `u32` so pod totals cannot
/// overflow.
fn dummy_usage(key: &PodKey, container: &str, resource: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    container.hash(&mut hasher);
    resource.hash(&mut hasher);
    hasher.finish() & u64::from(u32::MAX)
}

fn cpu_stats(time: DateTime<Utc>, usage_nano_cores: u64) -> CpuStats {
    CpuStats {
        time,
        usage_nano_cores: Some(usage_nano_cores),
        usage_core_nano_seconds: None,
    }
}

fn memory_stats(time: DateTime<Utc>, usage_bytes: u64) -> MemoryStats {
    MemoryStats {
        time,
        available_bytes: None,
        usage_bytes: Some(usage_bytes),
        working_set_bytes: None,
    }
}

fn node_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}
