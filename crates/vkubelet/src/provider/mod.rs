//! Traits and types needed to create backend providers for a virtual kubelet.
//!
//! A provider is split into a required core, [`Provider`], and a set of
//! optional capabilities ([`ContainerLogs`], [`ContainerExec`],
//! [`StatsProvider`], [`NodeConfigurer`]). The provider constructor announces
//! which capabilities it has by returning a [`Capabilities`] record alongside
//! the core implementation, bundled as a [`BuiltProvider`].
pub mod registry;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeDaemonEndpoints, PodStatus};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

use crate::log::Sender;
use crate::node::Builder;
use crate::notifier::StatusNotifier;
use crate::pod::Pod;
use crate::stats::Summary;

/// A back-end for a virtual kubelet.
///
/// The primary responsibility of a Provider is to run the pods assigned to
/// the node (or hand them to an external executor) and report back on them.
/// Every method must be safe to call concurrently for different pods. Calls
/// for the same pod are serialized by the core.
///
/// Missing pods are reported with [`ProviderError::PodNotFound`]. Other
/// failures should be [`ProviderError::Permanent`] or
/// [`ProviderError::InvalidInput`] when retrying cannot help; anything else is
/// retried with backoff.
///
/// **Note**: this trait is defined using [async-trait](https://crates.io/crates/async-trait) which
/// allows for the use of async methods on traits.
///
/// # Example
/// ```rust
/// use async_trait::async_trait;
/// use k8s_openapi::api::core::v1::{NodeAddress, NodeCondition, NodeDaemonEndpoints, PodStatus};
/// use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
/// use std::collections::BTreeMap;
/// use vkubelet::notifier::StatusNotifier;
/// use vkubelet::pod::Pod;
/// use vkubelet::provider::Provider;
///
/// struct MyProvider;
///
/// #[async_trait]
/// impl Provider for MyProvider {
///     async fn create_pod(&self, pod: &Pod) -> anyhow::Result<()> {
///         todo!("Implement Provider::create_pod")
///     }
///
///     // Implement the rest of the methods using `async` for the ones that return futures ...
///     # async fn update_pod(&self, pod: &Pod) -> anyhow::Result<()> { todo!() }
///     # async fn delete_pod(&self, pod: &Pod) -> anyhow::Result<()> { todo!() }
///     # async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Pod> { todo!() }
///     # async fn get_pod_status(&self, namespace: &str, name: &str) -> anyhow::Result<PodStatus> { todo!() }
///     # async fn get_pods(&self) -> anyhow::Result<Vec<Pod>> { todo!() }
///     # fn operating_system(&self) -> String { todo!() }
///     # async fn node_conditions(&self) -> anyhow::Result<Vec<NodeCondition>> { todo!() }
///     # async fn node_addresses(&self) -> anyhow::Result<Vec<NodeAddress>> { todo!() }
///     # async fn node_daemon_endpoints(&self) -> anyhow::Result<NodeDaemonEndpoints> { todo!() }
///     # async fn capacity(&self) -> anyhow::Result<BTreeMap<String, Quantity>> { todo!() }
///     # async fn notify_pods(&self, notifier: StatusNotifier) { todo!() }
/// }
/// ```
#[async_trait]
pub trait Provider: Send + Sync {
    /// Given a Pod definition, start running the workload.
    ///
    /// Must succeed without side effects if the pod is already running.
    async fn create_pod(&self, pod: &Pod) -> anyhow::Result<()>;

    /// Given an updated Pod definition, update the running workload.
    ///
    /// Only called when [`Provider::pod_differs`] reports a difference and the
    /// provider advertised in-place update support.
    async fn update_pod(&self, pod: &Pod) -> anyhow::Result<()>;

    /// Stop and remove the workload. Returning `PodNotFound` is treated as
    /// success.
    async fn delete_pod(&self, pod: &Pod) -> anyhow::Result<()>;

    /// The pod as the provider knows it, including its status.
    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Pod>;

    /// The status of a pod as the provider knows it.
    async fn get_pod_status(&self, namespace: &str, name: &str) -> anyhow::Result<PodStatus>;

    /// Every pod the provider believes it runs for this node.
    async fn get_pods(&self) -> anyhow::Result<Vec<Pod>>;

    /// The operating system the provider runs pods on, e.g. `Linux`.
    fn operating_system(&self) -> String;

    /// Conditions to advertise on the node.
    async fn node_conditions(&self) -> anyhow::Result<Vec<NodeCondition>>;

    /// Addresses to advertise on the node.
    async fn node_addresses(&self) -> anyhow::Result<Vec<NodeAddress>>;

    /// Daemon endpoints to advertise on the node.
    async fn node_daemon_endpoints(&self) -> anyhow::Result<NodeDaemonEndpoints>;

    /// Resources the node offers, e.g. `cpu`, `memory`, `pods`.
    async fn capacity(&self) -> anyhow::Result<BTreeMap<String, Quantity>>;

    /// Hands the provider the channel it reports every later pod status
    /// change on. Called once, after the initial pod list has been synced.
    async fn notify_pods(&self, notifier: StatusNotifier);

    /// Whether the provider's view of a pod has drifted from the desired one.
    ///
    /// Providers often return a sparsely populated spec, so the default only
    /// looks at fields that are mutable on a running pod. Providers that
    /// honor a different set should override this.
    fn pod_differs(&self, desired: &Pod, observed: &Pod) -> bool {
        default_pod_differs(desired, observed)
    }

    /// Releases whatever the provider holds. Called once on shutdown.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Compares container images and the mutable pod fields.
pub fn default_pod_differs(desired: &Pod, observed: &Pod) -> bool {
    let images = |pod: &Pod| {
        pod.containers()
            .iter()
            .chain(pod.init_containers())
            .map(|c| (c.name.clone(), c.image.clone()))
            .collect::<Vec<_>>()
    };
    let mutable = |pod: &Pod| {
        pod.as_kube_pod()
            .spec
            .as_ref()
            .map(|s| (s.active_deadline_seconds, s.tolerations.clone()))
    };

    images(desired) != images(observed)
        || mutable(desired) != mutable(observed)
        || desired.labels() != observed.labels()
        || desired.annotations() != observed.annotations()
}

/// Streams container logs.
#[async_trait]
pub trait ContainerLogs: Send + Sync {
    /// Writes the logs of a container to `sender`, honoring its options.
    async fn get_container_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        sender: Sender,
    ) -> anyhow::Result<()>;
}

/// What to run for an exec request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecRequest {
    /// The command and its arguments.
    pub command: Vec<String>,
    /// Data to feed to the command's standard input.
    pub stdin: Option<Vec<u8>>,
    /// Whether a terminal was requested.
    pub tty: bool,
}

/// Runs commands inside containers.
#[async_trait]
pub trait ContainerExec: Send + Sync {
    /// Runs a command in a container and returns its output lines.
    async fn run_in_container(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
        request: ExecRequest,
    ) -> anyhow::Result<Vec<String>>;
}

/// Reports pod metrics.
#[async_trait]
pub trait StatsProvider: Send + Sync {
    /// A summary of node and pod resource usage.
    async fn get_stats_summary(&self) -> anyhow::Result<Summary>;
}

/// Customizes the node before it is published.
#[async_trait]
pub trait NodeConfigurer: Send + Sync {
    /// Allows the provider to populate node information.
    async fn configure_node(&self, builder: &mut Builder) -> anyhow::Result<()>;
}

/// Which optional operations a provider supports.
#[derive(Clone)]
pub struct Capabilities {
    logs: Option<Arc<dyn ContainerLogs>>,
    exec: Option<Arc<dyn ContainerExec>>,
    stats: Option<Arc<dyn StatsProvider>>,
    node_configurer: Option<Arc<dyn NodeConfigurer>>,
    update: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities")
            .field("logs", &self.supports_logs())
            .field("exec", &self.supports_exec())
            .field("stats", &self.supports_stats())
            .field("node_configurer", &self.node_configurer.is_some())
            .field("update", &self.update)
            .finish()
    }
}

impl Capabilities {
    /// No optional operations, in-place update supported.
    pub fn new() -> Self {
        Capabilities {
            logs: None,
            exec: None,
            stats: None,
            node_configurer: None,
            update: true,
        }
    }

    /// Enables container logs.
    pub fn with_logs(mut self, logs: Arc<dyn ContainerLogs>) -> Self {
        self.logs = Some(logs);
        self
    }

    /// Enables exec.
    pub fn with_exec(mut self, exec: Arc<dyn ContainerExec>) -> Self {
        self.exec = Some(exec);
        self
    }

    /// Enables the stats summary.
    pub fn with_stats(mut self, stats: Arc<dyn StatsProvider>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Registers a hook that customizes the node before publication.
    pub fn with_node_configurer(mut self, configurer: Arc<dyn NodeConfigurer>) -> Self {
        self.node_configurer = Some(configurer);
        self
    }

    /// Declares whether [`Provider::update_pod`] applies changes in place.
    pub fn with_update(mut self, supported: bool) -> Self {
        self.update = supported;
        self
    }

    /// The logs capability, if any.
    pub fn logs(&self) -> Option<&Arc<dyn ContainerLogs>> {
        self.logs.as_ref()
    }

    /// The exec capability, if any.
    pub fn exec(&self) -> Option<&Arc<dyn ContainerExec>> {
        self.exec.as_ref()
    }

    /// The stats capability, if any.
    pub fn stats(&self) -> Option<&Arc<dyn StatsProvider>> {
        self.stats.as_ref()
    }

    /// The node configuration hook, if any.
    pub fn node_configurer(&self) -> Option<&Arc<dyn NodeConfigurer>> {
        self.node_configurer.as_ref()
    }

    /// Whether container logs are available.
    pub fn supports_logs(&self) -> bool {
        self.logs.is_some()
    }

    /// Whether exec is available.
    pub fn supports_exec(&self) -> bool {
        self.exec.is_some()
    }

    /// Whether the stats summary is available.
    pub fn supports_stats(&self) -> bool {
        self.stats.is_some()
    }

    /// Whether pods can be updated in place.
    pub fn supports_update(&self) -> bool {
        self.update
    }
}

/// What a provider constructor hands back.
#[derive(Clone)]
pub struct BuiltProvider {
    /// The required operations.
    pub provider: Arc<dyn Provider>,
    /// The optional operations.
    pub capabilities: Capabilities,
}

impl BuiltProvider {
    /// Bundles a provider with its capabilities.
    pub fn new(provider: Arc<dyn Provider>, capabilities: Capabilities) -> Self {
        BuiltProvider {
            provider,
            capabilities,
        }
    }
}

impl std::fmt::Debug for BuiltProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltProvider").finish_non_exhaustive()
    }
}

/// A Provider error
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Pod was not found
    #[error("cannot find pod {}", pod_name)]
    PodNotFound {
        /// The pod's name
        pod_name: String,
    },
    /// Container was not found
    #[error("cannot find container {} in pod {}", container_name, pod_name)]
    ContainerNotFound {
        /// The container's pod's name
        pod_name: String,
        /// The container's name
        container_name: String,
    },
    /// The request can never be satisfied as given.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The backend refused the request and will keep refusing it.
    #[error("{0}")]
    Permanent(String),
    /// The backend could not serve the request right now.
    #[error("{0}")]
    Transient(String),
}

/// A specific operation is not implemented
#[derive(Error, Debug)]
#[error("Operation not supported")]
pub struct NotImplementedError;
