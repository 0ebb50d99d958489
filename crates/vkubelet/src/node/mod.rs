//! `node` contains wrappers around the Kubernetes node API, containing ways to create and update
//! the node the virtual kubelet advertises.
mod controller;
pub mod lease;

pub use controller::{HeartbeatMode, NodeController};

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::{
    DaemonEndpoint, Node as KubeNode, NodeAddress, NodeCondition, NodeDaemonEndpoints, NodeSpec,
    NodeStatus, NodeSystemInfo, Taint,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::warn;

/// Version advertised as the node's kubelet version.
pub const KUBELET_VERSION: &str = concat!("vk-", env!("CARGO_PKG_VERSION"));

/// Defines the labels that will be applied to this node
///
/// User supplied labels are merged in unless they collide with a label managed here or sit in
/// the `kubernetes.io` namespace without being explicitly allowed.
pub fn node_labels_definition(
    node_name: &str,
    operating_system: &str,
    user_labels: &HashMap<String, String>,
    builder: &mut Builder,
) {
    let os = operating_system.to_lowercase();
    // Add mandatory static labels
    builder.add_label("type", "virtual-kubelet");
    builder.add_label("kubernetes.io/role", "agent");
    // add the mandatory labels that are dependent on injected values
    builder.add_label("kubernetes.io/hostname", node_name);
    builder.add_label("beta.kubernetes.io/os", &os);
    builder.add_label("kubernetes.io/os", &os);

    let k8s_namespace = "kubernetes.io";
    // namespaces managed by this method - do not allow user injection
    let managed_namespace_labels = [
        "beta.kubernetes.io/os",
        "kubernetes.io/hostname",
        "kubernetes.io/os",
        "kubernetes.io/role",
        "type",
    ];
    let allowed_k8s_namespace_labels = [
        "beta.kubernetes.io/instance-type",
        "failure-domain.beta.kubernetes.io/region",
        "failure-domain.beta.kubernetes.io/zone",
        "failure-domain.kubernetes.io/region",
        "failure-domain.kubernetes.io/zone",
        "kubernetes.io/instance-type",
    ];

    for (key, value) in user_labels.iter() {
        if managed_namespace_labels.contains(&key.as_str()) {
            warn!(label = %key, "user provided node label omitted, label is managed by the runtime");
        } else if key.contains(k8s_namespace)
            && !key.starts_with("kubelet.kubernetes.io")
            && !key.starts_with("node.kubernetes.io")
            && !allowed_k8s_namespace_labels.contains(&key.as_str())
        {
            warn!(label = %key, "user provided node label omitted, namespace violates constraints");
        } else {
            builder.add_label(key, value);
        }
    }
}

/// Builder for node definition.
#[derive(Clone, Debug)]
pub struct Builder {
    name: String,
    annotations: BTreeMap<String, String>,
    labels: BTreeMap<String, String>,
    taints: Vec<Taint>,
    architecture: String,
    operating_system: String,
    capacity: BTreeMap<String, Quantity>,
    daemon_endpoints: NodeDaemonEndpoints,
    conditions: Vec<NodeCondition>,
    addresses: Vec<NodeAddress>,
}

impl Builder {
    /// Create new builder with defaults.
    pub fn new() -> Self {
        Default::default()
    }

    /// Add an annotation for the node.
    pub fn add_annotation(&mut self, key: &str, value: &str) {
        self.annotations.insert(key.to_string(), value.to_string());
    }

    /// Add a label to the node.
    pub fn add_label(&mut self, key: &str, value: &str) {
        self.labels.insert(key.to_string(), value.to_string());
    }

    /// The labels set so far.
    pub fn labels(&self) -> &BTreeMap<String, String> {
        &self.labels
    }

    /// Set the name of the node.
    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    /// Add a taint to the node.
    pub fn add_taint(&mut self, effect: &str, key: &str, value: &str) {
        self.taints.push(Taint {
            effect: effect.to_string(),
            key: key.to_string(),
            value: Some(value.to_string()),
            time_added: None,
        });
    }

    /// Set the architecture of the node.
    pub fn set_architecture(&mut self, arch: &str) {
        self.architecture = arch.to_string();
    }

    /// Set the operating system of the node.
    pub fn set_operating_system(&mut self, os: &str) {
        self.operating_system = os.to_string();
    }

    /// Replace the capacity of the node. Allocatable always mirrors capacity.
    pub fn set_capacity(&mut self, capacity: BTreeMap<String, Quantity>) {
        self.capacity = capacity;
    }

    /// Set the daemon endpoints of the node.
    pub fn set_daemon_endpoints(&mut self, endpoints: NodeDaemonEndpoints) {
        self.daemon_endpoints = endpoints;
    }

    /// Add a fully formed condition of the node.
    pub fn push_condition(&mut self, condition: NodeCondition) {
        self.conditions.push(condition);
    }

    /// Add a address to the node.
    pub fn add_address(&mut self, type_: &str, address: &str) {
        self.addresses.push(NodeAddress {
            type_: type_.to_string(),
            address: address.to_string(),
        });
    }

    /// Add a fully formed address to the node.
    pub fn push_address(&mut self, address: NodeAddress) {
        self.addresses.push(address);
    }

    /// Whether any address has been added.
    pub fn has_addresses(&self) -> bool {
        !self.addresses.is_empty()
    }

    /// Build node definition from builder.
    pub fn build(self) -> KubeNode {
        let metadata = ObjectMeta {
            name: Some(self.name),
            annotations: Some(self.annotations),
            labels: Some(self.labels),
            ..Default::default()
        };

        let spec = NodeSpec {
            taints: Some(self.taints),
            ..Default::default()
        };

        let node_info = NodeSystemInfo {
            architecture: self.architecture,
            kubelet_version: KUBELET_VERSION.to_string(),
            operating_system: self.operating_system,
            ..Default::default()
        };

        let allocatable = self.capacity.clone();
        let status = NodeStatus {
            node_info: Some(node_info),
            capacity: Some(self.capacity),
            allocatable: Some(allocatable),
            daemon_endpoints: Some(self.daemon_endpoints),
            conditions: Some(self.conditions),
            addresses: Some(self.addresses),
            ..Default::default()
        };

        KubeNode {
            metadata,
            spec: Some(spec),
            status: Some(status),
        }
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder {
            name: "virtual-kubelet".to_string(),
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            taints: vec![],
            architecture: "amd64".to_string(),
            operating_system: "linux".to_string(),
            capacity: BTreeMap::new(),
            daemon_endpoints: NodeDaemonEndpoints {
                kubelet_endpoint: Some(DaemonEndpoint { port: 10250 }),
            },
            conditions: vec![],
            addresses: vec![],
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_node_labels_definition() {
        let mut node_labels = HashMap::new();
        node_labels.insert("foo".to_owned(), "custom".to_owned());
        node_labels.insert(
            "kubelet.kubernetes.io/allowed-prefix".to_owned(),
            "prefix".to_owned(),
        );
        node_labels.insert(
            "not-allowed.kubernetes.io".to_owned(),
            "not-allowed".to_owned(),
        );
        node_labels.insert(
            "kubernetes.io/instance-type".to_owned(),
            "allowed".to_owned(),
        );
        node_labels.insert("beta.kubernetes.io/os".to_owned(), "managed".to_owned());
        node_labels.insert("type".to_owned(), "managed".to_owned());

        let mut builder = Builder::new();
        node_labels_definition("vk", "Linux", &node_labels, &mut builder);

        let result = builder.labels();

        assert_eq!(result["type"], "virtual-kubelet");
        assert_eq!(result["kubernetes.io/role"], "agent");
        assert_eq!(result["kubernetes.io/hostname"], "vk");
        assert_eq!(result["kubernetes.io/os"], "linux");
        assert_eq!(result["beta.kubernetes.io/os"], "linux");
        assert!(result.contains_key("foo"));
        assert!(result.contains_key("kubelet.kubernetes.io/allowed-prefix"));
        assert!(!result.contains_key("not-allowed.kubernetes.io"));
        assert!(result.contains_key("kubernetes.io/instance-type"));
    }

    #[test]
    fn allocatable_mirrors_capacity() {
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_owned(), Quantity("4".to_owned()));
        let mut builder = Builder::new();
        builder.set_capacity(capacity);
        let status = builder.build().status.unwrap();
        assert_eq!(status.allocatable, status.capacity);
        assert_eq!(status.capacity.unwrap()["cpu"], Quantity("4".to_owned()));
    }

    #[test]
    fn kubelet_version_identifies_the_core() {
        let node = Builder::new().build();
        let info = node.status.unwrap().node_info.unwrap();
        assert!(info.kubelet_version.starts_with("vk-"));
    }
}
