//! `pod` is a collection of utilities surrounding the Kubernetes pod API.
mod cache;

pub use cache::PodCache;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Container as KubeContainer, Pod as KubePod, PodStatus, Volume as KubeVolume,
};
use thiserror::Error;

/// Phase of a pod that ran to completion without error.
pub const PHASE_SUCCEEDED: &str = "Succeeded";
/// Phase of a pod that ran to completion with an error.
pub const PHASE_FAILED: &str = "Failed";
/// Phase of a pod that has been accepted but is not running yet.
pub const PHASE_PENDING: &str = "Pending";
/// Phase of a pod with at least one running container.
pub const PHASE_RUNNING: &str = "Running";

/// A Kubernetes Pod
///
/// This is a new type around the k8s_openapi Pod definition
/// providing convenient accessor methods
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Pod(KubePod);

impl Pod {
    /// Construct a new Pod
    pub fn new(inner: KubePod) -> Self {
        Self(inner)
    }

    /// Get the name of the pod
    ///
    /// Returns an empty string for pods that have no name yet.
    pub fn name(&self) -> &str {
        self.0.metadata.name.as_deref().unwrap_or_default()
    }

    /// Get the pod's namespace
    ///
    /// Returns "default" if no namespace was explictily set
    pub fn namespace(&self) -> &str {
        self.0.metadata.namespace.as_deref().unwrap_or("default")
    }

    /// The key used to deduplicate work for this pod.
    pub fn key(&self) -> Result<PodKey, InvalidPodKey> {
        PodKey::new(self.namespace(), self.name())
    }

    /// Get the name of the node the pod is bound to
    pub fn node_name(&self) -> Option<&str> {
        self.0.spec.as_ref()?.node_name.as_deref()
    }

    /// Get the pod volumes
    pub fn volumes(&self) -> Option<&Vec<KubeVolume>> {
        let spec = self.0.spec.as_ref()?;
        spec.volumes.as_ref()
    }

    /// Get the pod's labels
    pub fn labels(&self) -> &BTreeMap<String, String> {
        self.0.metadata.labels.as_ref().unwrap_or(&EMPTY_MAP)
    }

    ///  Get the pod's annotations
    pub fn annotations(&self) -> &BTreeMap<String, String> {
        self.0.metadata.annotations.as_ref().unwrap_or(&EMPTY_MAP)
    }

    /// Get the deletionTimestamp if it exists
    pub fn deletion_timestamp(&self) -> Option<&DateTime<Utc>> {
        self.0.metadata.deletion_timestamp.as_ref().map(|t| &t.0)
    }

    /// Get the grace period the API server granted for deletion, if any
    pub fn deletion_grace_period_seconds(&self) -> Option<i64> {
        self.0.metadata.deletion_grace_period_seconds
    }

    /// Get the pod's restart policy, defaulting to `Always` like the API server does
    pub fn restart_policy(&self) -> &str {
        self.0
            .spec
            .as_ref()
            .and_then(|s| s.restart_policy.as_deref())
            .unwrap_or("Always")
    }

    /// Get a pod's containers
    pub fn containers(&self) -> &[KubeContainer] {
        self.0
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default()
    }

    /// Get a pod's init containers
    pub fn init_containers(&self) -> &[KubeContainer] {
        self.0
            .spec
            .as_ref()
            .and_then(|s| s.init_containers.as_deref())
            .unwrap_or_default()
    }

    /// Get the pod's status as last reported to the API
    pub fn status(&self) -> Option<&PodStatus> {
        self.0.status.as_ref()
    }

    /// Get the pod's phase
    pub fn phase(&self) -> Option<&str> {
        self.0.status.as_ref()?.phase.as_deref()
    }

    /// Indicates the pod ran to completion, successfully or not.
    pub fn is_terminal(&self) -> bool {
        matches!(self.phase(), Some(PHASE_SUCCEEDED) | Some(PHASE_FAILED))
    }

    /// Get the pod's host ip
    pub fn host_ip(&self) -> Option<&str> {
        let status = self.0.status.as_ref()?;
        status.host_ip.as_deref()
    }

    /// Get the pod's ip
    pub fn pod_ip(&self) -> Option<&str> {
        let status = self.0.status.as_ref()?;
        status.pod_ip.as_deref()
    }

    /// Compares everything but the status and server-managed bookkeeping.
    ///
    /// Used to tell status-only updates apart from changes that need
    /// reconciling.
    pub fn same_desired_state(&self, other: &Pod) -> bool {
        let mut left = self.0.metadata.clone();
        let mut right = other.0.metadata.clone();
        for meta in [&mut left, &mut right] {
            meta.resource_version = None;
            meta.managed_fields = None;
            meta.generation = None;
        }
        left == right && self.0.spec == other.0.spec
    }

    /// Turn the Pod into the Kubernetes API version of a Pod
    pub fn into_kube_pod(self) -> KubePod {
        self.0
    }

    /// Turn a reference to a Pod into a reference to the Kubernetes API version of a Pod
    pub fn as_kube_pod(&self) -> &KubePod {
        &self.0
    }
}

impl std::convert::From<KubePod> for Pod {
    fn from(api_pod: KubePod) -> Self {
        Self(api_pod)
    }
}

impl<'a> std::convert::From<&'a Pod> for &'a KubePod {
    fn from(pod: &'a Pod) -> Self {
        &pod.0
    }
}

impl std::convert::From<Pod> for KubePod {
    fn from(pod: Pod) -> Self {
        pod.0
    }
}

/// The `(namespace, name)` pair identifying a pod.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PodKey {
    namespace: String,
    name: String,
}

/// A pod key was requested for an empty namespace or name.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid pod key {0:?}: namespace and name must both be non-empty")]
pub struct InvalidPodKey(pub String);

impl PodKey {
    /// Build a key. Both parts must be non-empty.
    pub fn new(namespace: &str, name: &str) -> Result<Self, InvalidPodKey> {
        if namespace.is_empty() || name.is_empty() {
            return Err(InvalidPodKey(format!("{}/{}", namespace, name)));
        }
        Ok(PodKey {
            namespace: namespace.to_owned(),
            name: name.to_owned(),
        })
    }

    /// The key of an API pod.
    pub fn from_pod(pod: &Pod) -> Result<Self, InvalidPodKey> {
        pod.key()
    }

    /// Parses a `namespace/name` string.
    pub fn parse(s: &str) -> Result<Self, InvalidPodKey> {
        s.parse()
    }

    /// The pod's namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The pod's name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for PodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for PodKey {
    type Err = InvalidPodKey;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((namespace, name)) if !name.contains('/') => PodKey::new(namespace, name),
            _ => Err(InvalidPodKey(s.to_owned())),
        }
    }
}

lazy_static::lazy_static! {
    static ref EMPTY_MAP: BTreeMap<String, String> = BTreeMap::new();
}

#[cfg(test)]
mod test {
    use super::*;
    use k8s_openapi::api::core::v1::PodSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(resource_version: &str, image: &str) -> Pod {
        Pod::from(KubePod {
            metadata: ObjectMeta {
                name: Some("nginx".to_owned()),
                namespace: Some("default".to_owned()),
                resource_version: Some(resource_version.to_owned()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![KubeContainer {
                    name: "nginx".to_owned(),
                    image: Some(image.to_owned()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: None,
        })
    }

    #[test]
    fn keys_require_both_parts() {
        assert!(PodKey::new("default", "nginx").is_ok());
        assert!(PodKey::new("", "nginx").is_err());
        assert!(PodKey::new("default", "").is_err());
    }

    #[test]
    fn keys_display_and_parse() {
        let key = PodKey::new("kube-system", "coredns").unwrap();
        assert_eq!(key.to_string(), "kube-system/coredns");
        assert_eq!("kube-system/coredns".parse::<PodKey>().unwrap(), key);
        assert!("coredns".parse::<PodKey>().is_err());
        assert!("a/b/c".parse::<PodKey>().is_err());
    }

    #[test]
    fn namespace_defaults() {
        let pod = Pod::from(KubePod {
            metadata: ObjectMeta {
                name: Some("nginx".to_owned()),
                ..Default::default()
            },
            ..Default::default()
        });
        assert_eq!(pod.key().unwrap().to_string(), "default/nginx");
    }

    #[test]
    fn resource_version_is_not_desired_state() {
        assert!(pod("1", "nginx:1").same_desired_state(&pod("2", "nginx:1")));
        assert!(!pod("1", "nginx:1").same_desired_state(&pod("1", "nginx:2")));
    }
}
