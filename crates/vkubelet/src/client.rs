//! The cluster API as the core sees it.
//!
//! Components talk to the API server through [`PodClient`] and [`NodeClient`]
//! so they can be driven by in-memory fakes. [`KubeClient`] implements both on
//! top of a [`kube::Client`].
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{Node as KubeNode, NodeStatus, Pod as KubePod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube_runtime::watcher;
use tracing::debug;

use crate::error::is_not_found;
use crate::node::lease::LEASE_NAMESPACE;
use crate::pod::Pod;

/// Pod operations against the API server.
#[async_trait]
pub trait PodClient: Send + Sync {
    /// A self-restarting watch of the pods bound to `node_name`, optionally
    /// limited to one namespace.
    fn watch(
        &self,
        node_name: &str,
        namespace: Option<&str>,
    ) -> BoxStream<'static, anyhow::Result<watcher::Event<KubePod>>>;

    /// Writes the status of `pod`.
    async fn update_status(&self, pod: &Pod) -> anyhow::Result<()>;

    /// Deletes a pod object without waiting for a grace period. A pod that is
    /// already gone is not an error.
    async fn delete(&self, namespace: &str, name: &str) -> anyhow::Result<()>;
}

/// Node and lease operations against the API server.
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetches a node, `None` if it does not exist.
    async fn get_node(&self, name: &str) -> anyhow::Result<Option<KubeNode>>;

    /// Creates a node.
    async fn create_node(&self, node: &KubeNode) -> anyhow::Result<KubeNode>;

    /// Replaces the status of a node.
    async fn patch_node_status(&self, name: &str, status: &NodeStatus)
        -> anyhow::Result<KubeNode>;

    /// Creates the node's lease.
    async fn create_lease(&self, lease: &Lease) -> anyhow::Result<Lease>;

    /// Updates the spec of the node's lease.
    async fn patch_lease(&self, name: &str, spec: &LeaseSpec) -> anyhow::Result<Lease>;
}

/// [`PodClient`] and [`NodeClient`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeClient {
    client: kube::Client,
}

impl KubeClient {
    /// Wraps a client.
    pub fn new(client: kube::Client) -> Self {
        KubeClient { client }
    }
}

#[async_trait]
impl PodClient for KubeClient {
    fn watch(
        &self,
        node_name: &str,
        namespace: Option<&str>,
    ) -> BoxStream<'static, anyhow::Result<watcher::Event<KubePod>>> {
        let api: Api<KubePod> = match namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        };
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        watcher(api, params).map_err(anyhow::Error::from).boxed()
    }

    async fn update_status(&self, pod: &Pod) -> anyhow::Result<()> {
        let api: Api<KubePod> = Api::namespaced(self.client.clone(), pod.namespace());
        let patch = serde_json::json!({ "status": pod.status() });
        api.patch_status(pod.name(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        let api: Api<KubePod> = Api::namespaced(self.client.clone(), namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(0),
            ..Default::default()
        };
        match api.delete(name, &params).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let e = anyhow::Error::from(e);
                if is_not_found(&e) {
                    debug!(namespace, name, "pod already deleted");
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

#[async_trait]
impl NodeClient for KubeClient {
    async fn get_node(&self, name: &str) -> anyhow::Result<Option<KubeNode>> {
        let api: Api<KubeNode> = Api::all(self.client.clone());
        match api.get(name).await {
            Ok(node) => Ok(Some(node)),
            Err(e) => {
                let e = anyhow::Error::from(e);
                if is_not_found(&e) {
                    Ok(None)
                } else {
                    Err(e)
                }
            }
        }
    }

    async fn create_node(&self, node: &KubeNode) -> anyhow::Result<KubeNode> {
        let api: Api<KubeNode> = Api::all(self.client.clone());
        Ok(api.create(&PostParams::default(), node).await?)
    }

    async fn patch_node_status(
        &self,
        name: &str,
        status: &NodeStatus,
    ) -> anyhow::Result<KubeNode> {
        let api: Api<KubeNode> = Api::all(self.client.clone());
        let patch = serde_json::json!({ "status": status });
        Ok(api
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }

    async fn create_lease(&self, lease: &Lease) -> anyhow::Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), LEASE_NAMESPACE);
        Ok(api.create(&PostParams::default(), lease).await?)
    }

    async fn patch_lease(&self, name: &str, spec: &LeaseSpec) -> anyhow::Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), LEASE_NAMESPACE);
        let patch = serde_json::json!({ "spec": spec });
        Ok(api
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?)
    }
}
