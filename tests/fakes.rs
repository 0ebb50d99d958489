//! An in-memory cluster for driving a virtual kubelet without an API server.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{Node, NodeStatus, Pod as KubePod};
use kube::error::ErrorResponse;
use kube_runtime::watcher;
use tokio::sync::mpsc;
use vkubelet::client::{NodeClient, PodClient};
use vkubelet::pod::Pod;

type WatchItem = anyhow::Result<watcher::Event<KubePod>>;

/// Pods, one node and no lease support.
pub struct FakeCluster {
    watch_tx: mpsc::UnboundedSender<WatchItem>,
    watch_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WatchItem>>>,
    statuses: Mutex<Vec<Pod>>,
    deletes: Mutex<Vec<String>>,
    node: Mutex<Option<Node>>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        FakeCluster {
            watch_tx,
            watch_rx: Arc::new(tokio::sync::Mutex::new(watch_rx)),
            statuses: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            node: Mutex::new(None),
        }
    }
}

impl FakeCluster {
    pub fn send(&self, event: watcher::Event<KubePod>) {
        let _ = self.watch_tx.send(Ok(event));
    }

    pub fn statuses(&self) -> Vec<Pod> {
        self.statuses.lock().unwrap().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }

    pub fn node(&self) -> Option<Node> {
        self.node.lock().unwrap().clone()
    }
}

fn not_found() -> anyhow::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_owned(),
        message: "the server could not find the requested resource".to_owned(),
        reason: "NotFound".to_owned(),
        code: 404,
    })
    .into()
}

#[async_trait]
impl PodClient for FakeCluster {
    fn watch(&self, _node_name: &str, _namespace: Option<&str>) -> BoxStream<'static, WatchItem> {
        futures::stream::unfold(self.watch_rx.clone(), |rx| async move {
            let item = rx.lock().await.recv().await;
            item.map(|item| (item, rx))
        })
        .boxed()
    }

    async fn update_status(&self, pod: &Pod) -> anyhow::Result<()> {
        self.statuses.lock().unwrap().push(pod.clone());
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> anyhow::Result<()> {
        self.deletes
            .lock()
            .unwrap()
            .push(format!("{}/{}", namespace, name));
        Ok(())
    }
}

#[async_trait]
impl NodeClient for FakeCluster {
    async fn get_node(&self, _name: &str) -> anyhow::Result<Option<Node>> {
        Ok(self.node())
    }

    async fn create_node(&self, node: &Node) -> anyhow::Result<Node> {
        *self.node.lock().unwrap() = Some(node.clone());
        Ok(node.clone())
    }

    async fn patch_node_status(&self, _name: &str, status: &NodeStatus) -> anyhow::Result<Node> {
        let mut node = self.node.lock().unwrap();
        let node = node.as_mut().ok_or_else(not_found)?;
        node.status = Some(status.clone());
        Ok(node.clone())
    }

    async fn create_lease(&self, _lease: &Lease) -> anyhow::Result<Lease> {
        Err(not_found())
    }

    async fn patch_lease(&self, _name: &str, _spec: &LeaseSpec) -> anyhow::Result<Lease> {
        Err(not_found())
    }
}
