//! In-memory fakes shared by the unit tests.
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{
    Container, DaemonEndpoint, Node as KubeNode, NodeAddress, NodeCondition,
    NodeDaemonEndpoints, NodeStatus, Pod as KubePod, PodSpec, PodStatus,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::error::ErrorResponse;
use kube_runtime::watcher::Event;
use tokio::sync::mpsc;

use crate::client::{NodeClient, PodClient};
use crate::notifier::StatusNotifier;
use crate::pod::{Pod, PodKey, PHASE_RUNNING};
use crate::provider::{Provider, ProviderError};

/// A pod bound to `node` running a single nginx container.
pub(crate) fn kube_pod(namespace: &str, name: &str, node: &str) -> KubePod {
    KubePod {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(namespace.to_owned()),
            resource_version: Some("1".to_owned()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_owned()),
            containers: vec![Container {
                name: "nginx".to_owned(),
                image: Some("nginx:1".to_owned()),
                ..Default::default()
            }],
            ..Default::default()
        }),
        status: None,
    }
}

/// An API server error with the given status code.
pub(crate) fn api_error(code: u16) -> anyhow::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_owned(),
        message: format!("fake error {}", code),
        reason: "Fake".to_owned(),
        code,
    })
    .into()
}

/// A mutating call a provider received.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Call {
    Create(String),
    Update(String),
    Delete(String),
}

/// Provider that keeps pods in memory and records every mutating call.
#[derive(Default)]
pub(crate) struct RecordingProvider {
    pods: Mutex<HashMap<PodKey, Pod>>,
    calls: Mutex<Vec<Call>>,
    create_failures: Mutex<VecDeque<ProviderError>>,
    create_delay: Duration,
    creates_in_flight: AtomicUsize,
    max_creates_in_flight: AtomicUsize,
    fail_list: AtomicBool,
    fail_node: AtomicBool,
    ready: Mutex<Option<bool>>,
    notifier: Mutex<Option<StatusNotifier>>,
    notify_calls: AtomicUsize,
    shutdown_calls: AtomicUsize,
}

impl RecordingProvider {
    pub(crate) fn with_create_delay(mut self, delay: Duration) -> Self {
        self.create_delay = delay;
        self
    }

    pub(crate) fn insert(&self, pod: Pod) {
        if let Ok(key) = pod.key() {
            self.pods.lock().unwrap().insert(key, pod);
        }
    }

    /// Drops a pod without recording a call, as if the backend lost it.
    pub(crate) fn forget(&self, key: &PodKey) {
        self.pods.lock().unwrap().remove(key);
    }

    pub(crate) fn has_pod(&self, key: &PodKey) -> bool {
        self.pods.lock().unwrap().contains_key(key)
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn fail_next_create(&self, error: ProviderError) {
        self.create_failures.lock().unwrap().push_back(error);
    }

    pub(crate) fn fail_list(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_node(&self, fail: bool) {
        self.fail_node.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn set_ready(&self, ready: bool) {
        *self.ready.lock().unwrap() = Some(ready);
    }

    pub(crate) fn max_concurrent_creates(&self) -> usize {
        self.max_creates_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn notify_calls(&self) -> usize {
        self.notify_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdown_calls(&self) -> usize {
        self.shutdown_calls.load(Ordering::SeqCst)
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn check_node(&self) -> anyhow::Result<()> {
        if self.fail_node.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("backend unreachable".to_owned()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl Provider for RecordingProvider {
    async fn create_pod(&self, pod: &Pod) -> anyhow::Result<()> {
        let key = pod.key()?;
        self.record(Call::Create(key.to_string()));

        let now = self.creates_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_creates_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.create_delay).await;
        self.creates_in_flight.fetch_sub(1, Ordering::SeqCst);

        if let Some(e) = self.create_failures.lock().unwrap().pop_front() {
            return Err(e.into());
        }

        let mut running = pod.clone().into_kube_pod();
        running.status = Some(PodStatus {
            phase: Some(PHASE_RUNNING.to_owned()),
            ..Default::default()
        });
        let running = Pod::from(running);
        self.pods.lock().unwrap().insert(key, running.clone());
        if let Some(notifier) = self.notifier.lock().unwrap().as_ref() {
            notifier.notify(running);
        }
        Ok(())
    }

    async fn update_pod(&self, pod: &Pod) -> anyhow::Result<()> {
        let key = pod.key()?;
        self.record(Call::Update(key.to_string()));
        self.pods.lock().unwrap().insert(key, pod.clone());
        Ok(())
    }

    async fn delete_pod(&self, pod: &Pod) -> anyhow::Result<()> {
        let key = pod.key()?;
        self.record(Call::Delete(key.to_string()));
        match self.pods.lock().unwrap().remove(&key) {
            Some(_) => Ok(()),
            None => Err(ProviderError::PodNotFound {
                pod_name: key.to_string(),
            }
            .into()),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> anyhow::Result<Pod> {
        let key = PodKey::new(namespace, name)?;
        self.pods.lock().unwrap().get(&key).cloned().ok_or_else(|| {
            ProviderError::PodNotFound {
                pod_name: key.to_string(),
            }
            .into()
        })
    }

    async fn get_pod_status(&self, namespace: &str, name: &str) -> anyhow::Result<PodStatus> {
        let pod = self.get_pod(namespace, name).await?;
        Ok(pod.status().cloned().unwrap_or_default())
    }

    async fn get_pods(&self) -> anyhow::Result<Vec<Pod>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(ProviderError::Transient("list failed".to_owned()).into());
        }
        Ok(self.pods.lock().unwrap().values().cloned().collect())
    }

    fn operating_system(&self) -> String {
        "Linux".to_owned()
    }

    async fn node_conditions(&self) -> anyhow::Result<Vec<NodeCondition>> {
        self.check_node()?;
        let ready = self.ready.lock().unwrap().unwrap_or(true);
        Ok(vec![NodeCondition {
            type_: "Ready".to_owned(),
            status: if ready { "True" } else { "False" }.to_owned(),
            reason: Some("KubeletReady".to_owned()),
            message: Some("provider is ready".to_owned()),
            ..Default::default()
        }])
    }

    async fn node_addresses(&self) -> anyhow::Result<Vec<NodeAddress>> {
        self.check_node()?;
        Ok(vec![])
    }

    async fn node_daemon_endpoints(&self) -> anyhow::Result<NodeDaemonEndpoints> {
        Ok(NodeDaemonEndpoints {
            kubelet_endpoint: Some(DaemonEndpoint { port: 10250 }),
        })
    }

    async fn capacity(&self) -> anyhow::Result<BTreeMap<String, Quantity>> {
        self.check_node()?;
        Ok(vec![
            ("cpu".to_owned(), Quantity("4".to_owned())),
            ("memory".to_owned(), Quantity("8Gi".to_owned())),
            ("pods".to_owned(), Quantity("110".to_owned())),
        ]
        .into_iter()
        .collect())
    }

    async fn notify_pods(&self, notifier: StatusNotifier) {
        self.notify_calls.fetch_add(1, Ordering::SeqCst);
        *self.notifier.lock().unwrap() = Some(notifier);
    }

    async fn shutdown(&self) -> anyhow::Result<()> {
        self.shutdown_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type WatchItem = anyhow::Result<Event<KubePod>>;

/// Pod client whose watch is fed by the test and which records writes.
pub(crate) struct FakePodClient {
    watch_tx: mpsc::UnboundedSender<WatchItem>,
    watch_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WatchItem>>>,
    watch_count: AtomicUsize,
    status_updates: Mutex<Vec<Pod>>,
    deletes: Mutex<Vec<String>>,
}

impl Default for FakePodClient {
    fn default() -> Self {
        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        FakePodClient {
            watch_tx,
            watch_rx: Arc::new(tokio::sync::Mutex::new(watch_rx)),
            watch_count: AtomicUsize::new(0),
            status_updates: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
        }
    }
}

impl FakePodClient {
    pub(crate) async fn push_watch_event(&self, item: WatchItem) {
        let _ = self.watch_tx.send(item);
    }

    pub(crate) fn watch_count(&self) -> usize {
        self.watch_count.load(Ordering::SeqCst)
    }

    pub(crate) fn status_updates(&self) -> Vec<Pod> {
        self.status_updates.lock().unwrap().clone()
    }

    pub(crate) fn deletes(&self) -> Vec<String> {
        self.deletes.lock().unwrap().clone()
    }
}

#[async_trait]
impl PodClient for FakePodClient {
    fn watch(&self, _node_name: &str, _namespace: Option<&str>) -> BoxStream<'static, WatchItem> {
        self.watch_count.fetch_add(1, Ordering::SeqCst);
        futures::stream::unfold(self.watch_rx.clone(), |rx| async move {
            let item = rx.lock().await.recv().await;
            item.map(|item| (item, rx))
        })
        .boxed()
    }

    async fn update_status(&self, pod: &Pod) -> anyhow::Result<()> {
        self.status_updates.lock().unwrap().push(pod.clone());
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

/// Node client holding one node and one lease in memory.
#[derive(Default)]
pub(crate) struct FakeNodeClient {
    node: Mutex<Option<KubeNode>>,
    lease: Mutex<Option<Lease>>,
    leases_unsupported: AtomicBool,
    fail_all: AtomicBool,
    status_patches: Mutex<Vec<NodeStatus>>,
    lease_renewals: Mutex<Vec<LeaseSpec>>,
    node_creates: AtomicUsize,
}

impl FakeNodeClient {
    pub(crate) fn without_leases(self) -> Self {
        self.leases_unsupported.store(true, Ordering::SeqCst);
        self
    }

    pub(crate) fn with_node(self, node: KubeNode) -> Self {
        *self.node.lock().unwrap() = Some(node);
        self
    }

    pub(crate) fn with_lease(self, lease: Lease) -> Self {
        *self.lease.lock().unwrap() = Some(lease);
        self
    }

    pub(crate) fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn drop_lease(&self) {
        *self.lease.lock().unwrap() = None;
    }

    pub(crate) fn node(&self) -> Option<KubeNode> {
        self.node.lock().unwrap().clone()
    }

    pub(crate) fn lease(&self) -> Option<Lease> {
        self.lease.lock().unwrap().clone()
    }

    pub(crate) fn status_patches(&self) -> Vec<NodeStatus> {
        self.status_patches.lock().unwrap().clone()
    }

    pub(crate) fn lease_renewals(&self) -> Vec<LeaseSpec> {
        self.lease_renewals.lock().unwrap().clone()
    }

    pub(crate) fn node_creates(&self) -> usize {
        self.node_creates.load(Ordering::SeqCst)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(api_error(503));
        }
        Ok(())
    }
}

#[async_trait]
impl NodeClient for FakeNodeClient {
    async fn get_node(&self, _name: &str) -> anyhow::Result<Option<KubeNode>> {
        self.check()?;
        Ok(self.node())
    }

    async fn create_node(&self, node: &KubeNode) -> anyhow::Result<KubeNode> {
        self.check()?;
        let mut node = node.clone();
        node.metadata.uid = Some("node-uid".to_owned());
        *self.node.lock().unwrap() = Some(node.clone());
        self.node_creates.fetch_add(1, Ordering::SeqCst);
        Ok(node)
    }

    async fn patch_node_status(
        &self,
        _name: &str,
        status: &NodeStatus,
    ) -> anyhow::Result<KubeNode> {
        self.check()?;
        self.status_patches.lock().unwrap().push(status.clone());
        let mut guard = self.node.lock().unwrap();
        let node = guard.get_or_insert_with(Default::default);
        node.status = Some(status.clone());
        Ok(node.clone())
    }

    async fn create_lease(&self, lease: &Lease) -> anyhow::Result<Lease> {
        self.check()?;
        if self.leases_unsupported.load(Ordering::SeqCst) {
            return Err(api_error(404));
        }
        let mut guard = self.lease.lock().unwrap();
        if guard.is_some() {
            return Err(api_error(409));
        }
        *guard = Some(lease.clone());
        Ok(lease.clone())
    }

    async fn patch_lease(&self, _name: &str, spec: &LeaseSpec) -> anyhow::Result<Lease> {
        self.check()?;
        let mut guard = self.lease.lock().unwrap();
        match guard.as_mut() {
            Some(lease) => {
                lease.spec = Some(spec.clone());
                self.lease_renewals.lock().unwrap().push(spec.clone());
                Ok(lease.clone())
            }
            None => Err(api_error(404)),
        }
    }
}
