use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Node as KubeNode, NodeCondition, NodeStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::lease::{lease_definition, lease_spec};
use super::{node_labels_definition, Builder};
use crate::client::NodeClient;
use crate::config::{Config, TaintConfig};
use crate::error::{is_already_exists, is_not_found};
use crate::provider::{Capabilities, Provider};

const READY: &str = "Ready";

/// How the node reports liveness.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeartbeatMode {
    /// Every tick rewrites the node status.
    Status,
    /// Every tick renews the node lease. The status is only rewritten when it
    /// changes.
    Lease,
}

/// Publishes the node and keeps it alive.
///
/// The controller is the only writer of the node object. It registers the
/// node on startup, probes whether the cluster accepts a node lease, and then
/// heartbeats on a ticker until cancelled. On the way out it reports the node
/// NotReady.
pub struct NodeController {
    node_name: String,
    internal_ip: Option<IpAddr>,
    node_labels: HashMap<String, String>,
    taint: Option<TaintConfig>,
    enable_lease: bool,
    heartbeat_interval: Duration,
    lease_duration: Duration,
    failure_threshold: u32,
    provider_timeout: Duration,
    provider: Arc<dyn Provider>,
    capabilities: Capabilities,
    client: Arc<dyn NodeClient>,
    mode: HeartbeatMode,
    node: KubeNode,
    node_uid: String,
    last_heartbeat: Option<DateTime<Utc>>,
    failures: u32,
    reported_not_ready: bool,
}

impl NodeController {
    /// A controller for the node described by `config`.
    pub fn new(
        config: &Config,
        provider: Arc<dyn Provider>,
        capabilities: Capabilities,
        client: Arc<dyn NodeClient>,
    ) -> Self {
        NodeController {
            node_name: config.node_name.clone(),
            internal_ip: config.internal_ip,
            node_labels: config.node_labels.clone(),
            taint: config.taint.clone(),
            enable_lease: config.enable_node_lease,
            heartbeat_interval: config.heartbeat_interval,
            lease_duration: config.lease_duration,
            failure_threshold: config.node_failure_threshold.max(1),
            provider_timeout: config.provider_timeout,
            provider,
            capabilities,
            client,
            mode: HeartbeatMode::Status,
            node: KubeNode::default(),
            node_uid: String::new(),
            last_heartbeat: None,
            failures: 0,
            reported_not_ready: false,
        }
    }

    /// The heartbeat strategy in use.
    pub fn mode(&self) -> HeartbeatMode {
        self.mode
    }

    /// The node as last published.
    pub fn snapshot(&self) -> &KubeNode {
        &self.node
    }

    async fn bounded<T>(&self, call: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
        tokio::time::timeout(self.provider_timeout, call).await?
    }

    /// Next heartbeat timestamp. Never earlier than the previous one.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let ts = match self.last_heartbeat {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last_heartbeat = Some(ts);
        ts
    }

    /// Builds the node from configuration and what the provider reports.
    pub async fn build_node(&self, now: DateTime<Utc>) -> anyhow::Result<KubeNode> {
        let mut builder = Builder::new();
        builder.set_name(&self.node_name);
        builder.set_operating_system(&self.provider.operating_system().to_lowercase());
        builder.add_annotation("node.alpha.kubernetes.io/ttl", "0");
        node_labels_definition(
            &self.node_name,
            &self.provider.operating_system(),
            &self.node_labels,
            &mut builder,
        );
        if let Some(taint) = &self.taint {
            builder.add_taint(&taint.effect, &taint.key, &taint.value);
        }

        builder.set_capacity(
            self.bounded(self.provider.capacity())
                .await
                .context("fetching node capacity")?,
        );
        let endpoints = self
            .bounded(self.provider.node_daemon_endpoints())
            .await
            .context("fetching node daemon endpoints")?;
        builder.set_daemon_endpoints(endpoints);
        for condition in self
            .bounded(self.provider.node_conditions())
            .await
            .context("fetching node conditions")?
        {
            builder.push_condition(self.stamp_condition(condition, now));
        }
        for address in self
            .bounded(self.provider.node_addresses())
            .await
            .context("fetching node addresses")?
        {
            builder.push_address(address);
        }
        if !builder.has_addresses() {
            if let Some(ip) = self.internal_ip {
                builder.add_address("InternalIP", &ip.to_string());
            }
        }

        if let Some(configurer) = self.capabilities.node_configurer() {
            if let Err(e) = configurer.configure_node(&mut builder).await {
                warn!(error = ?e, "provider failed to configure node");
            }
        }

        Ok(builder.build())
    }

    /// Sets the heartbeat time and keeps the transition time of conditions
    /// whose status did not change.
    fn stamp_condition(&self, mut condition: NodeCondition, now: DateTime<Utc>) -> NodeCondition {
        condition.last_heartbeat_time = Some(Time(now));
        let previous = conditions(&self.node)
            .iter()
            .find(|c| c.type_ == condition.type_);
        condition.last_transition_time = match previous {
            Some(prev) if prev.status == condition.status => prev
                .last_transition_time
                .clone()
                .or_else(|| Some(Time(now))),
            _ => condition.last_transition_time.or_else(|| Some(Time(now))),
        };
        condition
    }

    /// Creates the node, or refreshes the status of an existing one, then
    /// probes for lease support.
    pub async fn register(&mut self) -> anyhow::Result<()> {
        let now = self.next_timestamp();
        let node = self.build_node(now).await?;

        let published = match self.client.get_node(&self.node_name).await? {
            Some(existing) => {
                debug!(node = %self.node_name, "node already exists, updating its status");
                let status = node.status.clone().unwrap_or_default();
                let mut updated = self
                    .client
                    .patch_node_status(&self.node_name, &status)
                    .await
                    .context("updating existing node status")?;
                if updated.metadata.uid.is_none() {
                    updated.metadata.uid = existing.metadata.uid;
                }
                updated
            }
            None => self
                .client
                .create_node(&node)
                .await
                .context("creating node")?,
        };
        self.node_uid = published.metadata.uid.clone().unwrap_or_default();
        self.node = node;
        self.node.metadata.uid = Some(self.node_uid.clone());

        self.mode = if self.enable_lease {
            self.acquire_lease(now).await
        } else {
            HeartbeatMode::Status
        };
        info!(node = %self.node_name, mode = ?self.mode, "node registered");
        Ok(())
    }

    /// Creates or adopts the node lease. Falls back to status heartbeats when
    /// the lease cannot be created.
    async fn acquire_lease(&self, now: DateTime<Utc>) -> HeartbeatMode {
        let lease = lease_definition(&self.node_uid, &self.node_name, self.lease_duration, now);
        match self.client.create_lease(&lease).await {
            Ok(_) => {
                debug!(node = %self.node_name, "created node lease");
                HeartbeatMode::Lease
            }
            Err(e) if is_already_exists(&e) => {
                debug!(node = %self.node_name, "adopting existing node lease");
                let spec = lease_spec(&self.node_name, self.lease_duration, now, true);
                match self.client.patch_lease(&self.node_name, &spec).await {
                    Ok(_) => HeartbeatMode::Lease,
                    Err(e) => {
                        warn!(error = ?e, "unable to adopt node lease, falling back to node status heartbeats");
                        HeartbeatMode::Status
                    }
                }
            }
            Err(e) => {
                warn!(error = ?e, "unable to create node lease, falling back to node status heartbeats");
                HeartbeatMode::Status
            }
        }
    }

    /// Publishes one liveness signal.
    ///
    /// After `node-failure-threshold` consecutive failures the node is
    /// reported NotReady, best effort, until a heartbeat succeeds again.
    pub async fn heartbeat(&mut self) -> anyhow::Result<()> {
        let now = self.next_timestamp();
        match self.try_heartbeat(now).await {
            Ok(()) => {
                self.failures = 0;
                self.reported_not_ready = false;
                Ok(())
            }
            Err(e) => {
                self.failures += 1;
                if self.failures >= self.failure_threshold && !self.reported_not_ready {
                    warn!(
                        failures = self.failures,
                        "node heartbeat keeps failing, reporting node NotReady"
                    );
                    match self
                        .publish_not_ready(now, "NodeHeartbeatFailed", "node heartbeat is failing")
                        .await
                    {
                        Ok(()) => self.reported_not_ready = true,
                        Err(e) => debug!(error = ?e, "unable to report node NotReady"),
                    }
                }
                Err(e)
            }
        }
    }

    async fn try_heartbeat(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let fresh = self.build_node(now).await?;
        let status = fresh.status.clone().unwrap_or_default();

        match self.mode {
            HeartbeatMode::Status => {
                self.client
                    .patch_node_status(&self.node_name, &status)
                    .await
                    .context("updating node status")?;
            }
            HeartbeatMode::Lease => {
                self.renew_lease(now).await?;
                let changed = self.reported_not_ready
                    || status_changed(self.node.status.as_ref(), Some(&status));
                if changed {
                    debug!(node = %self.node_name, "node status changed, publishing");
                    self.client
                        .patch_node_status(&self.node_name, &status)
                        .await
                        .context("updating node status")?;
                } else {
                    // Keep the last published heartbeat times.
                    return Ok(());
                }
            }
        }
        self.node.status = Some(status);
        Ok(())
    }

    async fn renew_lease(&self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let spec = lease_spec(&self.node_name, self.lease_duration, now, false);
        match self.client.patch_lease(&self.node_name, &spec).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                info!(node = %self.node_name, "node lease disappeared, recreating it");
                let lease =
                    lease_definition(&self.node_uid, &self.node_name, self.lease_duration, now);
                self.client
                    .create_lease(&lease)
                    .await
                    .context("recreating node lease")?;
                Ok(())
            }
            Err(e) => Err(e.context("renewing node lease")),
        }
    }

    /// Rewrites the Ready condition of the last published status to False.
    async fn publish_not_ready(
        &mut self,
        now: DateTime<Utc>,
        reason: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        let mut status = self.node.status.clone().unwrap_or_default();
        let mut conditions: Vec<NodeCondition> = status
            .conditions
            .take()
            .unwrap_or_default()
            .into_iter()
            .filter(|c| c.type_ != READY)
            .collect();
        conditions.push(NodeCondition {
            type_: READY.to_owned(),
            status: "False".to_owned(),
            last_heartbeat_time: Some(Time(now)),
            last_transition_time: Some(Time(now)),
            reason: Some(reason.to_owned()),
            message: Some(message.to_owned()),
        });
        status.conditions = Some(conditions);
        self.client
            .patch_node_status(&self.node_name, &status)
            .await?;
        self.node.status = Some(status);
        Ok(())
    }

    /// Heartbeats every interval until `token` is cancelled, then reports the
    /// node NotReady.
    pub async fn run(mut self, token: CancellationToken) {
        let start = tokio::time::Instant::now() + self.heartbeat_interval;
        let mut interval = tokio::time::interval_at(start, self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }
            if let Err(e) = self.heartbeat().await {
                error!(error = ?e, failures = self.failures, "node heartbeat failed");
            }
        }

        let now = self.next_timestamp();
        match self
            .publish_not_ready(now, "KubeletShutdown", "virtual kubelet is shutting down")
            .await
        {
            Ok(()) => info!(node = %self.node_name, "node reported NotReady"),
            Err(e) => warn!(error = ?e, "unable to report node NotReady on shutdown"),
        }
    }
}

fn conditions(node: &KubeNode) -> &[NodeCondition] {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default()
}

/// Compares two statuses ignoring condition timestamps.
fn status_changed(old: Option<&NodeStatus>, new: Option<&NodeStatus>) -> bool {
    fn strip(status: Option<&NodeStatus>) -> NodeStatus {
        let mut status = status.cloned().unwrap_or_default();
        if let Some(conditions) = status.conditions.as_mut() {
            for c in conditions.iter_mut() {
                c.last_heartbeat_time = None;
                c.last_transition_time = None;
            }
            conditions.sort_by(|a, b| a.type_.cmp(&b.type_));
        }
        status
    }
    strip(old) != strip(new)
}
