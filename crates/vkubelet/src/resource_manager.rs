//! Lookups of the secondary Kubernetes objects a pod refers to.
//!
//! Providers receive a [`ResourceManager`] in their init config so they can
//! resolve secrets, config maps and services without owning a client.
use std::collections::HashMap;

use k8s_openapi::api::core::v1::{ConfigMap, Container, EnvVarSource, Secret, Service};
use kube::api::{Api, ListParams};
use tracing::{error, trace};

use crate::pod::Pod;

/// Handle for reading secondary objects from the cluster.
#[derive(Clone)]
pub struct ResourceManager {
    client: Option<kube::Client>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManager")
            .field("connected", &self.client.is_some())
            .finish()
    }
}

impl ResourceManager {
    /// A manager reading through `client`.
    pub fn new(client: kube::Client) -> Self {
        ResourceManager {
            client: Some(client),
        }
    }

    /// A manager with no cluster behind it. Every lookup fails.
    pub fn detached() -> Self {
        ResourceManager { client: None }
    }

    fn client(&self) -> anyhow::Result<kube::Client> {
        self.client
            .clone()
            .ok_or_else(|| anyhow::anyhow!("resource manager is not connected to a cluster"))
    }

    /// Fetches a secret.
    pub async fn get_secret(&self, namespace: &str, name: &str) -> anyhow::Result<Secret> {
        let api: Api<Secret> = Api::namespaced(self.client()?, namespace);
        Ok(api.get(name).await?)
    }

    /// Fetches a config map.
    pub async fn get_config_map(&self, namespace: &str, name: &str) -> anyhow::Result<ConfigMap> {
        let api: Api<ConfigMap> = Api::namespaced(self.client()?, namespace);
        Ok(api.get(name).await?)
    }

    /// Lists the services of a namespace, used for service environment
    /// variables.
    pub async fn list_services(&self, namespace: &str) -> anyhow::Result<Vec<Service>> {
        let api: Api<Service> = Api::namespaced(self.client()?, namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    /// Resolves the environment variables of a container.
    ///
    /// Literal values are used as is. References to config maps, secrets and
    /// downward API fields are looked up; a reference that cannot be resolved
    /// yields an empty value.
    pub async fn env_vars(&self, container: &Container, pod: &Pod) -> HashMap<String, String> {
        let mut env = HashMap::new();
        let vars = match container.env.as_ref() {
            Some(e) => e,
            None => return env,
        };
        let fields = field_map(pod);

        for env_var in vars.iter() {
            let value = match &env_var.value {
                Some(v) => v.clone(),
                None => {
                    self.on_missing_env_value(env_var.value_from.as_ref(), pod.namespace(), &fields)
                        .await
                }
            };
            env.insert(env_var.name.clone(), value);
        }
        env
    }

    async fn on_missing_env_value(
        &self,
        env_var_source: Option<&EnvVarSource>,
        ns: &str,
        fields: &HashMap<String, String>,
    ) -> String {
        let env_src = match env_var_source {
            Some(env_src) => env_src,
            None => return String::new(),
        };

        if let Some(cfkey) = env_src.config_map_key_ref.as_ref() {
            let name = cfkey.name.as_deref().unwrap_or_default();
            return match self.get_config_map(ns, name).await {
                Ok(cfgmap) => cfgmap
                    .data
                    .unwrap_or_default()
                    .remove(&cfkey.key)
                    .unwrap_or_default(),
                Err(e) => {
                    error!(namespace = ns, name, error = %e, "error fetching config map");
                    String::new()
                }
            };
        }
        if let Some(seckey) = env_src.secret_key_ref.as_ref() {
            let name = seckey.name.as_deref().unwrap_or_default();
            return match self.get_secret(ns, name).await {
                Ok(secret) => secret
                    .data
                    .unwrap_or_default()
                    .remove(&seckey.key)
                    .map(|s| String::from_utf8(s.0).unwrap_or_default())
                    .unwrap_or_default(),
                Err(e) => {
                    error!(namespace = ns, name, error = %e, "error fetching secret");
                    String::new()
                }
            };
        }
        if let Some(field) = env_src.field_ref.as_ref() {
            return fields.get(&field.field_path).cloned().unwrap_or_default();
        }
        String::new()
    }
}

/// Build the map of allowable field_ref values.
///
/// The Downward API only supports a small selection of fields. This
/// provides those fields.
fn field_map(pod: &Pod) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::new();
    map.insert("metadata.name".into(), pod.name().to_owned());
    map.insert("metadata.namespace".into(), pod.namespace().to_owned());
    map.insert(
        "spec.nodeName".into(),
        pod.node_name().unwrap_or_default().to_owned(),
    );
    map.insert(
        "status.hostIP".into(),
        pod.host_ip().unwrap_or_default().to_owned(),
    );
    map.insert(
        "status.podIP".into(),
        pod.pod_ip().unwrap_or_default().to_owned(),
    );
    pod.labels().iter().for_each(|(k, v)| {
        trace!(label = %k, "adding label to downward fields");
        map.insert(format!("metadata.labels['{}']", k), v.clone());
    });
    pod.annotations().iter().for_each(|(k, v)| {
        map.insert(format!("metadata.annotations['{}']", k), v.clone());
    });
    map
}
