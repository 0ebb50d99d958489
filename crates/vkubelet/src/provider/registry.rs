//! Named provider constructors.
//!
//! The registry is filled during an initialization phase and then handed to
//! the supervisor, which builds exactly one provider from it.
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use thiserror::Error;
use tracing::debug;

use super::BuiltProvider;
use crate::resource_manager::ResourceManager;

/// Parameters handed to a provider constructor once, at startup.
#[derive(Clone, Debug)]
pub struct ProviderInitConfig {
    /// Path to the provider's own configuration file.
    pub config_path: Option<PathBuf>,
    /// Name of the node the provider serves.
    pub node_name: String,
    /// Operating system the node advertises.
    pub operating_system: String,
    /// Internal IP of this process.
    pub internal_ip: Option<IpAddr>,
    /// Port the pod HTTP surface listens on.
    pub daemon_port: u16,
    /// Access to secrets, config maps and services.
    pub resource_manager: ResourceManager,
}

/// A function that builds a provider.
pub type ProviderConstructor =
    Box<dyn Fn(ProviderInitConfig) -> anyhow::Result<BuiltProvider> + Send + Sync>;

/// Errors building a provider.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No constructor was registered under the name.
    #[error("provider {0:?} is not registered")]
    NotRegistered(String),
    /// The constructor returned an error.
    #[error("error initializing provider {name:?}: {source}")]
    ConstructorFailure {
        /// The provider's name
        name: String,
        /// What the constructor returned
        #[source]
        source: anyhow::Error,
    },
}

/// Name to constructor lookup.
#[derive(Default)]
pub struct Registry {
    constructors: BTreeMap<String, ProviderConstructor>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.constructors.keys()).finish()
    }
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under `name`. A later registration of the same
    /// name replaces the earlier one.
    pub fn register<F>(&mut self, name: impl Into<String>, constructor: F) -> &mut Self
    where
        F: Fn(ProviderInitConfig) -> anyhow::Result<BuiltProvider> + Send + Sync + 'static,
    {
        let name = name.into();
        if self
            .constructors
            .insert(name.clone(), Box::new(constructor))
            .is_some()
        {
            debug!(provider = %name, "replacing registered provider");
        }
        self
    }

    /// Whether a constructor is registered under `name`.
    pub fn exists(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    /// Registered names in lexicographic order.
    pub fn list(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Builds the provider registered under `name`.
    pub fn build(
        &self,
        name: &str,
        init: ProviderInitConfig,
    ) -> Result<BuiltProvider, RegistryError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| RegistryError::NotRegistered(name.to_owned()))?;
        constructor(init).map_err(|source| RegistryError::ConstructorFailure {
            name: name.to_owned(),
            source,
        })
    }
}
