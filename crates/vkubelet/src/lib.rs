//! A crate for building [virtual kubelets](https://virtual-kubelet.io/): processes
//! that register themselves as a Kubernetes node and hand the pods scheduled
//! to it to a pluggable backend.
//!
//! The crate provides the [`Provider`] trait for declaring a backend, a
//! [`Registry`](provider::registry::Registry) to select one by name, and the
//! [`VirtualKubelet`] type which takes a provider and keeps it in line with
//! the cluster.
//!
//! # Example
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use vkubelet::config::Config;
//! use vkubelet::provider::registry::{ProviderInitConfig, Registry};
//! use vkubelet::provider::BuiltProvider;
//! use vkubelet::VirtualKubelet;
//!
//! fn my_provider(init: ProviderInitConfig) -> anyhow::Result<BuiltProvider> {
//!     todo!("build the provider for node {}", init.node_name)
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut registry = Registry::new();
//!     registry.register("mine", my_provider);
//!
//!     let config = Config::default_config("my-node", "mine");
//!     let client = kube::Client::try_default().await?;
//!     let kubelet = VirtualKubelet::from_registry(config, &registry, client)?;
//!     kubelet.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(feature = "docs", feature(doc_cfg))]

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod informer;
mod kubelet;
pub mod log;
pub mod node;
pub mod notifier;
pub mod pod;
pub mod provider;
pub mod queue;
pub mod reconciler;
pub mod resource_manager;
pub mod stats;
pub mod sync;
pub mod webserver;

#[cfg(test)]
pub(crate) mod testing;

pub use self::kubelet::{cancel_on_signal, VirtualKubelet};

#[doc(inline)]
pub use pod::{Pod, PodKey};
#[doc(inline)]
pub use provider::Provider;
