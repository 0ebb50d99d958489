//! The mock provider's optional JSON configuration.
//!
//! The file maps node names to the capacity the node should advertise:
//!
//! ```json
//! { "vk-mock": { "cpu": "8", "memory": "32Gi", "pods": "50" } }
//! ```
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use anyhow::Context;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Deserialize;
use tracing::debug;

const DEFAULT_CPU_CAPACITY: &str = "20";
const DEFAULT_MEMORY_CAPACITY: &str = "100Gi";
const DEFAULT_POD_CAPACITY: &str = "20";

/// Capacity a mock node advertises.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MockConfig {
    /// CPU quantity.
    pub cpu: String,
    /// Memory quantity.
    pub memory: String,
    /// Maximum pod count.
    pub pods: String,
}

impl Default for MockConfig {
    fn default() -> Self {
        MockConfig {
            cpu: DEFAULT_CPU_CAPACITY.to_owned(),
            memory: DEFAULT_MEMORY_CAPACITY.to_owned(),
            pods: DEFAULT_POD_CAPACITY.to_owned(),
        }
    }
}

impl MockConfig {
    /// Loads the entry for `node_name` from the file at `path`.
    ///
    /// A file without an entry for the node yields the defaults, as do blank
    /// fields of an entry.
    pub fn load(path: &Path, node_name: &str) -> anyhow::Result<Self> {
        let data = std::fs::read(path)
            .with_context(|| format!("unable to read mock config {}", path.display()))?;
        Self::parse(&data, node_name)
    }

    /// Parses the JSON document and picks the entry for `node_name`.
    pub fn parse(data: &[u8], node_name: &str) -> anyhow::Result<Self> {
        let mut nodes: HashMap<String, MockConfig> =
            serde_json::from_slice(data).context("mock config is not valid JSON")?;
        let config = match nodes.remove(node_name) {
            Some(mut config) => {
                let defaults = MockConfig::default();
                if config.cpu.is_empty() {
                    config.cpu = defaults.cpu;
                }
                if config.memory.is_empty() {
                    config.memory = defaults.memory;
                }
                if config.pods.is_empty() {
                    config.pods = defaults.pods;
                }
                config
            }
            None => {
                debug!(node = node_name, "no mock config entry for node, using defaults");
                MockConfig::default()
            }
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (what, value) in [("CPU", &self.cpu), ("memory", &self.memory), ("pods", &self.pods)] {
            if !is_quantity(value) {
                anyhow::bail!("invalid {} value {:?}", what, value);
            }
        }
        Ok(())
    }

    /// The capacity as a resource list.
    pub fn capacity(&self) -> BTreeMap<String, Quantity> {
        let mut capacity = BTreeMap::new();
        capacity.insert("cpu".to_owned(), Quantity(self.cpu.clone()));
        capacity.insert("memory".to_owned(), Quantity(self.memory.clone()));
        capacity.insert("pods".to_owned(), Quantity(self.pods.clone()));
        capacity
    }
}

/// Whether `s` is a Kubernetes resource quantity: a signed decimal followed by
/// an optional binary suffix, decimal suffix or decimal exponent.
fn is_quantity(s: &str) -> bool {
    let digits_end = s
        .char_indices()
        .find(|(i, c)| {
            !(c.is_ascii_digit() || *c == '.' || (*i == 0 && (*c == '+' || *c == '-')))
        })
        .map(|(i, _)| i)
        .unwrap_or_else(|| s.len());
    let (number, suffix) = s.split_at(digits_end);
    let number = number.trim_start_matches(|c| c == '+' || c == '-');
    if number.is_empty() || number == "." || number.matches('.').count() > 1 {
        return false;
    }
    match suffix {
        "" | "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" | "n" | "u" | "m" | "k" | "M" | "G" | "T"
        | "P" | "E" => true,
        exp if exp.starts_with('e') || exp.starts_with('E') => {
            let exp = exp[1..].trim_start_matches(|c| c == '+' || c == '-');
            !exp.is_empty() && exp.chars().all(|c| c.is_ascii_digit())
        }
        _ => false,
    }
}
