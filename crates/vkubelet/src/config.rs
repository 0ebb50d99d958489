//! Configuration for a virtual kubelet
//!
//! The best way to configure the virtual kubelet is by using
//! [`Config::default_config`] or by turning on the "cli" feature and using
//! [`Config::from_opts`].

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "cli")]
use structopt::StructOpt;

use crate::error::ConfigError;

/// Port the pod server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 10250;
/// Port the metrics server listens on unless configured otherwise.
pub const DEFAULT_METRICS_PORT: u16 = 10255;
/// Taint key applied when none is configured.
pub const DEFAULT_TAINT_KEY: &str = "virtual-kubelet.io/provider";
/// Taint effect applied when none is configured.
pub const DEFAULT_TAINT_EFFECT: &str = "NoSchedule";
/// Node name used when neither the flag nor `DEFAULT_NODE_NAME` is set.
pub const DEFAULT_NODE_NAME: &str = "virtual-kubelet";

const VALID_TAINT_EFFECTS: [&str; 3] = ["NoSchedule", "NoExecute", "PreferNoSchedule"];
const VALID_OPERATING_SYSTEMS: [&str; 2] = ["Linux", "Windows"];
const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
const RESERVED_TRACE_TAGS: [&str; 3] = ["operatingSystem", "provider", "nodeName"];

/// The configuration needed for a virtual kubelet to run properly.
///
/// This can be configured manually in your code or, if you are exposing a
/// CLI, built with [`Config::from_opts`] (this requires the "cli" feature to
/// be enabled).
#[derive(Clone, Debug)]
pub struct Config {
    /// The node's name
    pub node_name: String,
    /// Operating system advertised by the node, `Linux` or `Windows`
    pub operating_system: String,
    /// Name of the provider to build from the registry
    pub provider: String,
    /// Path handed to the provider constructor
    pub provider_config: Option<PathBuf>,
    /// Path to a kubeconfig. The usual discovery rules apply when unset.
    pub kubeconfig: Option<PathBuf>,
    /// Only watch pods in this namespace. All namespaces when unset.
    pub namespace: Option<String>,
    /// Address advertised as the node's `InternalIP`
    pub internal_ip: Option<IpAddr>,
    /// Labels to add when registering the node in the cluster
    pub node_labels: HashMap<String, String>,
    /// The taint to apply to the node, `None` when disabled
    pub taint: Option<TaintConfig>,
    /// Number of pod sync workers
    pub pod_sync_workers: usize,
    /// Whether to heartbeat through a node lease
    pub enable_node_lease: bool,
    /// How often every watched pod is replayed
    pub full_resync_period: Duration,
    /// How often desired and provider pods are compared
    pub reconcile_period: Duration,
    /// How long to wait for the initial pod list
    pub startup_timeout: Duration,
    /// How often the node heartbeats
    pub heartbeat_interval: Duration,
    /// Duration written to the node lease
    pub lease_duration: Duration,
    /// Consecutive heartbeat failures after which the node is reported NotReady
    pub node_failure_threshold: u32,
    /// Deadline applied to every provider call
    pub provider_timeout: Duration,
    /// How long workers get to drain on shutdown
    pub shutdown_grace: Duration,
    /// The HTTP server configuration
    pub server_config: ServerConfig,
    /// Trace settings
    pub trace: TraceConfig,
    /// Default log level when `RUST_LOG` is not set
    pub log_level: String,
}

/// The configuration for the HTTP servers.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// The ip address the pod server is running on
    pub addr: IpAddr,
    /// The port the pod server is running on
    pub port: u16,
    /// The address the metrics server is running on
    pub metrics_addr: SocketAddr,
    /// Path to the TLS certificate of the pod server
    pub cert_file: Option<PathBuf>,
    /// Path to the TLS private key of the pod server
    pub private_key_file: Option<PathBuf>,
}

impl ServerConfig {
    /// Both TLS files, if both are configured.
    pub fn tls_files(&self) -> Option<(&PathBuf, &PathBuf)> {
        match (&self.cert_file, &self.private_key_file) {
            (Some(cert), Some(key)) => Some((cert, key)),
            _ => None,
        }
    }
}

/// The taint applied to the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaintConfig {
    /// Taint key
    pub key: String,
    /// Taint value
    pub value: String,
    /// One of `NoSchedule`, `NoExecute` or `PreferNoSchedule`
    pub effect: String,
}

/// Trace settings. Exporters are validated but none is compiled in.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceConfig {
    /// Requested exporters
    pub exporters: Vec<String>,
    /// Service name reported with spans
    pub service_name: String,
    /// User supplied tags
    pub tags: Vec<(String, String)>,
    /// `always`, `never` or a percentage
    pub sample_rate: Option<String>,
}

impl TraceConfig {
    /// User tags plus the tags the core always sets.
    pub fn resolved_tags(
        &self,
        operating_system: &str,
        provider: &str,
        node_name: &str,
    ) -> BTreeMap<String, String> {
        let mut tags: BTreeMap<String, String> = self.tags.iter().cloned().collect();
        tags.insert("operatingSystem".to_owned(), operating_system.to_owned());
        tags.insert("provider".to_owned(), provider.to_owned());
        tags.insert("nodeName".to_owned(), node_name.to_owned());
        tags
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = Vec::new();
        for (key, value) in &self.tags {
            if RESERVED_TRACE_TAGS.contains(&key.as_str()) {
                return Err(ConfigError::ReservedTraceTag(key.clone()));
            }
            if seen.contains(&key) {
                return Err(ConfigError::InvalidKeyValue(format!("{}={}", key, value)));
            }
            seen.push(key);
        }
        match self.sample_rate.as_deref() {
            None | Some("") | Some("always") | Some("never") => Ok(()),
            Some(rate) => match rate.parse::<u8>() {
                Ok(n) if n <= 100 => Ok(()),
                _ => Err(ConfigError::InvalidSampleRate(rate.to_owned())),
            },
        }
    }
}

impl Config {
    /// Returns a Config object set with all of the defaults for `provider`.
    pub fn default_config(node_name: &str, provider: &str) -> Self {
        Config {
            node_name: node_name.to_owned(),
            operating_system: "Linux".to_owned(),
            provider: provider.to_owned(),
            provider_config: None,
            kubeconfig: None,
            namespace: None,
            internal_ip: None,
            node_labels: HashMap::new(),
            taint: Some(TaintConfig {
                key: DEFAULT_TAINT_KEY.to_owned(),
                value: provider.to_owned(),
                effect: DEFAULT_TAINT_EFFECT.to_owned(),
            }),
            pod_sync_workers: 10,
            enable_node_lease: true,
            full_resync_period: Duration::from_secs(60),
            reconcile_period: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(60),
            heartbeat_interval: Duration::from_secs(30),
            lease_duration: Duration::from_secs(40),
            node_failure_threshold: 3,
            provider_timeout: Duration::from_secs(30),
            shutdown_grace: Duration::from_secs(10),
            server_config: ServerConfig {
                addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                port: DEFAULT_PORT,
                metrics_addr: SocketAddr::new(
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    DEFAULT_METRICS_PORT,
                ),
                cert_file: None,
                private_key_file: None,
            },
            trace: TraceConfig {
                service_name: "virtual-kubelet".to_owned(),
                ..Default::default()
            },
            log_level: "info".to_owned(),
        }
    }

    /// Refuses configuration that cannot be reconciled.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.is_empty() {
            return Err(ConfigError::MissingProvider);
        }
        if !VALID_OPERATING_SYSTEMS.contains(&self.operating_system.as_str()) {
            return Err(ConfigError::InvalidOperatingSystem(
                self.operating_system.clone(),
            ));
        }
        if self.pod_sync_workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if let Some(taint) = &self.taint {
            if !VALID_TAINT_EFFECTS.contains(&taint.effect.as_str()) {
                return Err(ConfigError::InvalidTaintEffect(taint.effect.clone()));
            }
        }
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.log_level.clone()));
        }
        self.trace.validate()
    }

    /// Builds a validated config from parsed command line flags.
    #[cfg(any(feature = "cli", feature = "docs"))]
    #[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
    pub fn from_opts(opts: Opts) -> Result<Self, ConfigError> {
        let provider = opts.provider.unwrap_or_default();
        let node_labels = opts
            .node_labels
            .iter()
            .filter_map(|i| split_one_label(i))
            .collect();
        let trace_tags = opts
            .trace_tags
            .iter()
            .map(|tag| match split_one_label(tag) {
                Some((key, value)) if tag.contains('=') => Ok((key, value)),
                _ => Err(ConfigError::InvalidKeyValue(tag.clone())),
            })
            .collect::<Result<Vec<_>, _>>()?;
        let taint = if opts.disable_taint {
            None
        } else {
            Some(TaintConfig {
                key: opts.taint,
                value: opts.taint_value.unwrap_or_else(|| provider.clone()),
                effect: opts.taint_effect,
            })
        };

        let config = Config {
            node_name: opts.node_name,
            operating_system: normalize_os(&opts.operating_system),
            provider,
            provider_config: opts.provider_config,
            kubeconfig: opts.kubeconfig,
            namespace: opts.namespace.filter(|ns| !ns.is_empty()),
            internal_ip: opts.internal_ip,
            node_labels,
            taint,
            pod_sync_workers: opts.pod_sync_workers,
            enable_node_lease: opts.enable_node_lease,
            full_resync_period: opts.full_resync_period,
            reconcile_period: opts.reconcile_period,
            startup_timeout: opts.startup_timeout,
            heartbeat_interval: opts.heartbeat_interval,
            lease_duration: opts.lease_duration,
            node_failure_threshold: opts.node_failure_threshold,
            provider_timeout: opts.provider_timeout,
            shutdown_grace: opts.shutdown_grace,
            server_config: ServerConfig {
                addr: opts.addr,
                port: opts.port,
                metrics_addr: opts.metrics_addr,
                cert_file: opts.cert_file,
                private_key_file: opts.private_key_file,
            },
            trace: TraceConfig {
                exporters: opts.trace_exporters,
                service_name: opts.trace_service_name,
                tags: trace_tags,
                sample_rate: opts.trace_sample_rate,
            },
            log_level: opts.log_level.to_lowercase(),
        };
        config.validate()?;
        Ok(config)
    }
}

/// CLI options that can be configured for the virtual kubelet
#[derive(StructOpt, Clone, Debug)]
#[cfg(any(feature = "cli", feature = "docs"))]
#[cfg_attr(feature = "docs", doc(cfg(feature = "cli")))]
pub struct Opts {
    #[structopt(
        long = "kubeconfig",
        env = "KUBECONFIG",
        help = "The kubeconfig to use. Defaults to the in-cluster config or ~/.kube/config"
    )]
    kubeconfig: Option<PathBuf>,

    #[structopt(
        long = "namespace",
        help = "Only watch pods in this namespace. Defaults to all namespaces"
    )]
    namespace: Option<String>,

    #[structopt(
        long = "nodename",
        env = "DEFAULT_NODE_NAME",
        default_value = DEFAULT_NODE_NAME,
        help = "The name for this node in Kubernetes"
    )]
    node_name: String,

    #[structopt(
        long = "os",
        default_value = "Linux",
        help = "Operating system advertised by the node (Linux|Windows)"
    )]
    operating_system: String,

    #[structopt(long = "provider", help = "The name of the provider to run")]
    provider: Option<String>,

    #[structopt(
        long = "provider-config",
        help = "Path to the provider's configuration file"
    )]
    provider_config: Option<PathBuf>,

    #[structopt(
        long = "addr",
        default_value = "0.0.0.0",
        help = "The address the pod server should listen on"
    )]
    addr: IpAddr,

    #[structopt(
        long = "listen-port",
        env = "KUBELET_PORT",
        default_value = "10250",
        help = "The port the pod server should listen on"
    )]
    port: u16,

    #[structopt(
        long = "metrics-addr",
        default_value = "0.0.0.0:10255",
        help = "The address the metrics server should listen on"
    )]
    metrics_addr: SocketAddr,

    #[structopt(
        long = "cert-file",
        env = "APISERVER_CERT_LOCATION",
        help = "Path to the pod server's TLS certificate"
    )]
    cert_file: Option<PathBuf>,

    #[structopt(
        long = "key-file",
        env = "APISERVER_KEY_LOCATION",
        help = "Path to the pod server's TLS private key"
    )]
    private_key_file: Option<PathBuf>,

    #[structopt(
        long = "internal-ip",
        env = "VKUBELET_POD_IP",
        help = "Address advertised as the node's InternalIP when the provider reports none"
    )]
    internal_ip: Option<IpAddr>,

    #[structopt(
        long = "node-labels",
        env = "NODE_LABELS",
        use_delimiter = true,
        help = "Labels to add when registering the node in the cluster.
        Labels must be key=value pairs separated by ','.
        Labels in the 'kubernetes.io' namespace must begin with an allowed prefix
        (kubelet.kubernetes.io, node.kubernetes.io) or be in the specifically allowed set
        (beta.kubernetes.io/instance-type, failure-domain.beta.kubernetes.io/region,
        failure-domain.beta.kubernetes.io/zone, failure-domain.kubernetes.io/region,
        failure-domain.kubernetes.io/zone, kubernetes.io/instance-type)"
    )]
    node_labels: Vec<String>,

    #[structopt(
        long = "taint",
        env = "VKUBELET_TAINT_KEY",
        default_value = DEFAULT_TAINT_KEY,
        help = "Taint key to apply to the node"
    )]
    taint: String,

    #[structopt(
        long = "taint-value",
        env = "VKUBELET_TAINT_VALUE",
        help = "Taint value. Defaults to the provider name"
    )]
    taint_value: Option<String>,

    #[structopt(
        long = "taint-effect",
        env = "VKUBELET_TAINT_EFFECT",
        default_value = DEFAULT_TAINT_EFFECT,
        help = "Taint effect (NoSchedule|NoExecute|PreferNoSchedule)"
    )]
    taint_effect: String,

    #[structopt(long = "disable-taint", help = "Do not taint the node")]
    disable_taint: bool,

    #[structopt(
        long = "pod-sync-workers",
        default_value = "10",
        help = "Number of pods to reconcile in parallel"
    )]
    pod_sync_workers: usize,

    #[structopt(
        long = "enable-node-lease",
        help = "Heartbeat through a node lease instead of node status updates"
    )]
    enable_node_lease: bool,

    #[structopt(
        long = "full-resync-period",
        default_value = "1m",
        parse(try_from_str = parse_duration),
        help = "How often every watched pod is replayed"
    )]
    full_resync_period: Duration,

    #[structopt(
        long = "reconcile-period",
        default_value = "1m",
        parse(try_from_str = parse_duration),
        help = "How often desired pods are compared against the provider"
    )]
    reconcile_period: Duration,

    #[structopt(
        long = "startup-timeout",
        default_value = "1m",
        parse(try_from_str = parse_duration),
        help = "How long to wait for the initial pod list"
    )]
    startup_timeout: Duration,

    #[structopt(
        long = "heartbeat-interval",
        default_value = "30s",
        parse(try_from_str = parse_duration),
        help = "How often the node reports that it is alive"
    )]
    heartbeat_interval: Duration,

    #[structopt(
        long = "lease-duration",
        default_value = "40s",
        parse(try_from_str = parse_duration),
        help = "Duration written to the node lease"
    )]
    lease_duration: Duration,

    #[structopt(
        long = "node-failure-threshold",
        default_value = "3",
        help = "Consecutive heartbeat failures before the node is reported NotReady"
    )]
    node_failure_threshold: u32,

    #[structopt(
        long = "provider-timeout",
        default_value = "30s",
        parse(try_from_str = parse_duration),
        help = "Deadline applied to every provider call"
    )]
    provider_timeout: Duration,

    #[structopt(
        long = "shutdown-grace",
        default_value = "10s",
        parse(try_from_str = parse_duration),
        help = "How long workers get to finish on shutdown"
    )]
    shutdown_grace: Duration,

    #[structopt(
        long = "trace-exporter",
        help = "Trace exporter to send spans to. May be repeated"
    )]
    trace_exporters: Vec<String>,

    #[structopt(
        long = "trace-service-name",
        default_value = "virtual-kubelet",
        help = "Service name reported with spans"
    )]
    trace_service_name: String,

    #[structopt(long = "trace-tag", help = "key=value tag added to spans. May be repeated")]
    trace_tags: Vec<String>,

    #[structopt(
        long = "trace-sample-rate",
        help = "always, never, or a percentage between 0 and 100"
    )]
    trace_sample_rate: Option<String>,

    #[structopt(
        long = "log-level",
        default_value = "info",
        help = "Log level used when RUST_LOG is not set (trace|debug|info|warn|error)"
    )]
    log_level: String,
}

/// Parses `500ms`, `30s`, `1m`, `2h` or a bare number of seconds.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let s = s.trim();
    let invalid = || ConfigError::InvalidDuration(s.to_owned());
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or_else(|| s.len());
    let (number, unit) = s.split_at(split);
    let n: u64 = number.parse().map_err(|_| invalid())?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "" | "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n.checked_mul(60).ok_or_else(invalid)?)),
        "h" => Ok(Duration::from_secs(n.checked_mul(60 * 60).ok_or_else(invalid)?)),
        _ => Err(invalid()),
    }
}

fn normalize_os(os: &str) -> String {
    VALID_OPERATING_SYSTEMS
        .iter()
        .find(|valid| valid.eq_ignore_ascii_case(os))
        .map(|valid| (*valid).to_owned())
        .unwrap_or_else(|| os.to_owned())
}

fn split_one_label(in_string: &str) -> Option<(String, String)> {
    let mut splitter = in_string.splitn(2, '=');

    match splitter.next() {
        Some("") | None => None,
        Some(key) => match splitter.next() {
            Some(val) => Some((key.to_string(), val.to_string())),
            None => Some((key.to_string(), String::new())),
        },
    }
}
