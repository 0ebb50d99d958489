use std::convert::TryFrom;

use kube::config::{KubeConfigOptions, Kubeconfig};
use structopt::StructOpt;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use vkubelet::config::{Config, Opts};
use vkubelet::provider::registry::Registry;
use vkubelet::VirtualKubelet;

/// A Kubernetes kubelet that hands its pods to a provider.
#[derive(StructOpt, Debug)]
#[structopt(name = "virtual-kubelet")]
struct Cli {
    #[structopt(flatten)]
    opts: Opts,

    #[structopt(subcommand)]
    command: Option<Command>,
}

#[derive(StructOpt, Debug)]
enum Command {
    /// List the registered providers, or check that one is registered
    Providers {
        /// Exit non-zero unless this provider is registered
        name: Option<String>,
    },
    /// Print the version and build time
    Version,
}

#[tokio::main]
async fn main() {
    std::process::exit(match run().await {
        Ok(()) => 0,
        Err(e) => {
            error!(error = %e, "virtual kubelet exited with an error");
            eprintln!("Error: {:#}", e);
            1
        }
    })
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::from_args();

    let mut registry = Registry::new();
    mock_provider::register(&mut registry);

    match cli.command {
        Some(Command::Providers { name: None }) => {
            for name in registry.list() {
                println!("{}", name);
            }
            return Ok(());
        }
        Some(Command::Providers { name: Some(name) }) => {
            if registry.exists(&name) {
                return Ok(());
            }
            anyhow::bail!("provider {:?} is not registered", name);
        }
        Some(Command::Version) => {
            println!(
                "virtual-kubelet {} (built {})",
                env!("CARGO_PKG_VERSION"),
                env!("VK_BUILD_TIME")
            );
            return Ok(());
        }
        None => (),
    }

    let config = Config::from_opts(cli.opts)?;
    init_logging(&config.log_level);
    for exporter in &config.trace.exporters {
        tracing::warn!(%exporter, "trace exporter is not compiled in, ignoring");
    }

    let client = kube_client(&config).await?;
    let kubelet = VirtualKubelet::from_registry(config, &registry, client)?;

    let token = CancellationToken::new();
    let signals = vkubelet::cancel_on_signal(token.clone());
    let result = kubelet.run(token).await;
    signals.abort();
    result?;
    info!("virtual kubelet stopped");
    Ok(())
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// A client for the configured kubeconfig, or the usual in-cluster and
/// `~/.kube/config` discovery when none is set.
async fn kube_client(config: &Config) -> anyhow::Result<kube::Client> {
    let client = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)?;
            let kube_config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await?;
            kube::Client::try_from(kube_config)?
        }
        None => kube::Client::try_default().await?,
    };
    Ok(client)
}
