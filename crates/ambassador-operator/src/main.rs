//! Ambassador Operator - installs and upgrades Ambassador from AmbassadorInstallation resources

mod controller_runner;
mod dependents;

use clap::Parser;
use kube::{Client, CustomResourceExt};

use ambassador_common::crd::AmbassadorInstallation;
use ambassador_common::telemetry::{init_telemetry, TelemetryConfig};
use ambassador_installer::ControllerConfig;

/// Ambassador Operator - manages the Ambassador Helm release of each namespace
#[derive(Parser, Debug)]
#[command(name = "ambassador-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Only watch installations in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    watch_namespace: Option<String>,

    /// Human-readable logs instead of JSON
    #[arg(long)]
    text_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install crypto provider for kube and reqwest TLS
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("CRITICAL: Failed to install crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&AmbassadorInstallation::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        json: !cli.text_logs,
        ..TelemetryConfig::default()
    })?;

    run_controller(cli.watch_namespace.filter(|ns| !ns.is_empty())).await
}

async fn run_controller(namespace: Option<String>) -> anyhow::Result<()> {
    tracing::info!("Ambassador operator starting...");

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    let config = ControllerConfig::from_env();
    tracing::info!(
        check_interval = ?config.check_interval,
        update_interval = ?config.update_interval,
        "controller configuration loaded"
    );

    let tasks = controller_runner::build_controllers(client, namespace, config)?;
    futures::future::join_all(tasks).await;

    tracing::info!("Ambassador operator shutting down");
    Ok(())
}
