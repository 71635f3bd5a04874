use std::{path::PathBuf, process::ExitCode, time::Duration};

use clap::Parser;
use tokio_util::sync::CancellationToken;

use ingressgroup_controller::{
    cluster::KubeCluster, ConnectConfig, Controller, ControllerConfig, LogHandler,
};

/// Mirrors IngressGroup custom resources and reports every change.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// The address of the Kubernetes API server (overrides any value in kubeconfig)
    #[arg(long, env = "KUBE_MASTER")]
    master: Option<String>,

    /// Path to kubeconfig file with authorization and master location information.
    #[arg(long, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Only watch IngressGroups in this namespace.
    #[arg(long)]
    namespace: Option<String>,

    /// Seconds between full relists; 0 disables periodic resync.
    #[arg(long, default_value_t = 0)]
    resync_period: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if let Err(err) = run(args).await {
        eprintln!("{err}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    log::info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let connect = ConnectConfig {
        master: args.master,
        kubeconfig: args.kubeconfig,
    };
    let config = ControllerConfig::default()
        .namespace(args.namespace)
        .resync_period(Duration::from_secs(args.resync_period));

    let client = KubeCluster::connect(&connect).await?;
    let cluster = KubeCluster::new(client, &config);

    let mut controller = Controller::new(cluster, config);
    controller.register_handler(LogHandler);

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    log::info!("Received shutdown signal");
                    cancel.cancel();
                }
                Err(err) => log::error!("Failed to listen for shutdown signal: {err}"),
            }
        }
    });

    controller.run(cancel).await?;
    Ok(())
}
