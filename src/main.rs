use anyhow::Result;
use clap::{Parser, Subcommand};
use kube::Client;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::path::PathBuf;
use tracing::{info, warn};

use kube_tunnel::{TunnelBroker, config::BrokerConfig, util::parse_service_target};

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    expose_metrics: bool,

    #[arg(short, long, default_value = "9292")]
    metrics_port: u16,

    #[command(subcommand)]
    target: Target,
}

#[derive(Subcommand)]
enum Target {
    /// Forward to a node address through the in-cluster proxy
    Node {
        address: String,
        port: u16,
        /// Print the address itself when forwarding fails
        #[arg(long)]
        fallback: bool,
    },
    /// Forward to a service: name, name.namespace or its cluster DNS name
    Service { target: String, port: u16 },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();

    if cli.expose_metrics {
        let builder = PrometheusBuilder::new();
        builder
            .with_http_listener(([0, 0, 0, 0], cli.metrics_port))
            .add_global_label("service", "kube-tunnel")
            .install()?;
    }

    let config = match &cli.config {
        Some(path) => BrokerConfig::load(path).await?,
        None => BrokerConfig::default(),
    };

    let client = Client::try_default().await?;
    let default_namespace = client.default_namespace().to_string();
    let broker = TunnelBroker::with_client(client, config)?;

    // The library never registers signal handlers; tearing down is our job.
    let (shutdown_tx, mut shutdown_rx) = tokio::sync::broadcast::channel(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(());
    })?;

    let local = match &cli.target {
        Target::Node {
            address,
            port,
            fallback: true,
        } => broker.try_forward_to_node(address, *port).await,
        Target::Node { address, port, .. } => broker.forward_to_node(address, *port).await?,
        Target::Service { target, port } => {
            let (name, namespace) = parse_service_target(target, &default_namespace)?;
            broker.forward_to_service(name, namespace, *port).await?
        }
    };
    println!("{}", local);

    shutdown_rx.recv().await?;
    info!("Shutting down...");

    let stopped = broker.shutdown_all().await;
    if stopped == 0 {
        warn!("No tunnels were open at shutdown");
    }

    Ok(())
}
