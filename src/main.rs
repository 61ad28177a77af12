use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber;

use waterline::config::WaterlineConfig;
use waterline::grpc::GrpcServer;
use waterline::mesh::{UdpMesh, UpdatePublisher};
use waterline::quota::QuotaManager;

#[derive(Debug, Parser)]
#[command(name = "waterline", version, about = "Distributed quota service")]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long)]
    config: Option<String>,

    /// The window length quota is managed for, in seconds
    #[arg(long)]
    window_secs: Option<i64>,

    /// Per second rate limit
    #[arg(long)]
    rate_limit: Option<i64>,

    /// Total quota limit over the window length, 0 disables the check
    #[arg(long)]
    total_limit: Option<i64>,

    /// Time after which idle counters are expired, in seconds
    #[arg(long)]
    idle_ttl_secs: Option<i64>,

    /// gRPC listen address
    #[arg(long)]
    grpc_addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    info!("Starting Waterline Quota Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse();

    // Load configuration, then apply flag overrides
    let mut config = match &args.config {
        Some(path) => WaterlineConfig::from_file(path)?,
        None => WaterlineConfig::default(),
    };
    if let Some(window_secs) = args.window_secs {
        config.quota.window_secs = window_secs;
    }
    if let Some(rate_limit) = args.rate_limit {
        config.quota.rate_limit = rate_limit;
    }
    if let Some(total_limit) = args.total_limit {
        config.quota.total_limit = total_limit;
    }
    if let Some(idle_ttl_secs) = args.idle_ttl_secs {
        config.quota.idle_ttl_secs = idle_ttl_secs;
    }
    if let Some(grpc_addr) = args.grpc_addr {
        config.server.grpc_addr = grpc_addr;
    }
    info!(grpc_addr = %config.server.grpc_addr, "Configuration loaded");

    // Initialize the quota manager
    let manager = Arc::new(QuotaManager::new(config.quota.clone()));
    info!(node_id = %manager.id(), "Quota manager initialized");

    // Bind the mesh transport and wire inbound updates to the manager
    let mesh = Arc::new(UdpMesh::bind(config.mesh.listen_addr, config.mesh.peers.clone()).await?);
    mesh.spawn_receiver(Arc::clone(&manager));

    // Start the reconciliation loop, broadcasting through the mesh
    manager.start(Arc::clone(&mesh) as Arc<dyn UpdatePublisher>);

    // Create and start the gRPC server
    let grpc_server = GrpcServer::new(config.server.grpc_addr, Arc::clone(&manager));

    info!("Starting gRPC server on {}", config.server.grpc_addr);

    // Run the server with graceful shutdown on Ctrl+C
    grpc_server.serve_with_shutdown(shutdown_signal()).await?;

    manager.stop();

    info!("Waterline Quota Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
