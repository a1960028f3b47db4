//! Local Volume Provider file server
//!
//! Runs as a sidecar in the velero pod and serves the mounted buckets to
//! holders of a signed URL.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tracing::info;

use local_volume_provider::cluster::KubeClusterClient;
use local_volume_provider::fileserver::{file_server_router, FileServerState};
use local_volume_provider::signing::{SigningKeyStore, UrlSigner};
use local_volume_provider::telemetry::{init_tracing, TelemetryConfig};
use local_volume_provider::{DEFAULT_VOLUME_ROOT, FILE_SERVER_PORT};

/// Signed-URL file server for local volume backups
#[derive(Parser, Debug)]
#[command(name = "local-volume-fileserver", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Directory the bucket volumes are mounted under
    #[arg(long, env = "MOUNT_POINT", default_value = DEFAULT_VOLUME_ROOT)]
    mount_point: PathBuf,

    /// Namespace holding the signing key
    #[arg(long, env = "VELERO_NAMESPACE")]
    namespace: Option<String>,

    /// Address to listen on
    #[arg(long, default_value_t = SocketAddr::from(([0, 0, 0, 0], FILE_SERVER_PORT)))]
    listen_addr: SocketAddr,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the version and exit
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Version) = cli.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_tracing(TelemetryConfig::from_env("local-volume-fileserver")?)?;

    let namespace = cli
        .namespace
        .filter(|ns| !ns.is_empty())
        .ok_or_else(|| anyhow::anyhow!("VELERO_NAMESPACE must be set"))?;

    let metadata = std::fs::metadata(&cli.mount_point)
        .with_context(|| format!("mount point {} is not accessible", cli.mount_point.display()))?;
    if !metadata.is_dir() {
        anyhow::bail!("mount point {} is not a directory", cli.mount_point.display());
    }

    let client = KubeClusterClient::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let signer = UrlSigner::new(SigningKeyStore::new(Arc::new(client)));
    let router = file_server_router(FileServerState::new(signer, namespace.clone()), &cli.mount_point);

    let listener = TcpListener::bind(cli.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen_addr))?;
    info!(
        addr = %cli.listen_addr,
        mount_point = %cli.mount_point.display(),
        namespace = %namespace,
        "file server listening"
    );

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("file server failed")?;

    info!("file server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}
