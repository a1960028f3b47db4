//! Local Volume Provider - velero object store plugin entry point

use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use local_volume_provider::cluster::KubeClusterClient;
use local_volume_provider::object_store::LocalVolumeObjectStore;
use local_volume_provider::reconcile::EnsureOutcome;
use local_volume_provider::telemetry::{init_tracing, TelemetryConfig};
use local_volume_provider::volume::VolumeType;
use local_volume_provider::DEFAULT_VOLUME_ROOT;

/// Velero object store backed by a hostpath, NFS export, or PVC
#[derive(Parser, Debug)]
#[command(name = "local-volume-provider", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a backup storage location
    ///
    /// Lays out the bucket directory, mounts the volume into the velero
    /// deployment (and restic daemonset, if present), and adds the file
    /// server sidecar. Safe to run repeatedly.
    Init(InitArgs),

    /// Print a signed URL for an object on the file server
    SignUrl(SignUrlArgs),

    /// Print the version and exit
    Version,
}

/// Settings shared by every subcommand that talks to the cluster
#[derive(Parser, Debug)]
struct StoreArgs {
    /// Volume type backing the storage location (`nfs` or `replicated.com/nfs`)
    #[arg(long = "volume-type", short = 't')]
    volume_type: VolumeType,

    /// Namespace velero runs in
    #[arg(long, env = "VELERO_NAMESPACE")]
    namespace: String,

    /// Directory buckets are mounted under
    #[arg(long, env = "VOLUME_ROOT", default_value = DEFAULT_VOLUME_ROOT)]
    volume_root: PathBuf,
}

/// Init arguments
#[derive(Parser, Debug)]
struct InitArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Storage location config entry, repeatable (e.g. `--config bucket=backups`)
    #[arg(long = "config", short = 'c', value_parser = parse_key_val)]
    config: Vec<(String, String)>,
}

/// Sign-url arguments
#[derive(Parser, Debug)]
struct SignUrlArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Bucket holding the object
    #[arg(long)]
    bucket: String,

    /// Object key inside the bucket
    #[arg(long)]
    key: String,

    /// How long the URL stays valid, in seconds
    #[arg(long, default_value = "600")]
    ttl_secs: u64,

    /// IP of the velero pod running the file server
    #[arg(long, env = "POD_IP")]
    pod_ip: String,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got {:?}", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    init_tracing(TelemetryConfig::from_env("local-volume-provider")?)?;

    match cli.command {
        Commands::Init(args) => run_init(args).await,
        Commands::SignUrl(args) => run_sign_url(args).await,
        Commands::Version => Ok(()),
    }
}

async fn object_store(args: &StoreArgs) -> anyhow::Result<LocalVolumeObjectStore> {
    let client = KubeClusterClient::try_default()
        .await
        .context("failed to create kubernetes client")?;
    Ok(
        LocalVolumeObjectStore::new(Arc::new(client), args.volume_type, args.namespace.clone())
            .with_root(args.volume_root.clone()),
    )
}

/// Run the object store init workflow
async fn run_init(args: InitArgs) -> anyhow::Result<()> {
    let config: BTreeMap<String, String> = args.config.into_iter().collect();
    let store = object_store(&args.store).await?;

    match store.init(&config).await? {
        EnsureOutcome::Applied => info!(
            bucket = config.get("bucket").map(String::as_str).unwrap_or_default(),
            "storage location initialized"
        ),
        EnsureOutcome::SkippedNotPreserved => info!(
            bucket = config.get("bucket").map(String::as_str).unwrap_or_default(),
            "storage location skipped by preserveVolumes"
        ),
    }
    Ok(())
}

/// Mint a signed URL and print it on stdout
async fn run_sign_url(args: SignUrlArgs) -> anyhow::Result<()> {
    let store = object_store(&args.store)
        .await?
        .with_pod_ip(args.pod_ip);

    let url = store
        .create_signed_url(&args.bucket, &args.key, Duration::from_secs(args.ttl_secs))
        .await?;

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", url)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn key_val_parsing() {
        assert_eq!(
            parse_key_val("bucket=backups").unwrap(),
            ("bucket".to_string(), "backups".to_string())
        );
        assert_eq!(
            parse_key_val("path=/a=b").unwrap(),
            ("path".to_string(), "/a=b".to_string())
        );
        assert!(parse_key_val("no-separator").is_err());
        assert!(parse_key_val("=value").is_err());
    }

    #[test]
    fn init_collects_repeated_config() {
        let cli = Cli::try_parse_from([
            "local-volume-provider",
            "init",
            "--volume-type",
            "nfs",
            "--namespace",
            "velero",
            "-c",
            "bucket=b",
            "-c",
            "server=10.0.0.1",
        ])
        .unwrap();

        match cli.command {
            Commands::Init(args) => {
                assert_eq!(args.store.volume_type, VolumeType::Nfs);
                assert_eq!(args.config.len(), 2);
            }
            other => panic!("Expected init, got {:?}", other),
        }
    }
}
