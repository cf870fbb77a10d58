//! skymirror node binary.
//!
//! Runs the data layer of a flight-tracking node: an embedded leaf hosting the
//! in-memory mirror, plus a direct connection to the remote store. The node
//! logs mirror replication status until it receives SIGINT or SIGTERM.
//!
//! Configuration layers: Environment < TOML < CLI args.
//!
//! # Usage
//!
//! ```bash
//! # Mirror a local development server
//! skymirror-node --remote-url tcp://127.0.0.1:4222
//!
//! # Load settings from a file and warm the mirror before serving
//! skymirror-node --config /etc/skymirror/node.toml --warmup
//!
//! # Environment variables
//! export SKYMIRROR_REMOTE_URL=tcp://store.internal:4222
//! export SKYMIRROR_CREDENTIALS_FILE=/etc/skymirror/node.creds
//! skymirror-node
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use skymirror::Client;
use skymirror::ClientConfig;
use skymirror_leaf::MirrorPhase;
use tokio::signal;
use tracing::error;
use tracing::info;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "skymirror-node")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// URL of the remote store (`tcp://host:port`).
    #[arg(long)]
    remote_url: Option<String>,

    /// Credentials file for the remote store.
    #[arg(long)]
    credentials_file: Option<PathBuf>,

    /// URL the embedded leaf replicates from. Defaults to the remote URL.
    #[arg(long)]
    leaf_url: Option<String>,

    /// Copy remote entries into the mirror before serving.
    #[arg(long)]
    warmup: bool,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn cli_config(args: &Args) -> ClientConfig {
    let mut config = ClientConfig::default();
    if let Some(url) = &args.remote_url {
        config.remote_url = url.clone();
    }
    config.credentials_file = args.credentials_file.clone();
    config.leaf_url = args.leaf_url.clone();
    config.warmup.enabled = args.warmup;
    config
}

fn load_config(args: &Args) -> Result<ClientConfig> {
    let mut config = ClientConfig::from_env();
    if let Some(path) = &args.config {
        config.merge(ClientConfig::from_toml_file(path)?);
    }
    config.merge(cli_config(args));
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config(&args).context("failed to load configuration")?;

    info!(
        remote_url = %config.remote_url,
        leaf_url = %config.leaf_url(),
        mirror = %config.mirror_bucket,
        source = %config.source_bucket,
        domain = %config.domain,
        "starting skymirror node"
    );
    let client = Client::connect(config.clone()).await.context("failed to bootstrap data layer")?;

    if config.warmup.enabled {
        let timeout = Duration::from_millis(config.warmup.timeout_ms);
        if let Err(err) = client.warm_up(&config.warmup.filter, timeout).await {
            client.shutdown().await;
            return Err(err).context("mirror warm-up failed");
        }
    }

    if let Some(mut status) = client.leaf().watch_mirror_status(&config.mirror_bucket) {
        tokio::spawn(async move {
            let mut last_phase = None;
            loop {
                let current = status.borrow_and_update().clone();
                if last_phase != Some(current.phase) {
                    match (&current.phase, &current.last_error) {
                        (MirrorPhase::Connecting, Some(last_error)) => {
                            warn!(reconnects = current.reconnects, error = %last_error, "mirror disconnected")
                        }
                        _ => info!(phase = ?current.phase, applied = current.applied, "mirror status"),
                    }
                    last_phase = Some(current.phase);
                }
                if status.changed().await.is_err() {
                    break;
                }
            }
        });
    }

    shutdown_signal().await;
    client.shutdown().await;
    info!(mirrored_keys = client.mirror().len(), "skymirror node stopped");
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
