//! skymirror server binary.
//!
//! Serves memory buckets over the skymirror wire protocol. Development and
//! test stand-in for the authoritative remote store: nodes read, watch and
//! mirror its buckets, and published fetch triggers are logged.
//!
//! # Usage
//!
//! ```bash
//! skymirror-server --listen 0.0.0.0:4222 --bucket flights --bucket users
//! SKYMIRROR_SERVER_TOKEN=secret skymirror-server
//! ```

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use skymirror::config::load_server_config;
use skymirror::config::validate_server_config;
use skymirror_transport::KvServer;
use skymirror_transport::KvServerConfig;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::error;
use tracing::info;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "skymirror-server")]
struct Args {
    /// Path to TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Socket address to listen on.
    #[arg(long, env = "SKYMIRROR_SERVER_LISTEN")]
    listen: Option<String>,

    /// Bucket to serve. Repeatable.
    #[arg(long = "bucket", env = "SKYMIRROR_SERVER_BUCKETS", value_delimiter = ',')]
    buckets: Vec<String>,

    /// Shared bearer token clients must present.
    #[arg(long, env = "SKYMIRROR_SERVER_TOKEN", hide_env_values = true)]
    token: Option<String>,
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).compact().init();
}

fn load_config(args: &Args) -> Result<KvServerConfig> {
    let mut config = match &args.config {
        Some(path) => load_server_config(path)?,
        None => KvServerConfig::default(),
    };
    if let Some(listen) = &args.listen {
        config.listen_addr = listen.clone();
    }
    if !args.buckets.is_empty() {
        config.buckets = args.buckets.clone();
    }
    if args.token.is_some() {
        config.token = args.token.clone();
    }
    validate_server_config(&config)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();
    let config = load_config(&args).context("failed to load configuration")?;

    let server = KvServer::start(config).await.context("failed to start server")?;
    info!(url = %server.url(), "skymirror server ready");

    let mut published = server.subscribe_published();
    let log_published = tokio::spawn(async move {
        loop {
            match published.recv().await {
                Ok(message) => info!(
                    subject = %message.subject,
                    client = %message.client_name,
                    bytes = message.payload.len(),
                    "message published"
                ),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "published message log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    shutdown_signal().await;
    server.shutdown().await;
    log_published.abort();
    info!("skymirror server stopped");
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
