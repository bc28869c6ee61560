//! Launchpad server binary.
//!
//! Runs the HTTP API, the log ingestion consumers and the stale-deployment
//! reaper in a single process.

use clap::{Parser, ValueEnum};
use launchpad_control::ControlConfig;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod services;

use services::Services;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Launchpad deployment control plane.
#[derive(Parser, Debug)]
#[command(name = "launchpad-server")]
#[command(about = "Run the launchpad control plane")]
#[command(version)]
struct Cli {
    /// Path to configuration file.
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialise tracing
    let filter = if cli.verbose {
        "debug,hyper=info,tower=info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
    }

    info!("launchpad server starting");

    let config = match cli.config.as_deref() {
        Some(path) => ControlConfig::from_file(path)?,
        None => ControlConfig::load()?,
    };

    info!(
        listen = %config.server.listen,
        storage = ?config.storage.backend,
        stream = ?config.stream.backend,
        partitions = config.stream.partitions,
        reaper_enabled = config.reaper.enabled,
        webhook_secret = config.webhook.secret.is_some(),
        "configuration loaded"
    );

    let mut services = Services::start(config).await?;

    // Set up signal handlers
    let cancel = services.cancel_token();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    // Wait for a signal or an unexpected exit, then drain everything
    services.wait().await;
    services.shutdown().await;

    info!("launchpad server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            info!("received SIGTERM, initiating shutdown");
        }
    }
}
