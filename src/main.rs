//! graceful-drain
//!
//! An HTTP server that shuts down without dropping in-flight requests.
//!
//! # Architecture Overview
//!
//! ```text
//!     SIGTERM / SIGINT ─┐
//!     panic hook ───────┼──▶ ShutdownController ──▶ ListenerHandle (DrainTarget)
//!     request_shutdown ─┘          │                    │
//!                                  │                    ├─ stop accepting
//!                                  │                    ├─ close idle connections
//!                                  ▼                    └─ abort the rest at deadline
//!                           ShutdownReport
//!
//!     Client ──▶ net::Listener ──▶ http::server (hyper + Axum) ──▶ handler
//! ```

use clap::Parser;
use std::path::PathBuf;

use graceful_drain::config::{load_config, ServerConfig};
use graceful_drain::lifecycle::startup;
use graceful_drain::observability::{logging, metrics};
use graceful_drain::ShutdownController;

#[derive(Parser)]
#[command(name = "graceful-drain")]
#[command(about = "HTTP server with graceful connection draining", long_about = None)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override listener.bind_address
    #[arg(short, long)]
    bind: Option<String>,

    /// Override shutdown.grace_period_ms
    #[arg(short, long)]
    grace_period_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.listener.bind_address = bind;
    }
    if let Some(grace_period_ms) = args.grace_period_ms {
        config.shutdown.grace_period_ms = grace_period_ms;
    }

    logging::init_logging(&config.observability)?;
    tracing::info!("graceful-drain v{} starting", env!("CARGO_PKG_VERSION"));

    tracing::info!(
        bind_address = %config.listener.bind_address,
        max_connections = config.listener.max_connections,
        grace_period_ms = config.shutdown.grace_period_ms,
        signals = ?config.shutdown.signals,
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        if let Ok(addr) = config.observability.metrics_address.parse() {
            metrics::init_metrics(addr);
        } else {
            tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            );
        }
    }

    let controller = ShutdownController::new();
    startup::install_panic_hook(controller.clone(), tokio::runtime::Handle::current());

    let report = startup::run(config, controller).await?;
    tracing::info!(
        reason = %report.reason,
        outcome = report.outcome.as_str(),
        forced = report.forced,
        "Exiting"
    );

    if report.reason.is_fault() {
        std::process::exit(1);
    }
    Ok(())
}
