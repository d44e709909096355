//! Startup orchestration.
//!
//! # Responsibilities
//! - Validate configuration
//! - Bind the listener and install the shutdown controller on it
//! - Start the accept loop and begin accepting traffic
//! - Turn a crashed accept loop into a fault-triggered shutdown
//!
//! # Design Decisions
//! - Fail fast: any startup error is fatal
//! - Subsystems initialize in order, not concurrently
//! - The controller is installed before the first accept, so a signal can
//!   never arrive at a listener nobody will drain

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::config::{validate_config, ConfigError, ServerConfig};
use crate::http::HttpServer;
use crate::lifecycle::error::{DrainFault, ShutdownError};
use crate::lifecycle::shutdown::{
    in_shutdown_callback, ShutdownController, ShutdownOptions, ShutdownReport,
};
use crate::net::listener::{Listener, ListenerError};
use crate::observability::metrics;

/// Everything that can stop the server from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Listener(#[from] ListenerError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
}

/// A running server.
#[derive(Debug)]
pub struct Started {
    local_addr: SocketAddr,
    controller: ShutdownController,
    accept_loop: JoinHandle<()>,
}

impl Started {
    /// Address the listener is bound to (useful when binding port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn controller(&self) -> &ShutdownController {
        &self.controller
    }

    /// Wait until the controller is closed and the accept loop has exited.
    pub async fn wait(self) -> ShutdownReport {
        let report = self.controller.wait_for_shutdown().await;
        // Already returned: accepting stops before the controller closes.
        let _ = self.accept_loop.await;
        report
    }
}

/// Bind, install and serve. Returns as soon as the server is accepting.
pub async fn start(
    config: ServerConfig,
    controller: ShutdownController,
    options: ShutdownOptions,
) -> Result<Started, StartupError> {
    validate_config(&config).map_err(ConfigError::Validation)?;

    let listener = Listener::bind(&config.listener).await?;
    let local_addr = listener.local_addr();
    controller.install(Arc::new(listener.handle()), options)?;

    let server = HttpServer::new(config, controller.clone());
    let supervised = supervise(controller.clone(), tokio::spawn(server.run(listener)));

    tracing::info!(address = %local_addr, "Server started");
    Ok(Started {
        local_addr,
        controller,
        accept_loop: supervised,
    })
}

/// Turn a crashed or cancelled task into a fault-triggered shutdown.
fn supervise(controller: ShutdownController, task: JoinHandle<()>) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Accept loop crashed");
            controller.shutdown_on_fault(DrainFault::new(e));
        }
    })
}

/// Route every panic in the process into `shutdown_on_fault`.
///
/// The trigger runs on `runtime` rather than inside the hook, so callbacks
/// never execute while a panic is being processed. Panics raised by the
/// controller's own callbacks are not fed back in.
pub fn install_panic_hook(controller: ShutdownController, runtime: Handle) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        if in_shutdown_callback() {
            return;
        }
        let fault = DrainFault::msg(info.to_string());
        let controller = controller.clone();
        runtime.spawn(async move {
            controller.shutdown_on_fault(fault);
        });
    }));
}

/// Start with options derived from config and run until shut down.
pub async fn run(
    config: ServerConfig,
    controller: ShutdownController,
) -> Result<ShutdownReport, StartupError> {
    let options = ShutdownOptions::from_config(&config.shutdown)
        .on_draining(|| tracing::info!("Readiness withdrawn, draining"))
        .on_drain_error(|_| metrics::record_drain_fault());

    let started = start(config, controller, options).await?;
    Ok(started.wait().await)
}
