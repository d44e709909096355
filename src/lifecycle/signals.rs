//! OS signal handling.
//!
//! # Responsibilities
//! - Name the signals a shutdown can be configured to listen for
//! - Register signal handlers through Tokio
//! - Forward every delivery to the shutdown controller
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - Repeated SIGTERM/SIGINT deliveries are coalesced by the controller
//! - Non-Unix targets only support SIGINT (Ctrl-C)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::lifecycle::shutdown::ShutdownController;

/// A signal that can start the shutdown sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Signal {
    Term,
    Int,
    Hup,
    Quit,
    Usr1,
    Usr2,
}

impl Signal {
    /// Signals listened for when none are configured.
    pub const DEFAULT: [Signal; 2] = [Signal::Term, Signal::Int];

    /// Conventional name, e.g. `SIGTERM`.
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Term => "SIGTERM",
            Signal::Int => "SIGINT",
            Signal::Hup => "SIGHUP",
            Signal::Quit => "SIGQUIT",
            Signal::Usr1 => "SIGUSR1",
            Signal::Usr2 => "SIGUSR2",
        }
    }

    #[cfg(unix)]
    fn kind(&self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;
        match self {
            Signal::Term => SignalKind::terminate(),
            Signal::Int => SignalKind::interrupt(),
            Signal::Hup => SignalKind::hangup(),
            Signal::Quit => SignalKind::quit(),
            Signal::Usr1 => SignalKind::user_defined1(),
            Signal::Usr2 => SignalKind::user_defined2(),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A signal name that is not one of the supported signals.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Unknown signal name: {0}")]
pub struct UnknownSignal(pub String);

impl FromStr for Signal {
    type Err = UnknownSignal;

    /// Accepts `SIGTERM`, `TERM` and `term` alike.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("SIG").unwrap_or(&upper);
        match bare {
            "TERM" => Ok(Signal::Term),
            "INT" => Ok(Signal::Int),
            "HUP" => Ok(Signal::Hup),
            "QUIT" => Ok(Signal::Quit),
            "USR1" => Ok(Signal::Usr1),
            "USR2" => Ok(Signal::Usr2),
            _ => Err(UnknownSignal(s.to_string())),
        }
    }
}

impl TryFrom<String> for Signal {
    type Error = UnknownSignal;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Signal> for String {
    fn from(signal: Signal) -> Self {
        signal.name().to_string()
    }
}

/// A registered handler for one OS signal.
///
/// Registration happens in [`SignalListener::register`], so a failure surfaces
/// before any task is spawned.
pub struct SignalListener {
    signal: Signal,
    #[cfg(unix)]
    inner: tokio::signal::unix::Signal,
}

impl SignalListener {
    /// Register a handler. Must be called from within a Tokio runtime.
    #[cfg(unix)]
    pub fn register(signal: Signal) -> std::io::Result<Self> {
        let inner = tokio::signal::unix::signal(signal.kind())?;
        Ok(Self { signal, inner })
    }

    /// Register a handler. Must be called from within a Tokio runtime.
    #[cfg(not(unix))]
    pub fn register(signal: Signal) -> std::io::Result<Self> {
        match signal {
            Signal::Int => Ok(Self { signal }),
            other => Err(std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                format!("{other} is not supported on this platform"),
            )),
        }
    }

    pub fn signal(&self) -> Signal {
        self.signal
    }

    /// Wait for the next delivery. `None` once no more can arrive.
    #[cfg(unix)]
    pub async fn recv(&mut self) -> Option<()> {
        self.inner.recv().await
    }

    /// Wait for the next delivery. `None` once no more can arrive.
    #[cfg(not(unix))]
    pub async fn recv(&mut self) -> Option<()> {
        tokio::signal::ctrl_c().await.ok()
    }
}

/// Forward every delivery of `listener`'s signal to `controller` until the
/// controller reaches `Closed`.
pub(crate) async fn forward(mut listener: SignalListener, controller: ShutdownController) {
    let signal = listener.signal();
    tracing::debug!(signal = %signal, "Signal handler registered");

    loop {
        tokio::select! {
            delivered = listener.recv() => {
                if delivered.is_none() {
                    tracing::debug!(signal = %signal, "Signal stream ended");
                    break;
                }
                tracing::info!(signal = %signal, "Received signal");
                controller.shutdown_on_signal(signal);
            }
            _ = controller.wait_for_shutdown() => break,
        }
    }
}
