//! Graceful shutdown for network listeners.
//!
//! A [`ShutdownController`] is installed on a [`DrainTarget`] (normally a
//! [`net::ListenerHandle`]). The first trigger, whether an OS signal, a fault
//! or an explicit request, stops accepting, closes idle connections and gives
//! the rest a grace period before they are forced closed.
//!
//! ```text
//!   Running ──trigger──▶ Draining ──all closed / deadline──▶ Closed
//! ```

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::schema::ServerConfig;
pub use http::HttpServer;
pub use lifecycle::{
    DrainError, DrainFault, DrainOutcome, DrainTarget, ShutdownController, ShutdownError,
    ShutdownOptions, ShutdownReason, ShutdownReport, ShutdownState, Signal, TriggerOutcome,
};
