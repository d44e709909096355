//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Validate config → Bind listener → Install controller → Serve
//!
//! Shutdown (shutdown.rs):
//!     Trigger → Draining → Stop accepting → Drain connections → Closed
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT (configurable) → trigger graceful shutdown
//! ```
//!
//! # Design Decisions
//! - Ordered startup: config first, then listener, then controller
//! - Ordered shutdown: stop accept, drain, close
//! - Shutdown has timeout: forced close after deadline

pub mod error;
pub mod shutdown;
pub mod signals;
pub mod startup;

pub use error::{DrainError, DrainFault, ShutdownError};
pub use shutdown::{
    in_shutdown_callback, DrainOutcome, DrainTarget, ShutdownController, ShutdownOptions,
    ShutdownReason, ShutdownReport, ShutdownState, TriggerOutcome,
};
pub use signals::Signal;
pub use startup::{install_panic_hook, Started, StartupError};
