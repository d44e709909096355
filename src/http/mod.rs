//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Tracked TCP connection
//!     → server.rs (hyper http/1.1, Axum router, drain notices)
//!     → request.rs (request ID generation and lookup)
//!     → handler
//!     → response.rs (Connection: close while draining, health bodies)
//!     → Send to client
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{request_id, MakeRequestUuid, X_REQUEST_ID};
pub use response::{health_response, mark_connection_close, HealthStatus};
pub use server::{AppState, HttpServer};
