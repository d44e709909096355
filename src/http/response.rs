//! Response handling and transformation.
//!
//! # Responsibilities
//! - Mark responses for connection closure while draining
//! - Build health and readiness bodies
//!
//! # Design Decisions
//! - `Connection: close` is added to every response produced once draining has
//!   begun, so clients stop reusing the connection
//! - Health reports 503 while draining so load balancers stop routing here

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::lifecycle::{ShutdownController, ShutdownState};

/// Ask the client to close the connection after this response.
pub fn mark_connection_close(response: &mut Response) {
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
}

/// Body of the health and readiness endpoints.
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub state: ShutdownState,
    pub active_connections: usize,
}

/// 200 while running, 503 once draining.
pub fn health_response(controller: &ShutdownController) -> Response {
    let state = controller.state();
    let (code, status) = if controller.is_draining() {
        (StatusCode::SERVICE_UNAVAILABLE, "draining")
    } else {
        (StatusCode::OK, "ok")
    };

    let body = HealthStatus {
        status,
        state,
        active_connections: controller.active_connections(),
    };
    (code, Json(body)).into_response()
}
