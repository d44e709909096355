//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with health, readiness and demo handlers
//! - Wire up middleware (tracing, timeout, request ID)
//! - Run the accept loop on a tracked `Listener`
//! - Serve each connection with hyper http/1.1 and honour drain notices

use axum::{
    extract::{Query, State},
    http::{HeaderMap, Method, Request, Uri},
    response::Response,
    routing::{any, get},
    Router,
};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::watch;
use tower::ServiceExt;
use tower_http::{
    request_id::{PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use crate::config::ServerConfig;
use crate::http::request::{request_id, MakeRequestUuid, X_REQUEST_ID};
use crate::http::response::{health_response, mark_connection_close};
use crate::lifecycle::ShutdownController;
use crate::net::listener::{Accepted, Listener};
use crate::net::ConnectionId;

/// Pause after a failed accept (e.g. EMFILE) before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub controller: ShutdownController,
}

/// HTTP server whose connections drain with the shutdown controller.
pub struct HttpServer {
    router: Router,
    config: ServerConfig,
    controller: ShutdownController,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: ServerConfig, controller: ShutdownController) -> Self {
        let state = AppState {
            controller: controller.clone(),
        };
        let router = Self::build_router(&config, state);
        Self {
            router,
            config,
            controller,
        }
    }

    /// Build the Axum router with all middleware layers.
    #[allow(deprecated)]
    fn build_router(config: &ServerConfig, state: AppState) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(health_handler))
            .route("/{*path}", any(demo_handler))
            .route("/", any(demo_handler))
            .with_state(state)
            .layer(TimeoutLayer::new(Duration::from_secs(config.timeouts.request_secs)))
            .layer(PropagateRequestIdLayer::new(X_REQUEST_ID))
            .layer(TraceLayer::new_for_http())
            .layer(SetRequestIdLayer::new(X_REQUEST_ID, MakeRequestUuid))
    }

    /// The router, for driving handlers without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }

    /// Run the accept loop until the listener is told to stop.
    ///
    /// Returns once the listening socket is closed; connections accepted
    /// before that keep running until they drain or are aborted.
    pub async fn run(self, listener: Listener) {
        let addr = listener.local_addr();
        let tracker = listener.tracker().clone();
        tracing::info!(address = %addr, "HTTP server starting");

        while let Some(accepted) = listener.accept().await {
            match accepted {
                Ok(accepted) => {
                    let id = accepted.guard.id();
                    let task = tokio::spawn(serve_connection(
                        accepted,
                        self.router.clone(),
                        self.controller.clone(),
                    ));
                    tracker.attach(id, task.abort_handle());
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }

        drop(listener);
        tracing::info!(
            address = %addr,
            open_connections = tracker.active_count(),
            "HTTP server stopped accepting"
        );
    }

    /// Get a reference to the config.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// Serve one connection until it closes, drains or is aborted.
async fn serve_connection(accepted: Accepted, router: Router, controller: ShutdownController) {
    let Accepted {
        stream,
        peer_addr,
        permit: _permit,
        guard,
    } = accepted;
    let id = guard.id();
    let requests = guard.requests();
    let drain = guard.drain_notice();

    let counter = requests.clone();
    let service = service_fn(move |request: Request<Incoming>| {
        let in_flight = counter.begin();
        let router = router.clone();
        let controller = controller.clone();
        async move {
            let mut response = router.oneshot(request).await?;
            // Checked after the handler so requests already running when the
            // drain starts are marked too.
            if controller.is_draining() {
                mark_connection_close(&mut response);
            }
            drop(in_flight);
            Ok::<_, Infallible>(response)
        }
    });

    let connection = http1::Builder::new().serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let drained = tokio::select! {
        result = connection.as_mut() => {
            log_connection_end(id, result);
            return;
        }
        requested = drain_requested(drain) => requested,
    };

    if drained && requests.started() == 0 {
        tracing::debug!(connection_id = %id, peer_addr = %peer_addr, "Closing idle connection");
        return;
    }
    if drained {
        tracing::debug!(
            connection_id = %id,
            in_flight = requests.in_flight(),
            "Draining connection"
        );
        connection.as_mut().graceful_shutdown();
    }
    log_connection_end(id, connection.await);
    drop(guard);
}

/// Resolves with `true` once a drain notice arrives, `false` if none can.
async fn drain_requested(mut notice: watch::Receiver<bool>) -> bool {
    notice.wait_for(|draining| *draining).await.is_ok()
}

fn log_connection_end(id: ConnectionId, result: Result<(), hyper::Error>) {
    match result {
        Ok(()) => tracing::trace!(connection_id = %id, "Connection finished"),
        Err(e) => tracing::debug!(connection_id = %id, error = %e, "Connection ended with error"),
    }
}

async fn health_handler(State(state): State<AppState>) -> Response {
    health_response(&state.controller)
}

#[derive(Debug, Default, Deserialize)]
struct DemoParams {
    /// Hold the response this long, to simulate slow in-flight work.
    delay_ms: Option<u64>,
}

async fn demo_handler(
    Query(params): Query<DemoParams>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> String {
    let id = request_id(&headers);

    if let Some(delay_ms) = params.delay_ms {
        tracing::debug!(request_id = %id, delay_ms, "Delaying response");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    format!("{} {} {}\n", method, uri.path(), id)
}
