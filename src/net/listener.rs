//! TCP listener implementation with backpressure.
//!
//! # Responsibilities
//! - Bind to configured address
//! - Accept incoming TCP connections
//! - Enforce max_connections limit via semaphore
//! - Stop accepting on request and release the listening socket
//! - Graceful handling of accept errors

use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Semaphore};

use crate::config::ListenerConfig;
use crate::lifecycle::{DrainError, DrainTarget};
use crate::net::connection::{ConnectionGuard, ConnectionTracker};
use crate::observability::metrics;

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// The configured address does not parse.
    #[error("Invalid bind address `{address}`: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Failed to bind to address.
    #[error("Failed to bind: {0}")]
    Bind(#[source] std::io::Error),

    /// Failed to accept connection.
    #[error("Failed to accept: {0}")]
    Accept(#[source] std::io::Error),
}

/// A freshly accepted, already tracked connection.
#[derive(Debug)]
pub struct Accepted {
    pub stream: TcpStream,
    pub peer_addr: SocketAddr,
    pub permit: ConnectionPermit,
    pub guard: ConnectionGuard,
}

/// A bounded TCP listener that limits concurrent connections.
///
/// Uses a semaphore to enforce `max_connections`. When the limit is reached,
/// new connections will wait until a slot becomes available.
pub struct Listener {
    /// The underlying TCP listener.
    inner: TcpListener,
    /// Configured maximum connections.
    max_connections: usize,
    /// Control side shared with the shutdown controller.
    handle: ListenerHandle,
}

impl Listener {
    /// Bind to the configured address with connection limits.
    pub async fn bind(config: &ListenerConfig) -> Result<Self, ListenerError> {
        let addr: SocketAddr =
            config
                .bind_address
                .parse()
                .map_err(|e: std::net::AddrParseError| ListenerError::InvalidAddress {
                    address: config.bind_address.clone(),
                    reason: e.to_string(),
                })?;

        let listener = TcpListener::bind(addr).await.map_err(ListenerError::Bind)?;
        Self::from_tcp(listener, config.max_connections)
    }

    /// Wrap an already bound listener.
    pub fn from_tcp(listener: TcpListener, max_connections: usize) -> Result<Self, ListenerError> {
        let local_addr = listener.local_addr().map_err(ListenerError::Bind)?;

        tracing::info!(
            address = %local_addr,
            max_connections,
            "Listener bound"
        );

        let (accepting, _) = watch::channel(true);
        Ok(Self {
            inner: listener,
            max_connections,
            handle: ListenerHandle {
                accepting: Arc::new(accepting),
                connection_limit: Arc::new(Semaphore::new(max_connections)),
                tracker: ConnectionTracker::new(),
                local_addr,
            },
        })
    }

    /// Accept a new connection, respecting the connection limit.
    ///
    /// This will wait if the connection limit has been reached. Returns `None`
    /// once the listener has been told to stop accepting; the caller should
    /// then drop the listener to release the socket.
    pub async fn accept(&self) -> Option<Result<Accepted, ListenerError>> {
        let mut accepting = self.handle.accepting.subscribe();
        if !*accepting.borrow_and_update() {
            return None;
        }

        tokio::select! {
            biased;
            _ = accepting.wait_for(|accepting| !*accepting) => None,
            accepted = self.accept_tracked() => accepted,
        }
    }

    async fn accept_tracked(&self) -> Option<Result<Accepted, ListenerError>> {
        // Acquire permit first (backpressure). The semaphore is closed when
        // accepting stops.
        let permit = Arc::clone(&self.handle.connection_limit)
            .acquire_owned()
            .await
            .ok()?;

        let (stream, peer_addr) = match self.inner.accept().await {
            Ok(accepted) => accepted,
            Err(e) => return Some(Err(ListenerError::Accept(e))),
        };
        let guard = self.handle.tracker.track();
        metrics::record_connection_accepted();

        tracing::debug!(
            peer_addr = %peer_addr,
            connection_id = %guard.id(),
            available_permits = self.handle.connection_limit.available_permits(),
            "Connection accepted"
        );

        Some(Ok(Accepted {
            stream,
            peer_addr,
            permit: ConnectionPermit { _permit: permit },
            guard,
        }))
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    /// Get current available connection slots.
    pub fn available_permits(&self) -> usize {
        self.handle.connection_limit.available_permits()
    }

    /// Get configured maximum connections.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Tracker holding every connection this listener accepted.
    pub fn tracker(&self) -> &ConnectionTracker {
        &self.handle.tracker
    }

    /// Control handle, usable after the listener has moved into its accept loop.
    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }
}

/// Control side of a [`Listener`]: stops accepting and drains its connections.
#[derive(Clone)]
pub struct ListenerHandle {
    accepting: Arc<watch::Sender<bool>>,
    connection_limit: Arc<Semaphore>,
    tracker: ConnectionTracker,
    local_addr: SocketAddr,
}

impl ListenerHandle {
    pub fn is_accepting(&self) -> bool {
        *self.accepting.borrow()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn tracker(&self) -> &ConnectionTracker {
        &self.tracker
    }
}

impl DrainTarget for ListenerHandle {
    fn stop_accepting(&self) {
        if self.accepting.send_replace(false) {
            self.connection_limit.close();
            tracing::info!(address = %self.local_addr, "Listener stopped accepting");
        }
    }

    fn close_idle(&self) -> usize {
        self.tracker.begin_drain()
    }

    fn connections(&self) -> watch::Receiver<usize> {
        self.tracker.subscribe_count()
    }

    fn force_close_all(&self) -> Result<usize, DrainError> {
        self.tracker.abort_all()
    }
}

/// A permit representing a connection slot.
///
/// When dropped, the connection slot is released back to the pool.
/// This ensures backpressure is maintained even if the connection handler panics.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: tokio::sync::OwnedSemaphorePermit,
}
