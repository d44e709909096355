//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track connection state (Idle ⇄ Busy → Draining)
//! - Generate unique connection IDs for tracing
//! - Coordinate graceful shutdown per-connection
//! - Abort connections that outlive the grace period

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::lifecycle::DrainError;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Using relaxed ordering is sufficient since we only need uniqueness, not synchronization.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Open with no request being processed.
    Idle,
    /// Processing at least one request.
    Busy,
    /// Told to close once its current response is written.
    Draining,
}

/// Request accounting shared between a connection and its request service.
#[derive(Debug, Default)]
struct Activity {
    in_flight: AtomicUsize,
    started: AtomicUsize,
}

struct ConnectionEntry {
    activity: Arc<Activity>,
    abort: Option<AbortHandle>,
}

struct TrackerInner {
    connections: Mutex<HashMap<ConnectionId, ConnectionEntry>>,
    count: watch::Sender<usize>,
    draining: watch::Sender<bool>,
    forced: AtomicBool,
}

impl TrackerInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<ConnectionId, ConnectionEntry>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Tracks open connections for graceful shutdown.
///
/// The open count is published on a watch channel so a drain can wait for
/// it to reach zero without polling.
#[derive(Clone)]
pub struct ConnectionTracker {
    inner: Arc<TrackerInner>,
}

impl ConnectionTracker {
    /// Create a new connection tracker.
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        let (draining, _) = watch::channel(false);
        Self {
            inner: Arc::new(TrackerInner {
                connections: Mutex::new(HashMap::new()),
                count,
                draining,
                forced: AtomicBool::new(false),
            }),
        }
    }

    /// Record a new open connection. Returns a guard that unregisters on drop.
    pub fn track(&self) -> ConnectionGuard {
        let id = ConnectionId::new();
        let activity = Arc::new(Activity::default());
        {
            let mut registry = self.inner.registry();
            registry.insert(
                id,
                ConnectionEntry {
                    activity: Arc::clone(&activity),
                    abort: None,
                },
            );
            let open = registry.len();
            self.inner.count.send_replace(open);
            metrics::record_active_connections(open);
        }
        tracing::trace!(connection_id = %id, "Connection opened");

        ConnectionGuard {
            id,
            tracker: Arc::clone(&self.inner),
            activity,
            drain: self.inner.draining.subscribe(),
        }
    }

    /// Attach the task serving a connection so it can be aborted later.
    ///
    /// If a forced close already happened the task is aborted right away.
    pub fn attach(&self, id: ConnectionId, handle: AbortHandle) {
        let mut registry = self.inner.registry();
        if self.inner.forced.load(Ordering::Acquire) {
            handle.abort();
            return;
        }
        if let Some(entry) = registry.get_mut(&id) {
            entry.abort = Some(handle);
        }
    }

    /// Get current open connection count.
    pub fn active_count(&self) -> usize {
        *self.inner.count.borrow()
    }

    /// Connections with no request in flight.
    pub fn idle_count(&self) -> usize {
        self.inner
            .registry()
            .values()
            .filter(|entry| entry.activity.in_flight.load(Ordering::Acquire) == 0)
            .count()
    }

    /// Watch the open connection count.
    pub fn subscribe_count(&self) -> watch::Receiver<usize> {
        self.inner.count.subscribe()
    }

    pub fn is_draining(&self) -> bool {
        *self.inner.draining.borrow()
    }

    /// Tell every connection to wind down. Idle ones close immediately, busy
    /// ones after their current response. Returns how many were idle.
    pub fn begin_drain(&self) -> usize {
        let idle = self.idle_count();
        self.inner.draining.send_replace(true);
        tracing::debug!(
            idle,
            open = self.active_count(),
            "Drain notice sent to connections"
        );
        idle
    }

    /// Abort every connection task still registered.
    pub fn abort_all(&self) -> Result<usize, DrainError> {
        let registry = self
            .inner
            .connections
            .lock()
            .map_err(|_| DrainError::ForceClose("connection registry poisoned".to_string()))?;
        // Set under the lock so a concurrent `attach` cannot slip past it.
        self.inner.forced.store(true, Ordering::Release);

        let mut aborted = 0;
        for (id, entry) in registry.iter() {
            if let Some(handle) = &entry.abort {
                handle.abort();
                aborted += 1;
                tracing::debug!(connection_id = %id, "Connection aborted");
            }
        }
        metrics::record_forced_closes(aborted);
        Ok(aborted)
    }

    /// Wait until all connections are closed.
    pub async fn wait_for_shutdown(&self) {
        let mut count = self.inner.count.subscribe();
        let _ = count.wait_for(|open| *open == 0).await;
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that tracks a connection's lifetime.
/// Unregisters the connection when dropped.
pub struct ConnectionGuard {
    id: ConnectionId,
    tracker: Arc<TrackerInner>,
    activity: Arc<Activity>,
    drain: watch::Receiver<bool>,
}

impl ConnectionGuard {
    /// Get this connection's ID.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Counter shared with the request service of this connection.
    pub fn requests(&self) -> RequestCounter {
        RequestCounter {
            activity: Arc::clone(&self.activity),
        }
    }

    /// Receiver that flips to `true` when the connection should wind down.
    pub fn drain_notice(&self) -> watch::Receiver<bool> {
        self.drain.clone()
    }

    pub fn state(&self) -> ConnectionState {
        if *self.drain.borrow() {
            ConnectionState::Draining
        } else if self.activity.in_flight.load(Ordering::Acquire) > 0 {
            ConnectionState::Busy
        } else {
            ConnectionState::Idle
        }
    }
}

impl std::fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        // Published under the lock so concurrent drops cannot reorder counts.
        let mut registry = self.tracker.registry();
        registry.remove(&self.id);
        let open = registry.len();
        self.tracker.count.send_replace(open);
        drop(registry);
        metrics::record_active_connections(open);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}

/// Counts requests on one connection.
#[derive(Debug, Clone)]
pub struct RequestCounter {
    activity: Arc<Activity>,
}

impl RequestCounter {
    /// Mark a request as started; it ends when the guard drops.
    pub fn begin(&self) -> RequestGuard {
        self.activity.started.fetch_add(1, Ordering::AcqRel);
        self.activity.in_flight.fetch_add(1, Ordering::AcqRel);
        RequestGuard {
            activity: Arc::clone(&self.activity),
        }
    }

    pub fn in_flight(&self) -> usize {
        self.activity.in_flight.load(Ordering::Acquire)
    }

    /// Requests started over the connection's lifetime.
    pub fn started(&self) -> usize {
        self.activity.started.load(Ordering::Acquire)
    }
}

/// Marks one request as in flight until dropped.
#[derive(Debug)]
pub struct RequestGuard {
    activity: Arc<Activity>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.activity.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}
