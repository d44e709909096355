//! Shutdown coordination for a network listener.
//!
//! # State Machine
//! ```text
//! Running ──trigger──▶ Draining ──all connections closed──▶ Closed
//!                          │                                  ▲
//!                          └──────────deadline elapsed────────┘
//! ```
//!
//! # Sequence
//! 1. Capture the reason and flip to `Draining` (atomic, first trigger wins)
//! 2. Run `on_draining`
//! 3. Stop accepting, close idle connections
//! 4. Race "connection count hits zero" against the deadline
//! 5. Abort whatever is still open, publish `Closed`, then report faults
//!
//! Later triggers are coalesced: they never restart the sequence and never
//! replace the captured reason.

use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::Serialize;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::ShutdownConfig;
use crate::lifecycle::error::{DrainError, DrainFault, ShutdownError};
use crate::lifecycle::signals::{self, Signal, SignalListener};
use crate::observability::metrics;

/// Something with a listening socket and a set of open connections that can
/// be drained.
pub trait DrainTarget: Send + Sync + 'static {
    /// Stop accepting new connections. Accepted connections stay open.
    fn stop_accepting(&self);

    /// Close idle connections now and ask busy ones to close once their
    /// current response is written. Returns how many were idle.
    fn close_idle(&self) -> usize;

    /// Live count of open connections.
    fn connections(&self) -> watch::Receiver<usize>;

    /// Abort every connection still open. Returns how many were aborted.
    fn force_close_all(&self) -> Result<usize, DrainError>;
}

/// Lifecycle state of a controller. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownState {
    Running,
    Draining,
    Closed,
}

impl ShutdownState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShutdownState::Running => "running",
            ShutdownState::Draining => "draining",
            ShutdownState::Closed => "closed",
        }
    }
}

impl fmt::Display for ShutdownState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a shutdown started.
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    /// An OS signal was delivered.
    Signal(Signal),
    /// The surrounding process observed an unrecoverable fault.
    Fault(DrainFault),
    /// Shutdown was requested programmatically.
    Requested(String),
}

impl ShutdownReason {
    pub fn fault(&self) -> Option<&DrainFault> {
        match self {
            ShutdownReason::Fault(fault) => Some(fault),
            _ => None,
        }
    }

    pub fn is_fault(&self) -> bool {
        self.fault().is_some()
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(signal) => write!(f, "signal {signal}"),
            ShutdownReason::Fault(fault) => write!(f, "fault: {fault}"),
            ShutdownReason::Requested(why) => write!(f, "requested: {why}"),
        }
    }
}

/// How the drain phase ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainOutcome {
    /// Every connection closed on its own before the deadline.
    Drained,
    /// The grace period ran out first.
    DeadlineElapsed,
}

impl DrainOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DrainOutcome::Drained => "drained",
            DrainOutcome::DeadlineElapsed => "deadline_elapsed",
        }
    }
}

/// Summary handed to everyone waiting on [`ShutdownController::wait_for_shutdown`].
#[derive(Debug, Clone)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    pub outcome: DrainOutcome,
    /// Connections aborted at the resolution point.
    pub forced: usize,
    /// Time from the trigger to `Closed`.
    pub elapsed: Duration,
}

/// Result of a call to [`ShutdownController::trigger_shutdown`].
#[derive(Debug, Clone)]
pub enum TriggerOutcome {
    /// This call started the shutdown sequence.
    Initiated,
    /// A shutdown was already draining; carries its reason.
    AlreadyDraining(ShutdownReason),
    /// A shutdown already finished; carries its reason.
    AlreadyClosed(ShutdownReason),
}

impl TriggerOutcome {
    pub fn is_initiated(&self) -> bool {
        matches!(self, TriggerOutcome::Initiated)
    }

    /// The reason of the shutdown that is actually running.
    pub fn existing_reason(&self) -> Option<&ShutdownReason> {
        match self {
            TriggerOutcome::Initiated => None,
            TriggerOutcome::AlreadyDraining(reason) | TriggerOutcome::AlreadyClosed(reason) => {
                Some(reason)
            }
        }
    }
}

pub type DrainingCallback = Arc<dyn Fn() + Send + Sync>;
pub type DrainErrorCallback = Arc<dyn Fn(&DrainFault) + Send + Sync>;

/// Options accepted by [`ShutdownController::install`].
#[derive(Clone)]
pub struct ShutdownOptions {
    /// How long in-flight work may take once draining starts.
    pub grace_period: Duration,
    /// Signals that trigger the shutdown. Empty means none are registered.
    pub signals: Vec<Signal>,
    on_draining: Option<DrainingCallback>,
    on_drain_error: Option<DrainErrorCallback>,
}

impl ShutdownOptions {
    /// Options with the default signal set.
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            signals: Signal::DEFAULT.to_vec(),
            on_draining: None,
            on_drain_error: None,
        }
    }

    pub fn from_config(config: &ShutdownConfig) -> Self {
        Self::new(Duration::from_millis(config.grace_period_ms))
            .with_signals(config.signals.iter().copied())
    }

    pub fn with_signals(mut self, signals: impl IntoIterator<Item = Signal>) -> Self {
        self.signals.clear();
        for signal in signals {
            if !self.signals.contains(&signal) {
                self.signals.push(signal);
            }
        }
        self
    }

    /// Register no OS signal handlers at all.
    pub fn without_signals(mut self) -> Self {
        self.signals.clear();
        self
    }

    /// Called synchronously when the controller enters `Draining`.
    pub fn on_draining<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_draining = Some(Arc::new(callback));
        self
    }

    /// Called with faults tied to the shutdown. A fault reason is reported
    /// after `Closed`; forced-close failures and late faults are reported too.
    pub fn on_drain_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&DrainFault) + Send + Sync + 'static,
    {
        self.on_drain_error = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for ShutdownOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownOptions")
            .field("grace_period", &self.grace_period)
            .field("signals", &self.signals)
            .field("on_draining", &self.on_draining.is_some())
            .field("on_drain_error", &self.on_drain_error.is_some())
            .finish()
    }
}

/// Internal phase; `Closed` carries the report so waiters read both at once.
#[derive(Debug, Clone)]
enum Phase {
    Running,
    Draining,
    Closed(Arc<ShutdownReport>),
}

impl Phase {
    fn state(&self) -> ShutdownState {
        match self {
            Phase::Running => ShutdownState::Running,
            Phase::Draining => ShutdownState::Draining,
            Phase::Closed(_) => ShutdownState::Closed,
        }
    }
}

struct Installation {
    target: Arc<dyn DrainTarget>,
    grace_period: Duration,
    on_draining: Option<DrainingCallback>,
    on_drain_error: Option<DrainErrorCallback>,
    runtime: Handle,
}

struct Inner {
    phase: watch::Sender<Phase>,
    reason: OnceLock<ShutdownReason>,
    drain_deadline: OnceLock<Instant>,
    installation: OnceLock<Installation>,
    install_claimed: AtomicBool,
    signal_handlers_installed: AtomicBool,
}

/// Coordinator for graceful shutdown of one listener.
///
/// Cloning is cheap; every clone drives the same state machine, so signal
/// handlers, fault hooks and health checks can each hold their own handle.
#[derive(Clone)]
pub struct ShutdownController {
    inner: Arc<Inner>,
}

impl ShutdownController {
    /// Create a controller in the `Running` state.
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Running);
        Self {
            inner: Arc::new(Inner {
                phase,
                reason: OnceLock::new(),
                drain_deadline: OnceLock::new(),
                installation: OnceLock::new(),
                install_claimed: AtomicBool::new(false),
                signal_handlers_installed: AtomicBool::new(false),
            }),
        }
    }

    /// Bind the controller to a drain target and register signal handlers.
    ///
    /// Must be called from within a Tokio runtime; the drain task and signal
    /// forwarders are spawned onto it. Fails if called twice, with a zero
    /// grace period, or after a shutdown has already begun.
    pub fn install(
        &self,
        target: Arc<dyn DrainTarget>,
        options: ShutdownOptions,
    ) -> Result<(), ShutdownError> {
        if options.grace_period.is_zero() {
            return Err(ShutdownError::Configuration(
                "grace period must be greater than zero".to_string(),
            ));
        }
        if self.is_draining() {
            return Err(ShutdownError::Configuration(
                "shutdown already initiated".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| {
            ShutdownError::Configuration(
                "install must be called from within a Tokio runtime".to_string(),
            )
        })?;

        if self
            .inner
            .install_claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ShutdownError::Configuration(
                "controller is already installed".to_string(),
            ));
        }

        let listeners = match register_signals(&options.signals) {
            Ok(listeners) => listeners,
            Err(e) => {
                self.inner.install_claimed.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let mut installation = Some(Installation {
            target,
            grace_period: options.grace_period,
            on_draining: options.on_draining,
            on_drain_error: options.on_drain_error,
            runtime: runtime.clone(),
        });
        // Published under the phase lock, so a trigger either sees the
        // installation or makes this install fail.
        let mut published = false;
        self.inner.phase.send_if_modified(|phase| {
            if matches!(phase, Phase::Running) {
                if let Some(installation) = installation.take() {
                    published = self.inner.installation.set(installation).is_ok();
                }
            }
            false
        });
        if !published {
            return Err(ShutdownError::Configuration(
                "shutdown already initiated".to_string(),
            ));
        }

        if !listeners.is_empty()
            && !self
                .inner
                .signal_handlers_installed
                .swap(true, Ordering::AcqRel)
        {
            for listener in listeners {
                runtime.spawn(signals::forward(listener, self.clone()));
            }
        }

        tracing::info!(
            grace_period_ms = options.grace_period.as_millis() as u64,
            signals = ?options.signals,
            "Shutdown controller installed"
        );
        Ok(())
    }

    /// True once a shutdown has been triggered, for the rest of the process.
    pub fn is_draining(&self) -> bool {
        !matches!(*self.inner.phase.borrow(), Phase::Running)
    }

    pub fn state(&self) -> ShutdownState {
        self.inner.phase.borrow().state()
    }

    /// The reason captured by the first trigger.
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.inner.reason.get().cloned()
    }

    /// Instant by which every connection will have been closed.
    pub fn drain_deadline(&self) -> Option<Instant> {
        self.inner.drain_deadline.get().copied()
    }

    /// Open connections as last reported by the drain target. Informational.
    pub fn active_connections(&self) -> usize {
        self.inner
            .installation
            .get()
            .map(|installation| *installation.target.connections().borrow())
            .unwrap_or(0)
    }

    pub fn signal_handlers_installed(&self) -> bool {
        self.inner.signal_handlers_installed.load(Ordering::Acquire)
    }

    /// Start the shutdown sequence, or observe the one already running.
    ///
    /// Never blocks and never fails. Only the first call (across all clones
    /// and threads) runs the sequence; the rest return the captured reason.
    pub fn trigger_shutdown(&self, reason: ShutdownReason) -> TriggerOutcome {
        let started = Instant::now();

        let mut pending = Some(reason);
        let won = self.inner.phase.send_if_modified(|phase| {
            if !matches!(phase, Phase::Running) {
                return false;
            }
            // Set under the channel lock so losing triggers always see them,
            // and so an install cannot slip in between.
            if let Some(reason) = pending.take() {
                let _ = self.inner.reason.set(reason);
            }
            if let Some(installation) = self.inner.installation.get() {
                let _ = self
                    .inner
                    .drain_deadline
                    .set(started + installation.grace_period);
            }
            *phase = Phase::Draining;
            true
        });

        if !won {
            return self.coalesce(pending);
        }

        let reason = self
            .inner
            .reason
            .get()
            .cloned()
            .unwrap_or_else(|| ShutdownReason::Requested("unknown".to_string()));
        metrics::record_shutdown_state(ShutdownState::Draining);

        let Some(installation) = self.inner.installation.get() else {
            tracing::warn!(reason = %reason, "Shutdown triggered before install, nothing to drain");
            self.finish(reason, DrainOutcome::Drained, 0, None, started);
            return TriggerOutcome::Initiated;
        };

        tracing::warn!(
            reason = %reason,
            grace_period_ms = installation.grace_period.as_millis() as u64,
            "Shutdown initiated, draining connections"
        );

        if let Some(callback) = &installation.on_draining {
            run_callback("on_draining", || callback());
        }

        installation.target.stop_accepting();
        let idle = installation.target.close_idle();
        tracing::info!(
            idle_closed = idle,
            open_connections = *installation.target.connections().borrow(),
            "Stopped accepting connections"
        );

        let deadline = started + installation.grace_period;
        let controller = self.clone();
        installation
            .runtime
            .spawn(async move { controller.drain(reason, deadline, started).await });

        TriggerOutcome::Initiated
    }

    /// Trigger shutdown because an OS signal was delivered.
    pub fn shutdown_on_signal(&self, signal: Signal) -> TriggerOutcome {
        self.trigger_shutdown(ShutdownReason::Signal(signal))
    }

    /// Trigger shutdown because of an unrecoverable fault.
    pub fn shutdown_on_fault(&self, fault: impl Into<DrainFault>) -> TriggerOutcome {
        self.trigger_shutdown(ShutdownReason::Fault(fault.into()))
    }

    /// Trigger shutdown programmatically.
    pub fn request_shutdown(&self, why: impl Into<String>) -> TriggerOutcome {
        self.trigger_shutdown(ShutdownReason::Requested(why.into()))
    }

    /// Resolve once the controller reaches `Closed`.
    ///
    /// Any number of callers may wait; all of them wake on the same
    /// transition.
    pub async fn wait_for_shutdown(&self) -> ShutdownReport {
        let mut phase = self.inner.phase.subscribe();
        let report = phase
            .wait_for(|phase| matches!(phase, Phase::Closed(_)))
            .await
            .ok()
            .and_then(|phase| match &*phase {
                Phase::Closed(report) => Some(Arc::clone(report)),
                _ => None,
            });

        match report {
            Some(report) => report.as_ref().clone(),
            // The sender lives in `inner`, which `self` keeps alive.
            None => std::future::pending().await,
        }
    }

    fn coalesce(&self, rejected: Option<ShutdownReason>) -> TriggerOutcome {
        let current = self
            .inner
            .reason
            .get()
            .cloned()
            .unwrap_or_else(|| ShutdownReason::Requested("unknown".to_string()));

        match rejected {
            Some(ShutdownReason::Fault(fault)) => {
                tracing::warn!(
                    error = %fault,
                    reason = %current,
                    "Fault reported while shutting down"
                );
                self.report_fault(&fault);
            }
            Some(other) => {
                tracing::debug!(
                    ignored = %other,
                    reason = %current,
                    "Shutdown already in progress, ignoring trigger"
                );
            }
            None => {}
        }

        match self.state() {
            ShutdownState::Closed => TriggerOutcome::AlreadyClosed(current),
            _ => TriggerOutcome::AlreadyDraining(current),
        }
    }

    async fn drain(self, reason: ShutdownReason, deadline: Instant, started: Instant) {
        let Some(installation) = self.inner.installation.get() else {
            return;
        };
        let mut connections = installation.target.connections();

        // First to complete wins; the other branch is dropped.
        let outcome = tokio::select! {
            biased;
            _ = connections.wait_for(|open| *open == 0) => DrainOutcome::Drained,
            _ = tokio::time::sleep_until(deadline) => DrainOutcome::DeadlineElapsed,
        };

        if outcome == DrainOutcome::DeadlineElapsed {
            tracing::warn!(
                open_connections = *connections.borrow(),
                "Grace period elapsed, forcing remaining connections closed"
            );
        }

        let (forced, close_error) = match installation.target.force_close_all() {
            Ok(forced) => (forced, None),
            Err(e) => (0, Some(DrainFault::from(e))),
        };

        self.finish(reason, outcome, forced, close_error, started);
    }

    fn finish(
        &self,
        reason: ShutdownReason,
        outcome: DrainOutcome,
        forced: usize,
        close_error: Option<DrainFault>,
        started: Instant,
    ) {
        let report = Arc::new(ShutdownReport {
            reason,
            outcome,
            forced,
            elapsed: started.elapsed(),
        });

        let closed = self.inner.phase.send_if_modified(|phase| {
            if !matches!(phase, Phase::Draining) {
                return false;
            }
            *phase = Phase::Closed(Arc::clone(&report));
            true
        });
        if !closed {
            return;
        }

        metrics::record_shutdown_state(ShutdownState::Closed);
        metrics::record_shutdown_complete(outcome.as_str(), report.elapsed);
        tracing::info!(
            reason = %report.reason,
            outcome = outcome.as_str(),
            forced,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Shutdown complete"
        );

        // Reported after the transition so nobody sees `Closed` late.
        if let Some(fault) = report.reason.fault() {
            self.report_fault(fault);
        }
        if let Some(fault) = close_error {
            tracing::error!(error = %fault, "Failed to force close connections");
            self.report_fault(&fault);
        }
    }

    fn report_fault(&self, fault: &DrainFault) {
        tracing::error!(error = %fault, "Shutdown fault");
        let callback = self
            .inner
            .installation
            .get()
            .and_then(|installation| installation.on_drain_error.as_ref());
        if let Some(callback) = callback {
            run_callback("on_drain_error", || callback(fault));
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownController")
            .field("state", &self.state())
            .field("reason", &self.inner.reason.get())
            .field("installed", &self.inner.installation.get().is_some())
            .finish()
    }
}

fn register_signals(signals: &[Signal]) -> Result<Vec<SignalListener>, ShutdownError> {
    signals
        .iter()
        .map(|&signal| {
            SignalListener::register(signal)
                .map_err(|source| ShutdownError::SignalRegistration { signal, source })
        })
        .collect()
}

thread_local! {
    static IN_CALLBACK: Cell<bool> = const { Cell::new(false) };
}

/// True while this thread is running an `on_draining` or `on_drain_error`
/// callback. Panic hooks use it to avoid feeding a callback's own panic back
/// into the controller.
pub fn in_shutdown_callback() -> bool {
    IN_CALLBACK.with(Cell::get)
}

/// A panicking callback must not stop the sequence from reaching `Closed`.
fn run_callback(name: &'static str, callback: impl FnOnce()) {
    let outer = IN_CALLBACK.with(|flag| flag.replace(true));
    let result = catch_unwind(AssertUnwindSafe(callback));
    IN_CALLBACK.with(|flag| flag.set(outer));
    if result.is_err() {
        tracing::error!(callback = name, "Shutdown callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// In-memory drain target that records what the controller asked of it.
    struct FakeTarget {
        open: watch::Sender<usize>,
        idle: AtomicUsize,
        calls: Mutex<Vec<&'static str>>,
        fail_force_close: bool,
    }

    impl FakeTarget {
        fn new(busy: usize, idle: usize) -> Arc<Self> {
            let (open, _) = watch::channel(busy + idle);
            Arc::new(Self {
                open,
                idle: AtomicUsize::new(idle),
                calls: Mutex::new(Vec::new()),
                fail_force_close: false,
            })
        }

        fn failing(busy: usize) -> Arc<Self> {
            let (open, _) = watch::channel(busy);
            Arc::new(Self {
                open,
                idle: AtomicUsize::new(0),
                calls: Mutex::new(Vec::new()),
                fail_force_close: true,
            })
        }

        /// A busy connection finishes its response and closes.
        fn finish_one(&self) {
            self.open.send_modify(|open| *open = open.saturating_sub(1));
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DrainTarget for FakeTarget {
        fn stop_accepting(&self) {
            self.calls.lock().unwrap().push("stop_accepting");
        }

        fn close_idle(&self) -> usize {
            self.calls.lock().unwrap().push("close_idle");
            let idle = self.idle.swap(0, Ordering::SeqCst);
            self.open.send_modify(|open| *open -= idle);
            idle
        }

        fn connections(&self) -> watch::Receiver<usize> {
            self.open.subscribe()
        }

        fn force_close_all(&self) -> Result<usize, DrainError> {
            self.calls.lock().unwrap().push("force_close_all");
            if self.fail_force_close {
                return Err(DrainError::ForceClose("socket already gone".into()));
            }
            Ok(self.open.send_replace(0))
        }
    }

    fn options(grace_ms: u64) -> ShutdownOptions {
        ShutdownOptions::new(Duration::from_millis(grace_ms)).without_signals()
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_bounds_a_connection_that_never_finishes() {
        let target = FakeTarget::new(1, 0);
        let controller = ShutdownController::new();
        controller.install(target.clone(), options(200)).unwrap();

        let start = Instant::now();
        assert!(controller.request_shutdown("test").is_initiated());
        let report = controller.wait_for_shutdown().await;

        assert_eq!(report.outcome, DrainOutcome::DeadlineElapsed);
        assert_eq!(report.forced, 1);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(210), "{elapsed:?}");
        assert_eq!(controller.drain_deadline(), Some(start + Duration::from_millis(200)));
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_early_when_connections_finish() {
        let target = FakeTarget::new(1, 0);
        let controller = ShutdownController::new();
        controller.install(target.clone(), options(200)).unwrap();

        let start = Instant::now();
        controller.request_shutdown("test");

        let finisher = target.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            finisher.finish_one();
        });

        let report = controller.wait_for_shutdown().await;
        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.forced, 0);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(60), "{elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_connections_close_before_anything_else() {
        let target = FakeTarget::new(1, 2);
        let controller = ShutdownController::new();
        controller.install(target.clone(), options(200)).unwrap();
        assert_eq!(controller.active_connections(), 3);

        controller.request_shutdown("test");

        // Idle ones are gone synchronously, the busy one is still open.
        assert_eq!(controller.active_connections(), 1);
        assert_eq!(target.calls(), vec!["stop_accepting", "close_idle"]);

        let report = controller.wait_for_shutdown().await;
        assert_eq!(report.forced, 1);
        assert_eq!(
            target.calls(),
            vec!["stop_accepting", "close_idle", "force_close_all"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn only_idle_connections_drains_immediately() {
        let target = FakeTarget::new(0, 3);
        let controller = ShutdownController::new();
        controller.install(target.clone(), options(1_000)).unwrap();

        let start = Instant::now();
        controller.request_shutdown("test");
        let report = controller.wait_for_shutdown().await;

        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_triggers_are_coalesced() {
        let target = FakeTarget::new(1, 0);
        let draining_calls = Arc::new(AtomicUsize::new(0));
        let counter = draining_calls.clone();
        let controller = ShutdownController::new();
        controller
            .install(
                target.clone(),
                options(100).on_draining(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        assert!(controller.shutdown_on_signal(Signal::Term).is_initiated());
        let second = controller.shutdown_on_signal(Signal::Int);
        assert!(matches!(
            second,
            TriggerOutcome::AlreadyDraining(ShutdownReason::Signal(Signal::Term))
        ));

        controller.wait_for_shutdown().await;
        let third = controller.request_shutdown("late");
        assert!(matches!(
            third,
            TriggerOutcome::AlreadyClosed(ShutdownReason::Signal(Signal::Term))
        ));

        assert_eq!(draining_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            target.calls().iter().filter(|c| **c == "stop_accepting").count(),
            1
        );
        assert!(matches!(
            controller.reason(),
            Some(ShutdownReason::Signal(Signal::Term))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_triggers_run_the_sequence_once() {
        let target = FakeTarget::new(0, 0);
        let controller = ShutdownController::new();
        controller.install(target.clone(), options(5_000)).unwrap();

        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let tasks: Vec<_> = (0..16)
            .map(|i| {
                let controller = controller.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    controller.request_shutdown(format!("caller {i}"))
                })
            })
            .collect();

        let mut initiated = 0;
        for task in tasks {
            if task.await.unwrap().is_initiated() {
                initiated += 1;
            }
        }
        assert_eq!(initiated, 1);

        let report = controller.wait_for_shutdown().await;
        let reason = controller.reason().unwrap();
        assert_eq!(report.reason.to_string(), reason.to_string());
        assert_eq!(
            target.calls(),
            vec!["stop_accepting", "close_idle", "force_close_all"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn is_draining_flips_on_trigger() {
        let target = FakeTarget::new(1, 0);
        let controller = ShutdownController::new();
        let probe = controller.clone();
        controller.install(target, options(100)).unwrap();
        assert!(!probe.is_draining());
        assert_eq!(probe.state(), ShutdownState::Running);
        assert!(probe.reason().is_none());

        controller.request_shutdown("test");
        assert!(probe.is_draining());
        assert_eq!(probe.state(), ShutdownState::Draining);

        probe.wait_for_shutdown().await;
        assert!(probe.is_draining());
        assert_eq!(probe.state(), ShutdownState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn on_draining_sees_draining_state() {
        let target = FakeTarget::new(1, 0);
        let controller = ShutdownController::new();
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        let probe = controller.clone();
        controller
            .install(
                target,
                options(100).on_draining(move || {
                    *slot.lock().unwrap() = Some(probe.is_draining());
                }),
            )
            .unwrap();

        controller.request_shutdown("test");
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[tokio::test(start_paused = true)]
    async fn all_waiters_resolve_on_the_same_transition() {
        let target = FakeTarget::new(1, 0);
        let controller = ShutdownController::new();
        controller.install(target.clone(), options(100)).unwrap();

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let controller = controller.clone();
                tokio::spawn(async move {
                    let report = controller.wait_for_shutdown().await;
                    (controller.state(), report.elapsed)
                })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(30)).await;
        for waiter in &waiters {
            assert!(!waiter.is_finished());
        }

        controller.request_shutdown("test");
        target.finish_one();

        let mut elapsed = Vec::new();
        for waiter in waiters {
            let (state, took) = waiter.await.unwrap();
            assert_eq!(state, ShutdownState::Closed);
            elapsed.push(took);
        }
        assert!(elapsed.windows(2).all(|pair| pair[0] == pair[1]));
    }

    #[tokio::test]
    async fn second_install_is_rejected_and_first_still_works() {
        let first = FakeTarget::new(0, 1);
        let second = FakeTarget::new(0, 1);
        let controller = ShutdownController::new();
        controller.install(first.clone(), options(100)).unwrap();

        let err = controller
            .install(second.clone(), options(100))
            .unwrap_err();
        assert!(matches!(err, ShutdownError::Configuration(_)));

        controller.request_shutdown("test");
        controller.wait_for_shutdown().await;
        assert_eq!(first.calls(), vec!["stop_accepting", "close_idle", "force_close_all"]);
        assert!(second.calls().is_empty());
    }

    #[tokio::test]
    async fn zero_grace_period_is_rejected() {
        let controller = ShutdownController::new();
        let err = controller
            .install(FakeTarget::new(0, 0), options(0))
            .unwrap_err();
        assert!(matches!(err, ShutdownError::Configuration(_)));

        // Nothing was claimed, so a valid install still succeeds.
        controller.install(FakeTarget::new(0, 0), options(10)).unwrap();
    }

    #[test]
    fn install_outside_runtime_is_rejected() {
        let controller = ShutdownController::new();
        let err = controller
            .install(FakeTarget::new(0, 0), options(10))
            .unwrap_err();
        assert!(matches!(err, ShutdownError::Configuration(_)));
    }

    #[tokio::test]
    async fn trigger_before_install_closes_immediately() {
        let controller = ShutdownController::new();
        assert!(controller.request_shutdown("early").is_initiated());

        let report = controller.wait_for_shutdown().await;
        assert_eq!(report.outcome, DrainOutcome::Drained);
        assert_eq!(report.forced, 0);

        let err = controller
            .install(FakeTarget::new(0, 0), options(10))
            .unwrap_err();
        assert!(matches!(err, ShutdownError::Configuration(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn install_racing_a_trigger_never_leaves_an_undrained_target() {
        for _ in 0..2_000 {
            let target = FakeTarget::new(0, 0);
            let controller = ShutdownController::new();
            let trigger = {
                let controller = controller.clone();
                std::thread::spawn(move || controller.request_shutdown("race"))
            };
            let installed = controller.install(target.clone(), options(1_000));
            assert!(trigger.join().unwrap().is_initiated());

            controller.wait_for_shutdown().await;
            match installed {
                Ok(()) => assert_eq!(
                    target.calls(),
                    vec!["stop_accepting", "close_idle", "force_close_all"]
                ),
                Err(e) => {
                    assert!(matches!(e, ShutdownError::Configuration(_)));
                    assert!(target.calls().is_empty());
                }
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn callback_flag_is_set_only_inside_callbacks() {
        let target = FakeTarget::new(0, 0);
        let controller = ShutdownController::new();
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();
        controller
            .install(
                target,
                options(100).on_draining(move || {
                    *slot.lock().unwrap() = Some(in_shutdown_callback());
                }),
            )
            .unwrap();

        assert!(!in_shutdown_callback());
        controller.request_shutdown("test");
        assert_eq!(*seen.lock().unwrap(), Some(true));
        assert!(!in_shutdown_callback());
    }

    #[tokio::test(start_paused = true)]
    async fn fault_reason_is_reported_after_closed() {
        let target = FakeTarget::new(1, 0);
        let controller = ShutdownController::new();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let probe = controller.clone();
        controller
            .install(
                target,
                options(100).on_drain_error(move |fault| {
                    sink.lock().unwrap().push((fault.to_string(), probe.state()));
                }),
            )
            .unwrap();

        controller.shutdown_on_fault(DrainFault::msg("database unreachable"));
        assert!(reports.lock().unwrap().is_empty());

        let report = controller.wait_for_shutdown().await;
        assert!(report.reason.is_fault());
        assert_eq!(
            *reports.lock().unwrap(),
            vec![("database unreachable".to_string(), ShutdownState::Closed)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn late_fault_is_reported_but_does_not_replace_reason() {
        let target = FakeTarget::new(1, 0);
        let controller = ShutdownController::new();
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        controller
            .install(
                target,
                options(100).on_drain_error(move |fault| {
                    sink.lock().unwrap().push(fault.to_string());
                }),
            )
            .unwrap();

        controller.shutdown_on_signal(Signal::Term);
        let outcome = controller.shutdown_on_fault(DrainFault::msg("second failure"));
        assert!(matches!(
            outcome,
            TriggerOutcome::AlreadyDraining(ShutdownReason::Signal(Signal::Term))
        ));
        assert_eq!(*faults.lock().unwrap(), vec!["second failure".to_string()]);

        let report = controller.wait_for_shutdown().await;
        assert!(matches!(report.reason, ShutdownReason::Signal(Signal::Term)));
        assert_eq!(faults.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_force_close_still_reaches_closed() {
        let target = FakeTarget::failing(1);
        let controller = ShutdownController::new();
        let faults = Arc::new(Mutex::new(Vec::new()));
        let sink = faults.clone();
        controller
            .install(
                target,
                options(100).on_drain_error(move |fault| {
                    sink.lock().unwrap().push(fault.to_string());
                }),
            )
            .unwrap();

        controller.request_shutdown("test");
        let report = controller.wait_for_shutdown().await;

        assert_eq!(controller.state(), ShutdownState::Closed);
        assert_eq!(report.outcome, DrainOutcome::DeadlineElapsed);
        assert_eq!(
            *faults.lock().unwrap(),
            vec!["Forced close failed: socket already gone".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_callbacks_do_not_stop_the_sequence() {
        let target = FakeTarget::new(1, 0);
        let controller = ShutdownController::new();
        controller
            .install(
                target.clone(),
                options(100)
                    .on_draining(|| panic!("draining hook exploded"))
                    .on_drain_error(|_| panic!("error hook exploded")),
            )
            .unwrap();

        controller.shutdown_on_fault(DrainFault::msg("boom"));
        let report = controller.wait_for_shutdown().await;
        assert_eq!(report.outcome, DrainOutcome::DeadlineElapsed);
        assert_eq!(
            target.calls(),
            vec!["stop_accepting", "close_idle", "force_close_all"]
        );
    }

    #[test]
    fn options_deduplicate_signals() {
        let options = ShutdownOptions::new(Duration::from_secs(1))
            .with_signals([Signal::Term, Signal::Term, Signal::Hup]);
        assert_eq!(options.signals, vec![Signal::Term, Signal::Hup]);

        let config = ShutdownConfig::default();
        let options = ShutdownOptions::from_config(&config);
        assert_eq!(options.grace_period, Duration::from_secs(10));
        assert_eq!(options.signals, Signal::DEFAULT.to_vec());
    }
}
