//! StatusMonitor: one cached, version-stamped view of an exporter's status.
//!
//! # How it works (for beginners)
//!
//! A background poll loop calls `GetStatus` on the exporter and publishes
//! the result as a [`StatusSnapshot`] through a `tokio::sync::watch`
//! channel.  The loop is the only writer; any number of readers and waiters
//! share the snapshot without issuing RPCs of their own.
//!
//! ```text
//!   poll loop ──GetStatus──► exporter
//!       │
//!       └─ send_modify ──► watch<StatusSnapshot> ──► wait_for_status()
//!                                               ──► current_status()
//! ```
//!
//! The poll interval adapts to demand:
//!
//! | Condition                          | Interval |
//! |------------------------------------|----------|
//! | at least one active waiter         | critical |
//! | idle and status is `LEASE_READY`   | slow     |
//! | otherwise                          | default  |
//!
//! And the loop reacts to each RPC outcome:
//!
//! | Outcome             | Effect                                                 |
//! |---------------------|--------------------------------------------------------|
//! | success             | update snapshot, count skipped versions, reset streak  |
//! | `DEADLINE_EXCEEDED` | extend the timeout streak; at the threshold, lost      |
//! | `UNAVAILABLE`       | connection lost immediately                            |
//! | `UNIMPLEMENTED`     | older exporter: assume `LEASE_READY`, stop polling     |
//! | anything else       | retried next tick                                      |
//!
//! When the connection is lost the loop exits.  The next `wait_for_*` call
//! performs one verification poll; if that succeeds the flag is cleared and
//! the loop restarts.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use jmp_core::{ExporterService, ExporterStatus, RpcCode, RpcError, StatusResponse};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Callback invoked after each observed transition with `(previous, current)`.
pub type StatusCallback =
    Arc<dyn Fn(Option<ExporterStatus>, ExporterStatus) -> anyhow::Result<()> + Send + Sync>;

/// Poll-loop tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusMonitorConfig {
    pub critical_interval: Duration,
    pub default_interval: Duration,
    pub slow_interval: Duration,
    /// Deadline for one `GetStatus` call.
    pub rpc_timeout: Duration,
    /// Consecutive timeouts after which the connection is presumed lost.
    pub timeout_streak_threshold: u32,
}

impl Default for StatusMonitorConfig {
    fn default() -> Self {
        Self {
            critical_interval: Duration::from_millis(100),
            default_interval: Duration::from_millis(300),
            slow_interval: Duration::from_secs(5),
            rpc_timeout: Duration::from_secs(5),
            timeout_streak_threshold: 20,
        }
    }
}

/// The latest completed poll, published atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatusSnapshot {
    /// `None` until the first successful poll.
    pub current_status: Option<ExporterStatus>,
    pub status_version: u64,
    pub status_message: String,
    pub previous_status: Option<ExporterStatus>,
    pub connection_lost: bool,
    /// Versions skipped between two observed polls.
    pub missed_transitions: u64,
    /// True while a poll loop is expected to publish further updates.
    pub polling: bool,
    /// Set once the exporter turned out not to implement `GetStatus`.
    pub status_unsupported: bool,
}

impl StatusSnapshot {
    fn matching(&self, targets: &[ExporterStatus]) -> Option<ExporterStatus> {
        self.current_status.filter(|s| targets.contains(s))
    }
}

enum MonitorState {
    NotStarted,
    Running {
        task: JoinHandle<()>,
        stop: watch::Sender<bool>,
        runtime: Handle,
    },
    Stopped,
}

enum Tick {
    Continue,
    Exit,
}

struct Shared {
    stub: Arc<dyn ExporterService>,
    config: StatusMonitorConfig,
    snapshot: watch::Sender<StatusSnapshot>,
    /// Number of callers inside `wait_for_*`.
    waiters: watch::Sender<usize>,
    callbacks: Mutex<Vec<StatusCallback>>,
}

impl Shared {
    async fn fetch(&self) -> Result<StatusResponse, RpcError> {
        match tokio::time::timeout(self.config.rpc_timeout, self.stub.get_status()).await {
            Ok(result) => result,
            Err(_) => Err(RpcError::deadline_exceeded("status poll timed out")),
        }
    }

    fn handle_poll(&self, result: Result<StatusResponse, RpcError>, streak: &mut u32) -> Tick {
        match result {
            Ok(response) => {
                *streak = 0;
                self.record(response);
                Tick::Continue
            }
            Err(e) if e.code == RpcCode::DeadlineExceeded => {
                *streak += 1;
                if *streak >= self.config.timeout_streak_threshold {
                    warn!(streak = *streak, "status polls keep timing out, connection lost");
                    self.mark_lost();
                    return Tick::Exit;
                }
                debug!(streak = *streak, "status poll timed out, retrying");
                Tick::Continue
            }
            Err(e) if e.code == RpcCode::Unavailable => {
                warn!(error = %e, "exporter unavailable, connection lost");
                self.mark_lost();
                Tick::Exit
            }
            Err(e) if e.code == RpcCode::Unimplemented => {
                info!("exporter does not implement GetStatus, assuming LEASE_READY");
                self.apply_unsupported();
                Tick::Exit
            }
            Err(e) => {
                debug!(error = %e, "status poll failed, retrying");
                Tick::Continue
            }
        }
    }

    /// Publishes a successful poll.  Also clears `connection_lost`.
    fn record(&self, response: StatusResponse) {
        let mut transition = None;
        self.snapshot.send_if_modified(|s| {
            let seen_before = s.current_status.is_some();
            if seen_before && !s.connection_lost && response.status_version < s.status_version {
                debug!(
                    current = s.status_version,
                    received = response.status_version,
                    "ignoring stale status version"
                );
                return false;
            }
            if seen_before && response.status_version > s.status_version + 1 {
                let skipped = response.status_version - s.status_version - 1;
                s.missed_transitions += skipped;
                warn!(
                    from = s.status_version,
                    to = response.status_version,
                    skipped,
                    "missed status transitions between polls"
                );
            }

            let old = s.current_status;
            if old != Some(response.status) {
                transition = Some((old, response.status));
            }
            s.current_status = Some(response.status);
            s.status_version = response.status_version;
            s.status_message = response.message;
            s.previous_status = response.previous_status;
            s.connection_lost = false;
            true
        });

        if let Some((old, new)) = transition {
            info!(from = ?old, to = %new, "exporter status changed");
            self.fire(old, new);
        }
    }

    fn mark_lost(&self) {
        self.snapshot.send_modify(|s| {
            s.connection_lost = true;
            s.polling = false;
        });
    }

    fn apply_unsupported(&self) {
        let mut transition = None;
        self.snapshot.send_modify(|s| {
            let old = s.current_status;
            if old != Some(ExporterStatus::LeaseReady) {
                transition = Some(old);
            }
            s.current_status = Some(ExporterStatus::LeaseReady);
            s.status_unsupported = true;
            s.connection_lost = false;
            s.polling = false;
        });
        if let Some(old) = transition {
            self.fire(old, ExporterStatus::LeaseReady);
        }
    }

    fn fire(&self, old: Option<ExporterStatus>, new: ExporterStatus) {
        let callbacks = match self.callbacks.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        for callback in callbacks {
            if let Err(e) = callback(old, new) {
                warn!(error = %e, "status change callback failed");
            }
        }
    }

    fn next_interval(&self) -> Duration {
        if *self.waiters.borrow() > 0 {
            self.config.critical_interval
        } else if self.snapshot.borrow().current_status == Some(ExporterStatus::LeaseReady) {
            self.config.slow_interval
        } else {
            self.config.default_interval
        }
    }
}

async fn poll_loop(shared: Arc<Shared>, mut stop: watch::Receiver<bool>) {
    let mut streak = 0u32;
    let mut waiters = shared.waiters.subscribe();
    loop {
        let result = tokio::select! {
            _ = stop.changed() => break,
            result = shared.fetch() => result,
        };
        if let Tick::Exit = shared.handle_poll(result, &mut streak) {
            break;
        }

        let interval = shared.next_interval();
        let can_hurry = interval > shared.config.critical_interval;
        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(interval) => {}
            // Live count, not a stored wakeup.
            _ = async {
                let _ = waiters.wait_for(|n| *n > 0).await;
            }, if can_hurry => {
                debug!("waiter arrived, polling sooner");
            }
        }
    }
    debug!("status poll loop exited");
}

/// Counts one caller as an active waiter for as long as it lives.
struct WaiterGuard<'a> {
    shared: &'a Shared,
}

impl<'a> WaiterGuard<'a> {
    fn register(shared: &'a Shared) -> Self {
        shared.waiters.send_modify(|n| *n += 1);
        Self { shared }
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.shared.waiters.send_modify(|n| *n -= 1);
    }
}

/// Polls one exporter's status and lets many callers wait on it.
pub struct StatusMonitor {
    shared: Arc<Shared>,
    state: Mutex<MonitorState>,
}

impl StatusMonitor {
    pub fn new(stub: Arc<dyn ExporterService>, config: StatusMonitorConfig) -> Self {
        let (snapshot, _) = watch::channel(StatusSnapshot::default());
        Self {
            shared: Arc::new(Shared {
                stub,
                config,
                snapshot,
                waiters: watch::channel(0).0,
                callbacks: Mutex::new(Vec::new()),
            }),
            state: Mutex::new(MonitorState::NotStarted),
        }
    }

    /// Spawns the poll loop on `runtime`.
    ///
    /// Returns `false` if the monitor was already started or has been stopped;
    /// a stopped monitor is never restarted.
    pub fn start(&self, runtime: &Handle) -> bool {
        let mut state = self.lock_state();
        if !matches!(*state, MonitorState::NotStarted) {
            debug!("status monitor already started");
            return false;
        }

        let (stop, stop_rx) = watch::channel(false);
        self.shared.snapshot.send_modify(|s| s.polling = true);
        let task = runtime.spawn(poll_loop(Arc::clone(&self.shared), stop_rx));
        *state = MonitorState::Running {
            task,
            stop,
            runtime: runtime.clone(),
        };
        info!("status monitor started");
        true
    }

    /// Cancels the poll loop, including any in-flight RPC or sleep, and
    /// waits for it to finish.  Safe to call more than once.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), MonitorState::Stopped);
        if let MonitorState::Running { task, stop, .. } = previous {
            let _ = stop.send(true);
            if let Err(e) = task.await {
                warn!(error = %e, "status poll loop ended abnormally");
            }
            info!("status monitor stopped");
        }
        self.shared.snapshot.send_if_modified(|s| std::mem::replace(&mut s.polling, false));
    }

    /// Registers a callback for status transitions.  Errors it returns are
    /// logged and otherwise ignored.
    pub fn on_status_change<F>(&self, callback: F)
    where
        F: Fn(Option<ExporterStatus>, ExporterStatus) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let callback: StatusCallback = Arc::new(callback);
        match self.shared.callbacks.lock() {
            Ok(mut guard) => guard.push(callback),
            Err(poisoned) => poisoned.into_inner().push(callback),
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.shared.snapshot.borrow().clone()
    }

    /// A receiver that is notified after every published poll.
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn current_status(&self) -> Option<ExporterStatus> {
        self.shared.snapshot.borrow().current_status
    }

    pub fn status_version(&self) -> u64 {
        self.shared.snapshot.borrow().status_version
    }

    pub fn status_message(&self) -> String {
        self.shared.snapshot.borrow().status_message.clone()
    }

    pub fn previous_status(&self) -> Option<ExporterStatus> {
        self.shared.snapshot.borrow().previous_status
    }

    pub fn connection_lost(&self) -> bool {
        self.shared.snapshot.borrow().connection_lost
    }

    pub fn missed_transitions(&self) -> u64 {
        self.shared.snapshot.borrow().missed_transitions
    }

    pub fn active_waiters(&self) -> usize {
        *self.shared.waiters.borrow()
    }

    /// Waits until the status equals `target`.
    ///
    /// Returns `false` on timeout, on connection loss, or once polling has
    /// stopped without reaching `target`.
    pub async fn wait_for_status(&self, target: ExporterStatus, timeout: Duration) -> bool {
        self.wait_for_any_of(&[target], timeout).await.is_some()
    }

    /// Waits until the status is one of `targets` and returns it.
    ///
    /// Resolves immediately, without an RPC, when the cached status already
    /// matches.  The call never outlives `timeout`, even if the poll loop is
    /// wedged.
    pub async fn wait_for_any_of(
        &self,
        targets: &[ExporterStatus],
        timeout: Duration,
    ) -> Option<ExporterStatus> {
        tokio::time::timeout(timeout, self.wait_inner(targets))
            .await
            .ok()
            .flatten()
    }

    async fn wait_inner(&self, targets: &[ExporterStatus]) -> Option<ExporterStatus> {
        if self.connection_lost() && !self.verify_connection().await {
            return None;
        }

        let mut rx = self.shared.snapshot.subscribe();
        if let Some(hit) = rx.borrow_and_update().matching(targets) {
            return Some(hit);
        }

        let _guard = WaiterGuard::register(&self.shared);
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if let Some(hit) = snapshot.matching(targets) {
                    return Some(hit);
                }
                if snapshot.connection_lost || !snapshot.polling {
                    return None;
                }
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    /// One fresh poll after the connection was flagged as lost.
    async fn verify_connection(&self) -> bool {
        debug!("connection flagged lost, verifying with a fresh poll");
        match self.shared.fetch().await {
            Ok(response) => {
                self.shared.record(response);
                self.restart_loop_if_exited();
                info!("exporter connection recovered");
                true
            }
            Err(e) if e.code == RpcCode::Unimplemented => {
                self.shared.apply_unsupported();
                true
            }
            Err(e) => {
                debug!(error = %e, "verification poll failed");
                false
            }
        }
    }

    fn restart_loop_if_exited(&self) {
        let mut state = self.lock_state();
        let MonitorState::Running { task, stop, runtime } = &mut *state else {
            return;
        };
        if self.shared.snapshot.borrow().polling {
            return;
        }
        self.shared.snapshot.send_modify(|s| s.polling = true);
        *task = runtime.spawn(poll_loop(Arc::clone(&self.shared), stop.subscribe()));
        debug!("status poll loop restarted");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for StatusMonitor {
    fn drop(&mut self) {
        if let MonitorState::Running { task, .. } = &*self.lock_state() {
            task.abort();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
