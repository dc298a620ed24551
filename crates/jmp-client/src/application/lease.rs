//! LeaseManager: request, inspect, update and release leases, and warn the
//! holder before a lease runs out.
//!
//! One manager is scoped to one lease.  It talks to the controller through a
//! [`ControllerService`] that can be swapped in one step with
//! [`LeaseManager::refresh_channel`] after a reconnect; the lease name and
//! the registered callback survive the swap.
//!
//! # Acquisition
//!
//! `request` creates the lease and then polls `GetLease` until the
//! controller reports `Ready=True`:
//!
//! | Latest conditions                 | Outcome                        |
//! |-----------------------------------|--------------------------------|
//! | `Ready=True`                      | acquired                       |
//! | `Ready=False`, reason `Released`  | [`LeaseError::Released`]       |
//! | `Unsatisfiable=True`              | [`LeaseError::Unsatisfiable`]  |
//! | `Invalid=True`                    | [`LeaseError::Validation`]     |
//! | `Pending=False`                   | [`LeaseError::NotPending`]     |
//! | anything else                     | keep polling                   |
//!
//! # Monitoring
//!
//! The monitor loop refreshes the lease at a steady cadence and computes its
//! end time.  The ending callback fires once per observed end time when less
//! than the configured threshold remains, and once more with a zero
//! remaining duration when the lease is over.  A refresh is always made at
//! the expected end, with the full refresh deadline, since the lease may have
//! been extended.  Only when that refresh fails is expiry taken from the
//! cached end time.

use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jmp_core::domain::exporter::Exporter;
use jmp_core::domain::identifier::{self, ResourceKind};
use jmp_core::domain::lease::{
    condition_false, condition_message, condition_present_and_equal, condition_true,
    condition_type, ConditionStatus, REASON_RELEASED,
};
use jmp_core::protocol::controller::{
    CreateLeaseRequest, LeaseList, ListRequest, UpdateLeaseRequest,
};
use jmp_core::{ControllerService, HookContext, Lease, RpcCode, RpcError, Selector, SelectorError};

/// Caller-facing lease errors.
#[derive(Debug, Error)]
pub enum LeaseError {
    #[error("invalid lease request: {0}")]
    Validation(String),
    #[error("invalid selector: {0}")]
    Selector(#[from] SelectorError),
    #[error("lease {name} cannot be satisfied: {message}")]
    Unsatisfiable { name: String, message: String },
    #[error("lease {name} is no longer pending: {message}")]
    NotPending { name: String, message: String },
    #[error("lease {name} has been released")]
    Released { name: String },
    #[error("lease {name} was not ready after {waited:?}")]
    AcquireTimeout { name: String, waited: Duration },
    #[error("no lease has been requested yet")]
    NoActiveLease,
    #[error("controller call failed: {0}")]
    Rpc(#[from] RpcError),
}

/// Source of wall-clock time for end-time arithmetic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Called with the lease and the time left on it.
pub type EndingCallback = Arc<dyn Fn(&Lease, Duration) + Send + Sync>;

/// Lease manager tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    pub namespace: String,
    /// `None` waits for the lease forever.
    pub acquire_timeout: Option<Duration>,
    pub acquire_poll_interval: Duration,
    pub refresh_interval: Duration,
    pub ending_threshold: Duration,
    pub retry_initial: Duration,
    pub retry_max: Duration,
    pub retry_multiplier: f64,
    /// Delete the lease on release.
    pub release: bool,
}

impl LeaseConfig {
    /// Rejects values that would stall or spin the acquire and monitor loops.
    ///
    /// # Errors
    ///
    /// [`LeaseError::Validation`] naming the offending setting.
    pub fn validate(&self) -> Result<(), LeaseError> {
        let positive = [
            ("acquire poll interval", self.acquire_poll_interval),
            ("refresh interval", self.refresh_interval),
            ("initial retry delay", self.retry_initial),
        ];
        if let Some((what, _)) = positive.iter().find(|(_, d)| d.is_zero()) {
            return Err(LeaseError::Validation(format!("{what} must be positive")));
        }
        if self.retry_initial > self.retry_max {
            return Err(LeaseError::Validation(
                "initial retry delay exceeds the maximum".to_string(),
            ));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(LeaseError::Validation(format!(
                "retry multiplier must be a finite number >= 1, got {}",
                self.retry_multiplier
            )));
        }
        Ok(())
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            acquire_timeout: Some(Duration::from_secs(300)),
            acquire_poll_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(5),
            ending_threshold: Duration::from_secs(5 * 60),
            retry_initial: Duration::from_secs(1),
            retry_max: Duration::from_secs(30),
            retry_multiplier: 2.0,
            release: true,
        }
    }
}

/// Requests and tracks a single lease.
pub struct LeaseManager {
    config: LeaseConfig,
    controller: RwLock<Arc<dyn ControllerService>>,
    name: Mutex<Option<String>>,
    latest: Mutex<Option<Lease>>,
    ending: Mutex<Option<EndingCallback>>,
    monitor: Mutex<Option<LeaseMonitor>>,
    clock: Arc<dyn Clock>,
}

impl LeaseManager {
    pub fn new(controller: Arc<dyn ControllerService>, config: LeaseConfig) -> Self {
        Self::with_clock(controller, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        controller: Arc<dyn ControllerService>,
        config: LeaseConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            controller: RwLock::new(controller),
            name: Mutex::new(None),
            latest: Mutex::new(None),
            ending: Mutex::new(None),
            monitor: Mutex::new(None),
            clock,
        }
    }

    /// Manages an existing lease instead of creating a new one.
    pub fn for_existing(
        controller: Arc<dyn ControllerService>,
        config: LeaseConfig,
        name: &str,
    ) -> Self {
        let manager = Self::new(controller, config);
        manager.adopt(name);
        manager
    }

    /// Takes over the lease called `name`.
    pub fn adopt(&self, name: &str) {
        *lock(&self.name) = Some(name.to_string());
    }

    /// Short name of the managed lease, once known.
    pub fn name(&self) -> Option<String> {
        lock(&self.name).clone()
    }

    /// Last lease seen from the controller.
    pub fn latest(&self) -> Option<Lease> {
        lock(&self.latest).clone()
    }

    /// Replaces the controller stub in one step.
    ///
    /// In-flight calls finish on the old stub; every call that starts after
    /// this returns uses the new one.
    pub fn refresh_channel(&self, controller: Arc<dyn ControllerService>) {
        match self.controller.write() {
            Ok(mut guard) => *guard = controller,
            Err(poisoned) => *poisoned.into_inner() = controller,
        }
        debug!("controller channel replaced");
    }

    fn controller(&self) -> Arc<dyn ControllerService> {
        match self.controller.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn lease_id(&self, name: &str) -> String {
        identifier::format(&self.config.namespace, ResourceKind::Lease, name)
    }

    /// Sets the ending callback, replacing any previous one.
    pub fn on_ending<F>(&self, callback: F)
    where
        F: Fn(&Lease, Duration) + Send + Sync + 'static,
    {
        *lock(&self.ending) = Some(Arc::new(callback));
    }

    fn notify_ending(&self, lease: &Lease, remaining: Duration) {
        let callback = lock(&self.ending).clone();
        if let Some(callback) = callback {
            callback(lease, remaining);
        }
    }

    // ── Acquisition ───────────────────────────────────────────────────────

    /// Requests a lease on an exporter matching `selector` and waits until it
    /// is ready.
    ///
    /// If this manager already knows its lease name, creation is skipped and
    /// only the wait is performed.
    ///
    /// # Errors
    ///
    /// Validation and selector errors are returned before any RPC.  See the
    /// module docs for the acquisition outcomes.
    pub async fn request(
        &self,
        selector: &str,
        duration: Duration,
        begin_time: Option<DateTime<Utc>>,
    ) -> Result<Lease, LeaseError> {
        let selector = Selector::parse(selector)?;
        if duration.is_zero() {
            return Err(LeaseError::Validation(
                "lease duration must be positive".to_string(),
            ));
        }

        if let Some(name) = self.name() {
            info!(lease = %name, "reusing existing lease");
        } else {
            let lease = self
                .controller()
                .create_lease(CreateLeaseRequest {
                    parent: identifier::parent(&self.config.namespace),
                    selector: selector.to_string(),
                    duration,
                    begin_time,
                })
                .await?;
            info!(lease = %lease.name, %selector, "lease created");
            *lock(&self.name) = Some(lease.name.clone());
        }
        self.acquire().await
    }

    /// Waits until the managed lease is ready.
    ///
    /// # Errors
    ///
    /// [`LeaseError::NoActiveLease`] if no lease name is known, otherwise see
    /// the module docs.
    pub async fn acquire(&self) -> Result<Lease, LeaseError> {
        let name = self.name().ok_or(LeaseError::NoActiveLease)?;
        self.config.validate()?;
        let Some(limit) = self.config.acquire_timeout else {
            return self.poll_until_ready(&name).await;
        };
        match tokio::time::timeout(limit, self.poll_until_ready(&name)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(lease = %name, ?limit, "lease not ready in time");
                Err(LeaseError::AcquireTimeout {
                    name,
                    waited: limit,
                })
            }
        }
    }

    async fn poll_until_ready(&self, name: &str) -> Result<Lease, LeaseError> {
        let id = self.lease_id(name);
        loop {
            match self.controller().get_lease(id.clone()).await {
                Ok(lease) => {
                    *lock(&self.latest) = Some(lease.clone());
                    if let Some(outcome) = acquisition_outcome(name, &lease) {
                        return outcome;
                    }
                    debug!(lease = %name, status = %lease.status(), "waiting for lease");
                }
                Err(e) if is_transient(&e) => {
                    debug!(lease = %name, error = %e, "lease poll failed, retrying");
                }
                Err(e) => return Err(e.into()),
            }
            tokio::time::sleep(self.config.acquire_poll_interval).await;
        }
    }

    // ── CRUD ──────────────────────────────────────────────────────────────

    pub async fn get(&self, name: &str) -> Result<Lease, LeaseError> {
        Ok(self.controller().get_lease(self.lease_id(name)).await?)
    }

    /// One page of leases in this manager's namespace.
    pub async fn list(
        &self,
        filter: Option<&str>,
        page_size: Option<u32>,
        page_token: Option<String>,
    ) -> Result<LeaseList, LeaseError> {
        let filter = validated_filter(filter)?;
        Ok(self
            .controller()
            .list_leases(ListRequest {
                parent: identifier::parent(&self.config.namespace),
                filter,
                page_size,
                page_token,
            })
            .await?)
    }

    /// Every lease in this manager's namespace, following page tokens.
    pub async fn list_all(&self, filter: Option<&str>) -> Result<Vec<Lease>, LeaseError> {
        let mut leases = Vec::new();
        let mut token = None;
        loop {
            let page = self.list(filter, None, token).await?;
            leases.extend(page.leases);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => token = Some(next),
                None => return Ok(leases),
            }
        }
    }

    /// Changes the duration and/or begin time of a lease.
    ///
    /// # Errors
    ///
    /// [`LeaseError::Validation`] if neither field is given.
    pub async fn update(
        &self,
        name: &str,
        duration: Option<Duration>,
        begin_time: Option<DateTime<Utc>>,
    ) -> Result<Lease, LeaseError> {
        if duration.is_none() && begin_time.is_none() {
            return Err(LeaseError::Validation(
                "update needs a duration or a begin time".to_string(),
            ));
        }
        if duration.is_some_and(|d| d.is_zero()) {
            return Err(LeaseError::Validation(
                "lease duration must be positive".to_string(),
            ));
        }
        let lease = self
            .controller()
            .update_lease(UpdateLeaseRequest {
                name: self.lease_id(name),
                duration,
                begin_time,
            })
            .await?;
        info!(lease = %name, ?duration, ?begin_time, "lease updated");
        Ok(lease)
    }

    pub async fn delete(&self, name: &str) -> Result<(), LeaseError> {
        self.controller().delete_lease(self.lease_id(name)).await?;
        info!(lease = %name, "lease deleted");
        Ok(())
    }

    /// Every exporter in this manager's namespace matching `filter`.
    pub async fn list_exporters(&self, filter: Option<&str>) -> Result<Vec<Exporter>, LeaseError> {
        let filter = validated_filter(filter)?;
        let mut exporters = Vec::new();
        let mut page_token = None;
        loop {
            let page = self
                .controller()
                .list_exporters(ListRequest {
                    parent: identifier::parent(&self.config.namespace),
                    filter: filter.clone(),
                    page_size: None,
                    page_token,
                })
                .await?;
            exporters.extend(page.exporters);
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(next) => page_token = Some(next),
                None => return Ok(exporters),
            }
        }
    }

    pub async fn get_exporter(&self, name: &str) -> Result<Exporter, LeaseError> {
        let id = identifier::format(&self.config.namespace, ResourceKind::Exporter, name);
        Ok(self.controller().get_exporter(id).await?)
    }

    /// Stops the monitor and, when configured to, deletes the lease.
    pub async fn release(&self) -> Result<(), LeaseError> {
        self.stop_monitor().await;
        let Some(name) = lock(&self.name).take() else {
            return Ok(());
        };
        if self.config.release {
            info!(lease = %name, "releasing lease");
            self.delete(&name).await?;
        } else {
            debug!(lease = %name, "leaving lease in place on release");
        }
        Ok(())
    }

    /// Identifiers handed to the external hook executor.
    pub fn hook_context(&self, session_endpoint: &str) -> Result<HookContext, LeaseError> {
        let lease = self.latest().ok_or(LeaseError::NoActiveLease)?;
        let exporter = lease.exporter.clone().unwrap_or_default();
        let (exporter_namespace, exporter_name) =
            match identifier::parse(&exporter, ResourceKind::Exporter) {
                Ok(parts) => parts,
                Err(_) => (lease.namespace.clone(), exporter),
            };
        Ok(HookContext {
            lease_name: lease.name.clone(),
            client_name: lease.client.clone(),
            lease_duration: lease.effective_duration.unwrap_or(lease.duration),
            exporter_name,
            exporter_namespace,
            session_endpoint: session_endpoint.to_string(),
        })
    }

    // ── Monitoring ────────────────────────────────────────────────────────

    /// Starts the background monitor on `runtime`.  A running monitor is
    /// left alone.
    ///
    /// # Errors
    ///
    /// [`LeaseError::NoActiveLease`] if no lease name is known, or
    /// [`LeaseError::Validation`] if the config fails
    /// [`LeaseConfig::validate`].
    pub fn monitor(self: &Arc<Self>, runtime: &Handle) -> Result<(), LeaseError> {
        let name = self.name().ok_or(LeaseError::NoActiveLease)?;
        self.config.validate()?;
        let mut slot = lock(&self.monitor);
        if slot.as_ref().is_some_and(|m| !m.task.is_finished()) {
            return Ok(());
        }
        let (stop, stop_rx) = watch::channel(false);
        let task = runtime.spawn(monitor_loop(Arc::downgrade(self), self.lease_id(&name), stop_rx));
        *slot = Some(LeaseMonitor { task, stop });
        debug!(lease = %name, "lease monitor started");
        Ok(())
    }

    /// True while the monitor task is alive.
    pub fn is_monitoring(&self) -> bool {
        lock(&self.monitor)
            .as_ref()
            .is_some_and(|m| !m.task.is_finished())
    }

    /// Stops the monitor and waits for it to finish.
    pub async fn stop_monitor(&self) {
        let monitor = lock(&self.monitor).take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        if let Some(monitor) = lock(&self.monitor).take() {
            monitor.task.abort();
        }
    }
}

/// Handle to a running lease monitor.
struct LeaseMonitor {
    task: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl LeaseMonitor {
    async fn stop(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "lease monitor ended abnormally");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn is_transient(e: &RpcError) -> bool {
    matches!(e.code, RpcCode::Unavailable | RpcCode::DeadlineExceeded)
}

fn validated_filter(filter: Option<&str>) -> Result<Option<String>, LeaseError> {
    match filter {
        Some(f) => Ok(Some(Selector::parse(f)?.to_string())),
        None => Ok(None),
    }
}

/// Decides whether polling for `lease` can stop.
fn acquisition_outcome(name: &str, lease: &Lease) -> Option<Result<Lease, LeaseError>> {
    let conditions = &lease.conditions;
    let message = |kind| condition_message(conditions, kind).unwrap_or("").to_string();

    if condition_true(conditions, condition_type::READY) {
        info!(lease = %name, exporter = ?lease.exporter, "lease ready");
        return Some(Ok(lease.clone()));
    }
    if condition_present_and_equal(
        conditions,
        condition_type::READY,
        ConditionStatus::False,
        REASON_RELEASED,
    ) {
        return Some(Err(LeaseError::Released {
            name: name.to_string(),
        }));
    }
    if condition_true(conditions, condition_type::UNSATISFIABLE) {
        return Some(Err(LeaseError::Unsatisfiable {
            name: name.to_string(),
            message: message(condition_type::UNSATISFIABLE),
        }));
    }
    if condition_true(conditions, condition_type::INVALID) {
        return Some(Err(LeaseError::Validation(message(condition_type::INVALID))));
    }
    if condition_false(conditions, condition_type::PENDING) {
        return Some(Err(LeaseError::NotPending {
            name: name.to_string(),
            message: message(condition_type::PENDING),
        }));
    }
    None
}

// ── Monitor loop ──────────────────────────────────────────────────────────────

struct CachedEnd {
    lease: Lease,
    end: DateTime<Utc>,
}

async fn monitor_loop(manager: Weak<LeaseManager>, id: String, mut stop: watch::Receiver<bool>) {
    let mut cached: Option<CachedEnd> = None;
    let mut warned_for: Option<DateTime<Utc>> = None;
    let mut backoff: Option<Duration> = None;

    loop {
        let Some(mgr) = manager.upgrade() else {
            break;
        };
        let config = mgr.config.clone();

        // Full deadline even at the cached end; the lease may have been extended.
        let controller = mgr.controller();
        let fetched = tokio::select! {
            _ = stop.changed() => break,
            fetched = tokio::time::timeout(
                config.refresh_interval,
                controller.get_lease(id.clone()),
            ) => fetched
                .unwrap_or_else(|_| Err(RpcError::deadline_exceeded("lease refresh timed out"))),
        };

        let sleep_for = match fetched {
            Ok(lease) => {
                backoff = None;
                *lock(&mgr.latest) = Some(lease.clone());
                match lease.end_time() {
                    Some(end) => {
                        cached = Some(CachedEnd {
                            lease: lease.clone(),
                            end,
                        });
                        let remaining = time_left(&*mgr.clock, end);
                        if remaining.is_zero() || lease.has_ended() {
                            info!(lease = %lease.name, "lease ended");
                            mgr.notify_ending(&lease, Duration::ZERO);
                            break;
                        }
                        if remaining <= config.ending_threshold && warned_for != Some(end) {
                            info!(lease = %lease.name, ?remaining, "lease ending soon");
                            mgr.notify_ending(&lease, remaining);
                            warned_for = Some(end);
                        }
                        config.refresh_interval.min(remaining)
                    }
                    None => config.refresh_interval,
                }
            }
            Err(e) => match &cached {
                Some(c) => {
                    let remaining = time_left(&*mgr.clock, c.end);
                    if remaining.is_zero() {
                        warn!(
                            lease = %c.lease.name,
                            error = %e,
                            "lease refresh failed past cached end time, treating lease as ended"
                        );
                        mgr.notify_ending(&c.lease, Duration::ZERO);
                        break;
                    }
                    debug!(error = %e, ?remaining, "lease refresh failed, using cached end time");
                    if remaining <= config.ending_threshold && warned_for != Some(c.end) {
                        mgr.notify_ending(&c.lease, remaining);
                        warned_for = Some(c.end);
                    }
                    config.refresh_interval.min(remaining)
                }
                None => {
                    let delay = next_backoff(backoff, &config);
                    backoff = Some(delay);
                    debug!(error = %e, ?delay, "lease refresh failed, retrying");
                    delay
                }
            },
        };
        drop(mgr);

        tokio::select! {
            _ = stop.changed() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }
    debug!(lease = %id, "lease monitor exited");
}

fn time_left(clock: &dyn Clock, end: DateTime<Utc>) -> Duration {
    Lease::remaining_until(end, clock.now())
}

/// Next retry delay, kept within `[retry_initial, retry_max]`.
fn next_backoff(previous: Option<Duration>, config: &LeaseConfig) -> Duration {
    let Some(prev) = previous else {
        return config.retry_initial;
    };
    Duration::try_from_secs_f64(prev.as_secs_f64() * config.retry_multiplier)
        .unwrap_or(config.retry_max)
        .max(config.retry_initial)
        .min(config.retry_max)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
