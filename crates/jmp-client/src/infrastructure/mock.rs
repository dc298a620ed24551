//! In-memory fakes of the RPC seams for tests.
//!
//! The real controller and exporter live on the other side of a network
//! connection.  These fakes replace them with simple in-memory state so
//! tests can script exactly what each RPC returns and then inspect what was
//! called, and how often.
//!
//! - [`ScriptedExporter`] answers `GetStatus` from a queue of scripted steps,
//!   counts every status call, and records driver calls.
//! - [`SwitchableChannel`] reports whatever connectivity state a test sets.
//! - [`InMemoryController`] keeps leases and exporters in maps and can be
//!   switched to answer every call with `UNAVAILABLE`, or to stall.
//! - [`PausedClock`] follows tokio's (pausable) clock.
//!
//! # Usage in tests
//!
//! ```ignore
//! let exporter = Arc::new(ScriptedExporter::new("direct"));
//! exporter.push_status(Ok(status(ExporterStatus::LeaseReady, 1)));
//!
//! let monitor = StatusMonitor::new(exporter.clone(), config);
//! monitor.start(&Handle::current());
//!
//! assert!(monitor.wait_for_status(ExporterStatus::LeaseReady, Duration::from_secs(1)).await);
//! assert_eq!(exporter.status_calls(), 1);
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use jmp_core::domain::exporter::{Exporter, ExporterList};
use jmp_core::domain::identifier::{self, ResourceKind};
use jmp_core::domain::lease::{condition_type, Condition, ConditionStatus, Lease};
use jmp_core::domain::selector::Selector;
use jmp_core::protocol::controller::{
    ControllerService, CreateLeaseRequest, LeaseList, ListRequest, UpdateLeaseRequest,
};
use jmp_core::{Channel, ConnectivityState, ExporterService, ExporterStatus, Report, RpcError};
use jmp_core::StatusResponse;

use crate::application::lease::Clock;

/// Builds a `StatusResponse` with an empty message.
pub fn status(status: ExporterStatus, version: u64) -> StatusResponse {
    StatusResponse {
        status,
        status_version: version,
        message: String::new(),
        previous_status: None,
    }
}

// ── Exporter ──────────────────────────────────────────────────────────────────

/// One scripted answer to `GetStatus`.
#[derive(Debug, Clone)]
pub enum StatusStep {
    Reply(Result<StatusResponse, RpcError>),
    /// Never answers; the caller's own deadline has to fire.
    Stall,
}

/// A fake exporter that answers from scripts and records all calls.
pub struct ScriptedExporter {
    name: String,
    script: Mutex<VecDeque<StatusStep>>,
    /// Answer used once the script is exhausted.
    steady: Mutex<StatusStep>,
    status_calls: AtomicUsize,
    /// Reports returned by `get_report`.
    pub reports: Mutex<Vec<Report>>,
    /// Records each `(uuid, method, args)` passed to `driver_call`.
    pub driver_calls: Mutex<Vec<(Uuid, String, Vec<Value>)>>,
}

impl ScriptedExporter {
    /// Creates an exporter that reports `AVAILABLE` at version 0 until scripted.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            steady: Mutex::new(StatusStep::Reply(Ok(status(ExporterStatus::Available, 0)))),
            status_calls: AtomicUsize::new(0),
            reports: Mutex::new(Vec::new()),
            driver_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queues one answer.  When the queue drains, the last queued answer
    /// becomes the steady answer.
    pub fn push_status(&self, reply: Result<StatusResponse, RpcError>) {
        self.push_step(StatusStep::Reply(reply));
    }

    pub fn push_step(&self, step: StatusStep) {
        self.script.lock().unwrap().push_back(step);
    }

    /// Replaces the steady answer and clears any queued steps.
    pub fn set_status(&self, reply: Result<StatusResponse, RpcError>) {
        self.script.lock().unwrap().clear();
        *self.steady.lock().unwrap() = StatusStep::Reply(reply);
    }

    /// Number of `get_status` calls so far.
    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }

    pub fn set_reports(&self, reports: Vec<Report>) {
        *self.reports.lock().unwrap() = reports;
    }
}

#[async_trait]
impl ExporterService for ScriptedExporter {
    async fn get_report(&self) -> Result<Vec<Report>, RpcError> {
        Ok(self.reports.lock().unwrap().clone())
    }

    async fn get_status(&self) -> Result<StatusResponse, RpcError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = self.script.lock().unwrap();
            match script.pop_front() {
                Some(step) => {
                    if script.is_empty() {
                        *self.steady.lock().unwrap() = step.clone();
                    }
                    step
                }
                None => self.steady.lock().unwrap().clone(),
            }
        };
        match step {
            StatusStep::Reply(reply) => reply,
            StatusStep::Stall => std::future::pending().await,
        }
    }

    async fn driver_call(
        &self,
        uuid: Uuid,
        method: String,
        args: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.driver_calls
            .lock()
            .unwrap()
            .push((uuid, method, args));
        Ok(Value::String(self.name.clone()))
    }
}

// ── Channel ───────────────────────────────────────────────────────────────────

/// A channel whose connectivity state is set by the test.
pub struct SwitchableChannel {
    target: String,
    state: Mutex<ConnectivityState>,
    probes: AtomicUsize,
}

impl SwitchableChannel {
    pub fn new(target: &str, state: ConnectivityState) -> Self {
        Self {
            target: target.to_string(),
            state: Mutex::new(state),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: ConnectivityState) {
        *self.state.lock().unwrap() = state;
    }

    /// Number of `state(true)` calls so far.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl Channel for SwitchableChannel {
    fn target(&self) -> &str {
        &self.target
    }

    fn state(&self, try_to_connect: bool) -> ConnectivityState {
        let mut state = self.state.lock().unwrap();
        if try_to_connect {
            self.probes.fetch_add(1, Ordering::SeqCst);
            if *state == ConnectivityState::Idle {
                *state = ConnectivityState::Connecting;
            }
        }
        *state
    }
}

// ── Controller ────────────────────────────────────────────────────────────────

/// A controller that keeps leases and exporters in memory.
///
/// Leases are keyed by their full identifier.  Created leases start out
/// pending; [`InMemoryController::grant`] makes one ready.
#[derive(Default)]
pub struct InMemoryController {
    pub leases: Mutex<BTreeMap<String, Lease>>,
    pub exporters: Mutex<Vec<Exporter>>,
    unreachable: AtomicBool,
    stalled: AtomicBool,
    grant_on_create: Mutex<Option<String>>,
    get_calls: AtomicUsize,
    latency: Mutex<Duration>,
}

impl InMemoryController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent call fails with `UNAVAILABLE` while `true`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// `get_lease` never answers while `true`.
    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    /// `get_lease` waits this long before answering.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    /// Leases created from now on are immediately ready on `exporter`.
    pub fn grant_on_create(&self, exporter: &str) {
        *self.grant_on_create.lock().unwrap() = Some(exporter.to_string());
    }

    /// Stores `lease` under its identifier.
    pub fn insert(&self, lease: Lease) {
        let id = identifier::format(&lease.namespace, ResourceKind::Lease, &lease.name);
        self.leases.lock().unwrap().insert(id, lease);
    }

    /// Appends `condition` to the named lease.
    pub fn push_condition(&self, id: &str, condition: Condition) {
        if let Some(lease) = self.leases.lock().unwrap().get_mut(id) {
            lease.conditions.push(condition);
        }
    }

    /// Marks the named lease ready on `exporter`, starting at `begin`.
    pub fn grant(&self, id: &str, exporter: &str, begin: DateTime<Utc>) {
        if let Some(lease) = self.leases.lock().unwrap().get_mut(id) {
            grant_lease(lease, exporter, begin);
        }
    }

    /// Number of `get_lease` calls so far.
    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), RpcError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(RpcError::unavailable("controller unreachable"));
        }
        Ok(())
    }
}

fn grant_lease(lease: &mut Lease, exporter: &str, begin: DateTime<Utc>) {
    lease.exporter = Some(exporter.to_string());
    lease.effective_begin_time = Some(begin);
    lease.conditions.push(Condition::new(
        condition_type::PENDING,
        ConditionStatus::False,
        "Scheduled",
        "",
    ));
    lease.conditions.push(Condition::new(
        condition_type::READY,
        ConditionStatus::True,
        "Scheduled",
        "",
    ));
}

/// Slices `items` according to the request's page token and size.
fn paginate<T: Clone>(items: &[T], request: &ListRequest) -> (Vec<T>, Option<String>) {
    let start: usize = request
        .page_token
        .as_deref()
        .and_then(|t| t.parse().ok())
        .unwrap_or(0);
    let size = request
        .page_size
        .map(|s| s as usize)
        .filter(|&s| s > 0)
        .unwrap_or(items.len().max(1));
    let end = (start + size).min(items.len());
    let page = items.get(start..end).map(<[T]>::to_vec).unwrap_or_default();
    let next = (end < items.len()).then(|| end.to_string());
    (page, next)
}

fn namespace_of_parent(parent: &str) -> Result<String, RpcError> {
    parent
        .strip_prefix("namespaces/")
        .filter(|ns| !ns.is_empty() && !ns.contains('/'))
        .map(str::to_string)
        .ok_or_else(|| {
            RpcError::new(
                jmp_core::RpcCode::InvalidArgument,
                format!("invalid parent {parent}"),
            )
        })
}

#[async_trait]
impl ControllerService for InMemoryController {
    async fn create_lease(&self, request: CreateLeaseRequest) -> Result<Lease, RpcError> {
        self.check_reachable()?;
        let namespace = namespace_of_parent(&request.parent)?;
        let mut lease = Lease {
            namespace,
            name: Uuid::new_v4().to_string(),
            selector: request.selector,
            duration: request.duration,
            begin_time: request.begin_time,
            effective_begin_time: None,
            effective_end_time: None,
            effective_duration: None,
            client: "test-client".to_string(),
            exporter: None,
            conditions: vec![Condition::new(
                condition_type::PENDING,
                ConditionStatus::True,
                "Pending",
                "",
            )],
        };
        if let Some(exporter) = self.grant_on_create.lock().unwrap().clone() {
            grant_lease(&mut lease, &exporter, Utc::now());
        }
        self.insert(lease.clone());
        Ok(lease)
    }

    async fn get_lease(&self, name: String) -> Result<Lease, RpcError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if self.stalled.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.check_reachable()?;
        self.leases
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .ok_or_else(|| RpcError::not_found(format!("lease {name} not found")))
    }

    async fn list_leases(&self, request: ListRequest) -> Result<LeaseList, RpcError> {
        self.check_reachable()?;
        let namespace = namespace_of_parent(&request.parent)?;
        let all: Vec<Lease> = self
            .leases
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.namespace == namespace)
            .cloned()
            .collect();
        let (leases, next_page_token) = paginate(&all, &request);
        Ok(LeaseList {
            leases,
            next_page_token,
        })
    }

    async fn update_lease(&self, request: UpdateLeaseRequest) -> Result<Lease, RpcError> {
        self.check_reachable()?;
        let mut leases = self.leases.lock().unwrap();
        let lease = leases
            .get_mut(&request.name)
            .ok_or_else(|| RpcError::not_found(format!("lease {} not found", request.name)))?;
        if let Some(duration) = request.duration {
            lease.duration = duration;
        }
        if let Some(begin_time) = request.begin_time {
            lease.begin_time = Some(begin_time);
        }
        Ok(lease.clone())
    }

    async fn delete_lease(&self, name: String) -> Result<(), RpcError> {
        self.check_reachable()?;
        self.leases
            .lock()
            .unwrap()
            .remove(&name)
            .map(|_| ())
            .ok_or_else(|| RpcError::not_found(format!("lease {name} not found")))
    }

    async fn list_exporters(&self, request: ListRequest) -> Result<ExporterList, RpcError> {
        self.check_reachable()?;
        let namespace = namespace_of_parent(&request.parent)?;
        let selector = match request.filter.as_deref() {
            Some(filter) => Some(Selector::parse(filter).map_err(|e| {
                RpcError::new(jmp_core::RpcCode::InvalidArgument, e.to_string())
            })?),
            None => None,
        };
        let all: Vec<Exporter> = self
            .exporters
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.namespace == namespace)
            .filter(|e| selector.as_ref().map_or(true, |s| e.matches(s)))
            .cloned()
            .collect();
        let (exporters, next_page_token) = paginate(&all, &request);
        Ok(ExporterList {
            exporters,
            next_page_token,
        })
    }

    async fn get_exporter(&self, name: String) -> Result<Exporter, RpcError> {
        self.check_reachable()?;
        let (namespace, short) = identifier::parse(&name, ResourceKind::Exporter)
            .map_err(|e| RpcError::new(jmp_core::RpcCode::InvalidArgument, e.to_string()))?;
        self.exporters
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.namespace == namespace && e.name == short)
            .cloned()
            .ok_or_else(|| RpcError::not_found(format!("exporter {name} not found")))
    }
}

// ── Clock ─────────────────────────────────────────────────────────────────────

/// Wall clock anchored at construction and advanced by tokio's clock, so
/// `tokio::time::pause`/`advance` move it too.
pub struct PausedClock {
    anchor_wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl PausedClock {
    /// Must be called from within a tokio runtime.
    pub fn starting_at(anchor_wall: DateTime<Utc>) -> Self {
        Self {
            anchor_wall,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Clock for PausedClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = tokio::time::Instant::now().duration_since(self.anchor);
        let elapsed = chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.anchor_wall + elapsed
    }
}
