//! # jmp-core
//!
//! Shared library for the Jumpstarter client core containing the lease and
//! exporter-status domain model, the capability report records, and the
//! RPC contracts the coordination layer talks through.
//!
//! This crate performs no I/O of its own.  It has zero dependencies on
//! sockets, timers, or a particular RPC transport.
//!
//! # Architecture overview (for beginners)
//!
//! Jumpstarter lets a client borrow a piece of remote hardware (an
//! "exporter") for a limited time.  A central controller hands out
//! time-boxed *leases*; once a lease is ready the client talks to the
//! exporter directly and drives its hardware through a tree of capability
//! clients.
//!
//! This crate (`jmp-core`) is the shared foundation.  It defines:
//!
//! - **`domain`** – Pure data and rules: leases and their conditions, label
//!   selectors, the exporter status lifecycle, capability reports and the
//!   order in which a report tree must be rebuilt.
//!
//! - **`protocol`** – The seams to the outside world: the controller and
//!   exporter services as async traits, the channel connectivity contract,
//!   and the status-code style [`RpcError`].

pub mod domain;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `jmp_core::Lease` instead of `jmp_core::domain::lease::Lease`.
pub use domain::exporter::Exporter;
pub use domain::hooks::HookContext;
pub use domain::lease::{Condition, ConditionStatus, Lease, LeaseStatus};
pub use domain::report::{topological_order, Report, ReportOrderError};
pub use domain::selector::{Selector, SelectorError};
pub use domain::status::ExporterStatus;
pub use protocol::channel::{Channel, ConnectivityState};
pub use protocol::controller::ControllerService;
pub use protocol::error::{RpcCode, RpcError};
pub use protocol::exporter::{ExporterService, StatusResponse};
