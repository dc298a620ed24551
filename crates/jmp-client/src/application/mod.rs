//! Application layer of the client core.
//!
//! - **`lease`** – requests, updates and releases a lease against the
//!   controller, and runs the monitor that warns before the lease ends.
//!
//! - **`status_monitor`** – polls one exporter's status in the background
//!   and lets many callers wait for a target status.
//!
//! - **`session`** – rebuilds the exporter's capability tree from its flat
//!   report, substituting stubs for client classes that are not installed.

pub mod lease;
pub mod session;
pub mod status_monitor;
