//! jmp-client library entry point.
//!
//! # What does jmp-client do? (for beginners)
//!
//! A Jumpstarter client borrows remote hardware.  It asks the controller
//! for a *lease* on an exporter matching a label selector, waits until the
//! exporter has finished preparing the hardware, and then drives that
//! hardware through a tree of capability clients.  This crate coordinates
//! those steps:
//!
//! 1. [`application::lease::LeaseManager`] requests the lease, waits for it
//!    to become ready, and warns before it expires.
//! 2. [`infrastructure::multipath::MultipathStub`] presents the direct and
//!    controller-routed channels to the exporter as one endpoint.
//! 3. [`application::status_monitor::StatusMonitor`] polls the exporter's
//!    status so callers can wait for `LEASE_READY` without polling
//!    themselves.
//! 4. [`application::session::SessionBuilder`] rebuilds the exporter's
//!    driver tree from its capability report.
//! 5. Releasing the lease stops the monitor and tears the session down.
//!
//! Everything is async.  Synchronous callers use
//! [`infrastructure::portal::BlockingPortal`].

/// Application layer: lease, status and session coordination.
pub mod application;

/// Infrastructure layer: channels, the blocking portal, config, logging, fakes.
pub mod infrastructure;
