//! Domain entities for the Jumpstarter client core.
//!
//! This module contains pure business rules with no infrastructure
//! dependencies: nothing here opens a connection, sleeps, or spawns a task.
//!
//! # What lives here? (for beginners)
//!
//! - **`lease`** – the controller's lease record and how its condition list
//!   turns into a human-readable status and an end time.
//! - **`selector`** – `key=value,key=value` label selectors.
//! - **`status`** – the exporter lifecycle stages reported by GetStatus.
//! - **`report`** – one node of an exporter's capability tree, and the
//!   parent-before-child ordering used to rebuild the tree.
//! - **`exporter`** – the controller's view of an exporter.
//! - **`identifier`** – `namespaces/<ns>/<kind>/<name>` resource names.
//! - **`hooks`** – identifiers handed to the external hook executor.

pub mod exporter;
pub mod hooks;
pub mod identifier;
pub mod lease;
pub mod report;
pub mod selector;
pub mod status;
