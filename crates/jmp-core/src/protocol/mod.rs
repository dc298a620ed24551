//! RPC contracts consumed by the client core.
//!
//! The transport itself (gRPC over TLS, a router tunnel, a unix socket) is
//! an external collaborator.  This module only fixes the *shape* of the
//! conversation so that the coordination layer can be written, and tested,
//! against traits:
//!
//! - **`channel`**    – connectivity state of one physical channel.
//! - **`controller`** – lease and exporter CRUD against the controller.
//! - **`exporter`**   – report, status and driver calls against an exporter.
//! - **`error`**      – status-code style errors shared by both services.

pub mod channel;
pub mod controller;
pub mod error;
pub mod exporter;
