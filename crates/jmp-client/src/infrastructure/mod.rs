//! Infrastructure layer of the client core.
//!
//! **Dependency rule**: this layer may depend on `application` and `jmp_core`,
//! but MUST NOT be imported by the domain layer.
//!
//! # Sub-modules
//!
//! - **`multipath`** – `ChannelSet` and `MultipathStub`: one exporter endpoint
//!   over several prioritised channels.
//!
//! - **`portal`** – `BlockingPortal`, the thread that runs the event loop for
//!   synchronous callers.
//!
//! - **`config`** – TOML client configuration, loaded from and saved to a
//!   caller-chosen path and validated on load.
//!
//! - **`logging`** – `tracing` subscriber set-up.
//!
//! - **`mock`** – in-memory controller, exporter and channel fakes for tests.

pub mod config;
pub mod logging;
pub mod mock;
pub mod multipath;
pub mod portal;
