//! Exporter lifecycle stages as reported by the exporter's GetStatus RPC.
//!
//! # Lifecycle (for beginners)
//!
//! ```text
//! Available ──► BeforeLeaseHook ──► LeaseReady ──► AfterLeaseHook ──► Available
//!                     │                                  │
//!            BeforeLeaseHookFailed               AfterLeaseHookFailed
//! ```
//!
//! A client may only drive hardware while the exporter is `LeaseReady`.
//! The other stages exist so hooks (scripts run by the exporter before and
//! after each lease) can prepare and clean up the hardware.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when a string or wire integer does not name a known status.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown exporter status: {0}")]
pub struct UnknownStatus(pub String);

/// Operational stage of an exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExporterStatus {
    Unspecified,
    Offline,
    Available,
    BeforeLeaseHook,
    LeaseReady,
    AfterLeaseHook,
    BeforeLeaseHookFailed,
    AfterLeaseHookFailed,
}

impl ExporterStatus {
    /// Every status, in wire order.
    pub const ALL: [ExporterStatus; 8] = [
        ExporterStatus::Unspecified,
        ExporterStatus::Offline,
        ExporterStatus::Available,
        ExporterStatus::BeforeLeaseHook,
        ExporterStatus::LeaseReady,
        ExporterStatus::AfterLeaseHook,
        ExporterStatus::BeforeLeaseHookFailed,
        ExporterStatus::AfterLeaseHookFailed,
    ];

    /// Converts the wire enum value.
    ///
    /// # Errors
    ///
    /// Returns [`UnknownStatus`] for values outside the known range.
    pub fn from_wire(value: i32) -> Result<Self, UnknownStatus> {
        usize::try_from(value)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .ok_or_else(|| UnknownStatus(value.to_string()))
    }

    /// Returns the wire enum value.
    pub fn to_wire(self) -> i32 {
        self as i32
    }

    /// Returns the canonical upper-case name, e.g. `"LEASE_READY"`.
    pub fn as_str(self) -> &'static str {
        match self {
            ExporterStatus::Unspecified => "UNSPECIFIED",
            ExporterStatus::Offline => "OFFLINE",
            ExporterStatus::Available => "AVAILABLE",
            ExporterStatus::BeforeLeaseHook => "BEFORE_LEASE_HOOK",
            ExporterStatus::LeaseReady => "LEASE_READY",
            ExporterStatus::AfterLeaseHook => "AFTER_LEASE_HOOK",
            ExporterStatus::BeforeLeaseHookFailed => "BEFORE_LEASE_HOOK_FAILED",
            ExporterStatus::AfterLeaseHookFailed => "AFTER_LEASE_HOOK_FAILED",
        }
    }

    /// True for the two hook-failure stages.
    pub fn is_hook_failure(self) -> bool {
        matches!(
            self,
            ExporterStatus::BeforeLeaseHookFailed | ExporterStatus::AfterLeaseHookFailed
        )
    }

    /// True when the exporter accepts driver calls.
    ///
    /// Hooks drive the hardware through the same session, so calls are also
    /// allowed while a hook is running.
    pub fn accepts_driver_calls(self) -> bool {
        matches!(
            self,
            ExporterStatus::LeaseReady
                | ExporterStatus::BeforeLeaseHook
                | ExporterStatus::AfterLeaseHook
        )
    }
}

impl fmt::Display for ExporterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExporterStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
