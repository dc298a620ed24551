//! The controller's lease record and the rules derived from it.
//!
//! # Lease conditions (for beginners)
//!
//! The controller never reports a single "state" field.  Instead it keeps an
//! ordered list of *conditions* (`Pending`, `Ready`, `Unsatisfiable`,
//! `Expired`, ...), each with a `True`/`False`/`Unknown` status and a
//! machine-readable reason.  The latest condition decides the label shown to
//! users:
//!
//! | Latest condition | Label     |
//! |------------------|-----------|
//! | `Ready=True`     | In-Use    |
//! | `Ready=False`    | Waiting   |
//! | `Expired`        | Expired   |
//! | anything else    | Unknown, or Ended once an end time is recorded |
//!
//! A lease whose `effective_end_time` is set has ended, whatever its
//! conditions say.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known condition types set by the controller.
pub mod condition_type {
    pub const PENDING: &str = "Pending";
    pub const READY: &str = "Ready";
    pub const UNSATISFIABLE: &str = "Unsatisfiable";
    pub const INVALID: &str = "Invalid";
    pub const EXPIRED: &str = "Expired";
}

/// Reason recorded on `Ready=False` when the holder released the lease.
pub const REASON_RELEASED: &str = "Released";

/// Tri-state status of a single condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// One entry of a lease's condition list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub kind: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transition_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub observed_generation: i64,
}

impl Condition {
    /// Builds a condition without a transition time, mostly for tests and fakes.
    pub fn new(kind: &str, status: ConditionStatus, reason: &str, message: &str) -> Self {
        Self {
            kind: kind.to_string(),
            status,
            reason: reason.to_string(),
            message: message.to_string(),
            transition_time: None,
            observed_generation: 0,
        }
    }
}

fn find<'a>(conditions: &'a [Condition], kind: &str) -> Option<&'a Condition> {
    conditions.iter().rev().find(|c| c.kind == kind)
}

/// True when a condition of `kind` is present with status `True`.
pub fn condition_true(conditions: &[Condition], kind: &str) -> bool {
    find(conditions, kind).is_some_and(|c| c.status == ConditionStatus::True)
}

/// True when a condition of `kind` is present with status `False`.
pub fn condition_false(conditions: &[Condition], kind: &str) -> bool {
    find(conditions, kind).is_some_and(|c| c.status == ConditionStatus::False)
}

/// Returns the message of the condition of `kind`, if present.
pub fn condition_message<'a>(conditions: &'a [Condition], kind: &str) -> Option<&'a str> {
    find(conditions, kind).map(|c| c.message.as_str())
}

/// True when a condition of `kind` has the given status and reason.
pub fn condition_present_and_equal(
    conditions: &[Condition],
    kind: &str,
    status: ConditionStatus,
    reason: &str,
) -> bool {
    find(conditions, kind).is_some_and(|c| c.status == status && c.reason == reason)
}

/// Human-readable status label derived from a lease's latest condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseStatus {
    InUse,
    Waiting,
    Expired,
    Ended,
    Unknown,
}

impl fmt::Display for LeaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LeaseStatus::InUse => "In-Use",
            LeaseStatus::Waiting => "Waiting",
            LeaseStatus::Expired => "Expired",
            LeaseStatus::Ended => "Ended",
            LeaseStatus::Unknown => "Unknown",
        })
    }
}

/// A lease as returned by the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub namespace: String,
    pub name: String,
    pub selector: String,
    /// Duration requested by the client.
    pub duration: Duration,
    /// Requested start time for scheduled leases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_begin_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_end_time: Option<DateTime<Utc>>,
    /// Duration granted by the controller, when it differs from the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective_duration: Option<Duration>,
    /// Name of the client holding the lease.
    #[serde(default)]
    pub client: String,
    /// Name of the exporter assigned to the lease; `None` until scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exporter: Option<String>,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Lease {
    /// Label derived from the latest condition.
    pub fn status(&self) -> LeaseStatus {
        match self.conditions.last() {
            Some(c) if c.kind == condition_type::READY && c.status == ConditionStatus::True => {
                LeaseStatus::InUse
            }
            Some(c) if c.kind == condition_type::READY && c.status == ConditionStatus::False => {
                LeaseStatus::Waiting
            }
            Some(c) if c.kind == condition_type::EXPIRED => LeaseStatus::Expired,
            _ if self.has_ended() => LeaseStatus::Ended,
            _ => LeaseStatus::Unknown,
        }
    }

    /// True once the controller has recorded an effective end time.
    pub fn has_ended(&self) -> bool {
        self.effective_end_time.is_some()
    }

    /// True when the latest `Ready` condition is `True`.
    pub fn is_ready(&self) -> bool {
        condition_true(&self.conditions, condition_type::READY)
    }

    /// Best known end of the lease.
    ///
    /// `effective_end_time` wins when present.  Otherwise the end is
    /// `effective_begin_time` plus the granted duration, falling back to the
    /// requested duration.  Returns `None` before the lease has begun.
    pub fn end_time(&self) -> Option<DateTime<Utc>> {
        if let Some(end) = self.effective_end_time {
            return Some(end);
        }
        let begin = self.effective_begin_time?;
        let duration = self.effective_duration.unwrap_or(self.duration);
        let duration = chrono::Duration::from_std(duration).ok()?;
        begin.checked_add_signed(duration)
    }

    /// Time left until `end`, clamped to zero once it has passed.
    pub fn remaining_until(end: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        (end - now).to_std().unwrap_or(Duration::ZERO)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
