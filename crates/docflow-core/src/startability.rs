//! Duplicate-dispatch guard for slow external calls.
//!
//! Before a job is (re)started, the most recent `request_acknowledged`
//! trace event is inspected. A fresh acknowledgment means a provider call
//! is probably still in flight; an acknowledgment older than
//! [`DISPATCH_WINDOW_MS`] is treated as a lost request.

use chrono::{DateTime, Utc};

use crate::models::{trace_names, Job, JobStatus};

/// How long an acknowledged request blocks another start (10 minutes).
pub const DISPATCH_WINDOW_MS: i64 = 10 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Startability {
    Allowed,
    /// Refused with reason `already_started`.
    AlreadyStarted { acknowledged_at: DateTime<Utc> },
}

impl Startability {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Startability::Allowed)
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            Startability::Allowed => None,
            Startability::AlreadyStarted { .. } => Some("already_started"),
        }
    }
}

/// Decide whether `job` may be started at `now`.
pub fn can_start(job: &Job, now: DateTime<Utc>) -> Startability {
    if job.status == JobStatus::Failed {
        return Startability::Allowed;
    }

    match job.latest_trace(trace_names::REQUEST_ACKNOWLEDGED) {
        Some(ack) if (now - ack.at).num_milliseconds() < DISPATCH_WINDOW_MS => {
            Startability::AlreadyStarted {
                acknowledged_at: ack.at,
            }
        }
        _ => Startability::Allowed,
    }
}

/// A forced policy or a cache bypass lets an explicit restart ignore the window.
pub fn bypasses_window(job: &Job) -> bool {
    job.policies.any_force() || !job.correlation.options.use_cache
}
