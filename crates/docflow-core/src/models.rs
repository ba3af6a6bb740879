//! Core data models used throughout docflow.
//!
//! A [`Job`] carries one source document through the fixed
//! Extract → Transform → Ingest pipeline. These types are the persisted
//! wire shape: the queue stores them as JSON columns and the HTTP API
//! returns them verbatim.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Trace event names written by the worker, queue, and callback channel.
pub mod trace_names {
    /// The external provider accepted a request and will report back out-of-band.
    pub const REQUEST_ACKNOWLEDGED: &str = "request_acknowledged";
    pub const GATE_DECISION: &str = "gate_decision";
    pub const CALLBACK_RECEIVED: &str = "callback_received";
    pub const STALE_LEASE_RECLAIM: &str = "stale_lease_reclaim";
    pub const JOB_RESTARTED: &str = "job_restarted";
    pub const ORCHESTRATOR_ERROR: &str = "orchestrator_error";
    pub const LEGACY_ADOPTION: &str = "legacy_adoption";
    pub const PHASE_NEEDS: &str = "phase_needs";
}

/// Overall job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PipelineError::BadRequest(format!(
                "unknown job status: '{}'",
                other
            ))),
        }
    }
}

/// Status of a single phase step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed)
    }

    /// Steps move pending → running → terminal. A skipped step goes
    /// straight from pending to completed.
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        matches!(
            (self, next),
            (StepStatus::Pending, StepStatus::Running)
                | (StepStatus::Pending, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Completed)
                | (StepStatus::Running, StepStatus::Failed)
        )
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The three fixed pipeline phases, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Extract,
    Transform,
    Ingest,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Extract, Phase::Transform, Phase::Ingest];

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Extract => "extract",
            Phase::Transform => "transform",
            Phase::Ingest => "ingest",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "extract" => Ok(Phase::Extract),
            "transform" | "template" => Ok(Phase::Transform),
            "ingest" => Ok(Phase::Ingest),
            other => Err(PipelineError::BadRequest(format!(
                "unknown phase: '{}'. Must be extract, transform, or ingest.",
                other
            ))),
        }
    }
}

/// Per-phase directive controlling whether a phase may execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhasePolicy {
    Do,
    Ignore,
    Force,
    Skip,
    #[default]
    Auto,
}

impl PhasePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhasePolicy::Do => "do",
            PhasePolicy::Ignore => "ignore",
            PhasePolicy::Force => "force",
            PhasePolicy::Skip => "skip",
            PhasePolicy::Auto => "auto",
        }
    }
}

impl fmt::Display for PhasePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhasePolicy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "do" => Ok(PhasePolicy::Do),
            "ignore" => Ok(PhasePolicy::Ignore),
            "force" => Ok(PhasePolicy::Force),
            "skip" => Ok(PhasePolicy::Skip),
            "auto" => Ok(PhasePolicy::Auto),
            other => Err(PipelineError::BadRequest(format!(
                "unknown phase policy: '{}'. Must be do, ignore, force, skip, or auto.",
                other
            ))),
        }
    }
}

/// One policy per phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PhasePolicies {
    #[serde(default)]
    pub extract: PhasePolicy,
    #[serde(default)]
    pub transform: PhasePolicy,
    #[serde(default)]
    pub ingest: PhasePolicy,
}

impl PhasePolicies {
    pub fn get(&self, phase: Phase) -> PhasePolicy {
        match phase {
            Phase::Extract => self.extract,
            Phase::Transform => self.transform,
            Phase::Ingest => self.ingest,
        }
    }

    pub fn set(&mut self, phase: Phase, policy: PhasePolicy) {
        match phase {
            Phase::Extract => self.extract = policy,
            Phase::Transform => self.transform = policy,
            Phase::Ingest => self.ingest = policy,
        }
    }

    pub fn any_force(&self) -> bool {
        Phase::ALL
            .iter()
            .any(|p| self.get(*p) == PhasePolicy::Force)
    }
}

/// Reference to the source document in the storage backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub item_id: String,
    pub parent_id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Option bag carried by every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobOptions {
    pub target_language: String,
    #[serde(default)]
    pub source_language: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    /// `false` bypasses cached artifacts and the startability window.
    #[serde(default = "default_true")]
    pub use_cache: bool,
}

/// Source reference plus options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Correlation {
    pub source: SourceRef,
    pub options: JobOptions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Execution record of one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: Phase,
    pub status: StepStatus,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<StepError>,
    #[serde(default)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

impl Step {
    pub fn pending(phase: Phase) -> Self {
        Self {
            name: phase,
            status: StepStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            details: serde_json::Map::new(),
        }
    }

    /// Move the step to `next`, stamping the matching timestamp.
    pub fn transition(&mut self, next: StepStatus, now: DateTime<Utc>) -> Result<(), PipelineError> {
        if !self.status.can_transition_to(next) {
            return Err(PipelineError::InvalidStepTransition {
                phase: self.name,
                from: self.status,
                to: next,
            });
        }
        match next {
            StepStatus::Running => self.started_at = Some(now),
            StepStatus::Completed | StepStatus::Failed => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.finished_at = Some(now);
            }
            StepStatus::Pending => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn is_skipped(&self) -> bool {
        self.details
            .get("skipped")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }
}

/// Free-form log line attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub level: String,
    pub message: String,
}

/// Typed audit event attached to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub at: DateTime<Utc>,
    pub name: String,
    #[serde(default)]
    pub attributes: serde_json::Value,
}

impl TraceEvent {
    pub fn new(name: &str, attributes: serde_json::Value) -> Self {
        Self::at(Utc::now(), name, attributes)
    }

    pub fn at(at: DateTime<Utc>, name: &str, attributes: serde_json::Value) -> Self {
        Self {
            at,
            name: name.to_string(),
            attributes,
        }
    }
}

/// Error payload stored on a failed job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub code: String,
    pub message: String,
}

/// Ownership marker held by the worker processing a running job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub process_id: String,
    pub heartbeat_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_stale(&self, now: DateTime<Utc>, stale_ms: i64) -> bool {
        self.heartbeat_at.timestamp_millis() < now.timestamp_millis() - stale_ms
    }
}

/// The persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub library_id: Option<String>,
    pub correlation: Correlation,
    pub policies: PhasePolicies,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub logs: Vec<LogEntry>,
    #[serde(default)]
    pub trace: Vec<TraceEvent>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JobError>,
    #[serde(default)]
    pub process_id: Option<String>,
    #[serde(default)]
    pub heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn step(&self, phase: Phase) -> Option<&Step> {
        self.steps.iter().find(|s| s.name == phase)
    }

    pub fn phases(&self) -> Vec<Phase> {
        self.steps.iter().map(|s| s.name).collect()
    }

    pub fn lease(&self) -> Option<Lease> {
        match (&self.process_id, self.heartbeat_at) {
            (Some(pid), Some(hb)) => Some(Lease {
                process_id: pid.clone(),
                heartbeat_at: hb,
            }),
            _ => None,
        }
    }

    /// Most recent trace event with the given name.
    pub fn latest_trace(&self, name: &str) -> Option<&TraceEvent> {
        self.trace
            .iter()
            .filter(|e| e.name == name)
            .max_by_key(|e| e.at)
    }

    pub fn target_language(&self) -> &str {
        &self.correlation.options.target_language
    }
}

/// Caller-supplied fields for a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(default = "default_job_type")]
    pub job_type: String,
    pub correlation: Correlation,
    #[serde(default)]
    pub policies: PhasePolicies,
    #[serde(default)]
    pub user_email: Option<String>,
    #[serde(default)]
    pub library_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_job_type() -> String {
    "pdf".to_string()
}
