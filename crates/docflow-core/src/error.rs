//! Error taxonomy for the pipeline.
//!
//! Plumbing code returns `anyhow::Result`; errors that callers need to
//! tell apart are raised as a [`PipelineError`] and recovered with
//! `anyhow::Error::downcast_ref`.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{Phase, StepStatus};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Storage or network collaborator failed; a retry may succeed.
    #[error("transient provider error: {0}")]
    TransientProvider(String),

    /// Frontmatter or facet type mismatch.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The startability check refused a second dispatch.
    #[error("job {job_id} already started (acknowledged at {acknowledged_at})")]
    AlreadyInProgress {
        job_id: String,
        acknowledged_at: DateTime<Utc>,
    },

    #[error("job {job_id} failed: {message}")]
    TerminalJobFailure { job_id: String, message: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid step transition for {phase}: {from} -> {to}")]
    InvalidStepTransition {
        phase: Phase,
        from: StepStatus,
        to: StepStatus,
    },
}

impl PipelineError {
    /// Machine-readable code stored on failed steps and returned by the API.
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::TransientProvider(_) => "transient_provider",
            PipelineError::Validation(_) => "validation",
            PipelineError::AlreadyInProgress { .. } => "already_started",
            PipelineError::TerminalJobFailure { .. } => "terminal_failure",
            PipelineError::BadRequest(_) => "bad_request",
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Unauthorized(_) => "unauthorized",
            PipelineError::InvalidStepTransition { .. } => "invalid_transition",
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PipelineError::TransientProvider(_))
    }
}

/// Code for an arbitrary error: the [`PipelineError`] code when there is
/// one in the chain, `internal` otherwise.
pub fn error_code(err: &anyhow::Error) -> &'static str {
    err.chain()
        .find_map(|e| e.downcast_ref::<PipelineError>())
        .map(|e| e.code())
        .unwrap_or("internal")
}
