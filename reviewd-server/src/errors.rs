//! Job error taxonomy.
//!
//! Workers return these so the scheduler can decide between leaving a
//! message for redelivery (retryable) and consuming it (terminal for
//! this message). Admission-control skips are not errors; jobs report
//! them through their normal return value.

use std::fmt;

#[derive(Debug)]
pub enum JobError {
    /// Network timeouts, 5xx responses, storage blips. The message is
    /// left on the queue and redelivers after the visibility timeout.
    Transient(anyhow::Error),
    /// Token invalid after a refresh attempt. Not retryable; retrying
    /// cannot succeed until the user re-authenticates.
    Unauthorized(String),
    /// Sandbox container failed (non-zero exit, missing binary).
    /// Retryable up to the redelivery cap.
    Sandbox(String),
    /// Sandbox exec exceeded its wall clock and was killed.
    /// Retryable up to the redelivery cap.
    SandboxTimeout,
    /// The agent's response could not be decoded. Consumed without
    /// retry so the same bad invocation does not burn quota again.
    AgentResponse(String),
}

impl JobError {
    /// Whether the scheduler should leave the message for redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Transient(_) | JobError::Sandbox(_) | JobError::SandboxTimeout
        )
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobError::Transient(e) => write!(f, "transient failure: {:#}", e),
            JobError::Unauthorized(msg) => write!(f, "unauthorized: {}", msg),
            JobError::Sandbox(msg) => write!(f, "sandbox failure: {}", msg),
            JobError::SandboxTimeout => write!(f, "sandbox execution timed out"),
            JobError::AgentResponse(msg) => write!(f, "agent response unusable: {}", msg),
        }
    }
}

impl std::error::Error for JobError {}

impl From<anyhow::Error> for JobError {
    fn from(e: anyhow::Error) -> Self {
        JobError::Transient(e)
    }
}

/// Outcome of a job that ran to a decision.
#[derive(Debug, PartialEq, Eq)]
pub enum JobOutcome {
    /// Work was done; consume the message.
    Completed,
    /// Admission control declined the job; consume the message.
    Skipped(&'static str),
}
