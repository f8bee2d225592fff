pub mod diff;
pub mod envelope;
pub mod interview;
pub mod model;
pub mod prompt;

pub use diff::{format_comment_body, format_diff, FileChange, FileStatus};
pub use envelope::{extract_agent_text, parse_agent_json, sanitize_json, EnvelopeError};
pub use interview::{InterviewAnswer, InterviewQuestion, InterviewStep};
pub use model::{
    dedup_against_prior, EventType, Provider, RepoAnalysisPayload, RepoStatus, ReviewComment,
    Severity, WebhookEvent,
};

/// Returns the pipeline version string.
pub fn version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
