//! Uniform surface over the hosted forges.
//!
//! GitHub- and GitLab-specific quirks (PAT vs Bearer auth,
//! installation tokens, atomic-post fallback, per-repo webhook
//! secrets) stay contained in their adapter; everything above this
//! module speaks [`ForgeAdapter`].

pub mod github;
pub mod gitlab;

pub use github::GitHubForge;
pub use gitlab::GitLabForge;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use reviewd_core::{EventType, FileChange, Provider, ReviewComment};

/// The `(base, start, head)` SHA triple GitLab uses to anchor a diff
/// position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffRefs {
    pub base_sha: String,
    pub start_sha: String,
    pub head_sha: String,
}

/// PR/MR metadata needed for review admission and posting.
#[derive(Debug, Clone)]
pub struct PrMetadata {
    pub title: String,
    pub description: String,
    pub author: String,
    pub base_branch: String,
    pub head_branch: String,
    /// Head commit to pin a GitHub review to, when known.
    pub head_sha: Option<String>,
    pub draft: bool,
    /// GitLab only.
    pub diff_refs: Option<DiffRefs>,
}

/// A webhook payload reduced to the fields the pipeline cares about.
/// `None` from parsing means the event is not interesting (wrong
/// object kind or an unmapped action) and should be skipped.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub event_type: EventType,
    pub raw_action: String,
    /// Forge identity in `owner/name` form.
    pub repo_name: String,
    pub pr_number: u64,
    pub pr_title: String,
    pub pr_url: String,
    pub pr_author: String,
    pub base_branch: String,
    pub head_branch: String,
}

#[async_trait]
pub trait ForgeAdapter: Send + Sync {
    fn provider(&self) -> Provider;

    /// Verify a webhook request. `signature` is the value of the
    /// provider's signature/token header.
    fn verify_webhook(&self, raw_body: &[u8], signature: &str, secret: &str) -> bool;

    /// Extract the normalized event, or `None` for payloads the
    /// pipeline ignores.
    fn parse_event(&self, raw_body: &[u8]) -> Option<ParsedEvent>;

    /// Fetch PR metadata and the changed-file list.
    async fn fetch_diff(
        &self,
        repo_name: &str,
        pr_number: u64,
        token: &str,
    ) -> Result<(PrMetadata, Vec<FileChange>)>;

    /// Post review comments; returns how many the forge accepted.
    async fn post_review(
        &self,
        repo_name: &str,
        pr_number: u64,
        token: &str,
        comments: &[ReviewComment],
        meta: &PrMetadata,
    ) -> Result<usize>;

    /// Token to post with: a configured bot identity when available,
    /// otherwise the user's token.
    async fn posting_token(&self, repo_name: &str, user_token: &str) -> String;

    /// Authenticated clone URL for the repository.
    fn clone_url(&self, repo_name: &str, token: &str) -> String;

    /// `(refspec, local_branch)` that fetches the PR head for checkout.
    fn review_ref(&self, pr_number: u64) -> (String, String);
}

/// Compare two byte strings in time independent of where they differ.
/// Length is folded into the result instead of short-circuiting.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}
