//! Core domain types shared between the server and the CLI.
//!
//! These are the normalized shapes that cross module boundaries: webhook
//! events after forge-specific parsing, review comments as the agent
//! emits them, and the repository lifecycle states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Hosted forge a repository lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
    GitLab,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::GitLab => "gitlab",
        }
    }

    pub fn parse(s: &str) -> Option<Provider> {
        match s {
            "github" => Some(Provider::GitHub),
            "gitlab" => Some(Provider::GitLab),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized pull/merge-request event type.
///
/// Raw forge actions are mapped onto these four; anything else is
/// dropped at the ingress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PrOpened,
    PrUpdated,
    PrClosed,
    PrReopened,
}

impl EventType {
    /// Map a raw GitHub `pull_request` action to an event type.
    pub fn from_github_action(action: &str) -> Option<EventType> {
        match action {
            "opened" => Some(EventType::PrOpened),
            "synchronize" => Some(EventType::PrUpdated),
            "reopened" => Some(EventType::PrReopened),
            "closed" => Some(EventType::PrClosed),
            _ => None,
        }
    }

    /// Map a raw GitLab merge-request action to an event type.
    pub fn from_gitlab_action(action: &str) -> Option<EventType> {
        match action {
            "open" => Some(EventType::PrOpened),
            "update" => Some(EventType::PrUpdated),
            "reopen" => Some(EventType::PrReopened),
            "close" | "merge" => Some(EventType::PrClosed),
            _ => None,
        }
    }
}

/// A pull/merge-request event normalized across providers, as enqueued
/// on the `webhook_events` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub provider: Provider,
    pub event_type: EventType,
    /// The connected-repository slug this event was matched to.
    pub repo_slug: String,
    /// Forge identity in `owner/name` form.
    pub repo_name: String,
    pub pr_number: u64,
    pub pr_title: String,
    pub pr_url: String,
    pub pr_author: String,
    pub base_branch: String,
    pub head_branch: String,
    /// The raw forge action string, kept for logging.
    pub raw_action: String,
    pub user_id: String,
    pub received_at: DateTime<Utc>,
}

/// Payload for a one-shot repository analysis job on the
/// `repo_analysis` queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoAnalysisPayload {
    pub user_id: String,
    pub slug: String,
    pub repo_name: String,
    pub provider: Provider,
}

/// Lifecycle state of a connected repository.
///
/// Advances `analyzing -> interview -> active`, with `active <-> paused`
/// toggled by the user. Never regresses to `analyzing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    Analyzing,
    Interview,
    Active,
    Paused,
}

impl RepoStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepoStatus::Analyzing => "analyzing",
            RepoStatus::Interview => "interview",
            RepoStatus::Active => "active",
            RepoStatus::Paused => "paused",
        }
    }

    pub fn parse(s: &str) -> Option<RepoStatus> {
        match s {
            "analyzing" => Some(RepoStatus::Analyzing),
            "interview" => Some(RepoStatus::Interview),
            "active" => Some(RepoStatus::Active),
            "paused" => Some(RepoStatus::Paused),
            _ => None,
        }
    }
}

/// Severity of a single review comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    Warning,
    Suggestion,
}

/// One inline review comment as emitted by the agent and posted to the
/// forge. `end_line`, when present, is >= `line`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewComment {
    pub file: String,
    pub line: u64,
    #[serde(rename = "endLine", default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u64>,
    pub severity: Severity,
    pub category: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// First 80 characters of a message, lowercased, for dedup comparison.
fn message_key(message: &str) -> String {
    message.chars().take(80).collect::<String>().to_lowercase()
}

/// Drop comments already flagged by a prior review of the same PR.
///
/// A new comment is a duplicate when some prior comment is on the same
/// file within 3 lines and shares the same first 80 characters of
/// message text (case-insensitive). Order of survivors is preserved.
pub fn dedup_against_prior(
    comments: Vec<ReviewComment>,
    prior: &[ReviewComment],
) -> Vec<ReviewComment> {
    comments
        .into_iter()
        .filter(|c| {
            !prior.iter().any(|p| {
                p.file == c.file
                    && p.line.abs_diff(c.line) <= 3
                    && message_key(&p.message) == message_key(&c.message)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(file: &str, line: u64, message: &str) -> ReviewComment {
        ReviewComment {
            file: file.to_string(),
            line,
            end_line: None,
            severity: Severity::Warning,
            category: "correctness".to_string(),
            message: message.to_string(),
            suggestion: None,
        }
    }

    #[test]
    fn test_github_action_mapping() {
        assert_eq!(
            EventType::from_github_action("opened"),
            Some(EventType::PrOpened)
        );
        assert_eq!(
            EventType::from_github_action("synchronize"),
            Some(EventType::PrUpdated)
        );
        assert_eq!(
            EventType::from_github_action("reopened"),
            Some(EventType::PrReopened)
        );
        assert_eq!(
            EventType::from_github_action("closed"),
            Some(EventType::PrClosed)
        );
        assert_eq!(EventType::from_github_action("labeled"), None);
    }

    #[test]
    fn test_gitlab_action_mapping() {
        assert_eq!(
            EventType::from_gitlab_action("open"),
            Some(EventType::PrOpened)
        );
        assert_eq!(
            EventType::from_gitlab_action("update"),
            Some(EventType::PrUpdated)
        );
        assert_eq!(
            EventType::from_gitlab_action("merge"),
            Some(EventType::PrClosed)
        );
        assert_eq!(
            EventType::from_gitlab_action("close"),
            Some(EventType::PrClosed)
        );
        assert_eq!(EventType::from_gitlab_action("approved"), None);
    }

    #[test]
    fn test_dedup_identical_set_posts_nothing() {
        let prior = vec![comment("a.ts", 10, "unused variable"), comment("b.ts", 4, "shadowed name")];
        let new = prior.clone();
        assert!(dedup_against_prior(new, &prior).is_empty());
    }

    #[test]
    fn test_dedup_line_tolerance() {
        let prior = vec![comment("a.ts", 10, "unused variable")];

        // Within +-3 lines: duplicate.
        let near = vec![comment("a.ts", 12, "Unused Variable")];
        assert!(dedup_against_prior(near, &prior).is_empty());

        // Beyond the window: kept.
        let far = vec![comment("a.ts", 14, "unused variable")];
        assert_eq!(dedup_against_prior(far, &prior).len(), 1);
    }

    #[test]
    fn test_dedup_compares_first_80_chars_case_insensitive() {
        let long_a = format!("{}{}", "x".repeat(80), "tail one");
        let long_b = format!("{}{}", "X".repeat(80), "completely different tail");
        let prior = vec![comment("a.ts", 10, &long_a)];
        let new = vec![comment("a.ts", 10, &long_b)];
        assert!(dedup_against_prior(new, &prior).is_empty());
    }

    #[test]
    fn test_dedup_different_file_kept() {
        let prior = vec![comment("a.ts", 10, "unused variable")];
        let new = vec![comment("b.ts", 10, "unused variable")];
        assert_eq!(dedup_against_prior(new, &prior).len(), 1);
    }

    #[test]
    fn test_dedup_preserves_order_of_survivors() {
        let prior = vec![comment("a.ts", 10, "dup")];
        let new = vec![
            comment("c.ts", 1, "first"),
            comment("a.ts", 11, "dup"),
            comment("d.ts", 2, "second"),
        ];
        let out = dedup_against_prior(new, &prior);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].message, "first");
        assert_eq!(out[1].message, "second");
    }

    #[test]
    fn test_review_comment_round_trips_end_line() {
        let json = r#"{"file":"a.ts","line":3,"endLine":5,"severity":"critical","category":"bug","message":"m"}"#;
        let c: ReviewComment = serde_json::from_str(json).unwrap();
        assert_eq!(c.end_line, Some(5));
        let back = serde_json::to_value(&c).unwrap();
        assert_eq!(back["endLine"], 5);
    }
}
