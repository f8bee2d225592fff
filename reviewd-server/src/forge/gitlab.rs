//! GitLab adapter: merge-request webhooks, the `/changes` diff
//! endpoint, per-discussion comment posting, and per-repo hook
//! management.
//!
//! Webhook authentication is a per-repo shared token generated at hook
//! creation and stored on the repository row; there is no body
//! signature. Posting may use a bot PAT (detected by its `glpat-`
//! prefix and sent via the PRIVATE-TOKEN header) instead of the user's
//! OAuth bearer token.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use rand::RngCore;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use reviewd_core::{
    format_comment_body, EventType, FileChange, FileStatus, Provider, ReviewComment,
};

use super::{constant_time_eq, DiffRefs, ForgeAdapter, ParsedEvent, PrMetadata};

const API_BASE: &str = "https://gitlab.com/api/v4";

/// Developer access, enough for the bot to comment on merge requests.
pub const BOT_ACCESS_LEVEL: u8 = 30;

#[derive(Clone)]
pub struct GitLabForge {
    client: Client,
    /// Bot PAT used for posting when configured.
    bot_token: Option<String>,
    /// Bot account id to invite into connected projects.
    pub bot_user_id: Option<u64>,
}

// ---- webhook payload ----

#[derive(Debug, Deserialize)]
struct MergeRequestEventPayload {
    object_kind: Option<String>,
    user: Option<UserPayload>,
    project: Option<ProjectPayload>,
    object_attributes: Option<AttributesPayload>,
}

#[derive(Debug, Deserialize)]
struct UserPayload {
    username: String,
}

#[derive(Debug, Deserialize)]
struct ProjectPayload {
    path_with_namespace: String,
}

#[derive(Debug, Deserialize)]
struct AttributesPayload {
    action: Option<String>,
    iid: u64,
    title: Option<String>,
    url: Option<String>,
    source_branch: Option<String>,
    target_branch: Option<String>,
}

// ---- REST shapes ----

#[derive(Debug, Deserialize)]
struct ChangesResponse {
    title: Option<String>,
    description: Option<String>,
    author: Option<UserPayload>,
    target_branch: String,
    source_branch: String,
    #[serde(default)]
    draft: bool,
    diff_refs: Option<DiffRefsResponse>,
    #[serde(default)]
    changes: Vec<ChangePayload>,
}

#[derive(Debug, Deserialize)]
struct DiffRefsResponse {
    base_sha: String,
    start_sha: String,
    head_sha: String,
}

#[derive(Debug, Deserialize)]
struct ChangePayload {
    old_path: String,
    new_path: String,
    #[serde(default)]
    diff: String,
    #[serde(default)]
    new_file: bool,
    #[serde(default)]
    renamed_file: bool,
    #[serde(default)]
    deleted_file: bool,
}

#[derive(Debug, Serialize)]
struct DiscussionRequest {
    body: String,
    position: DiscussionPosition,
}

#[derive(Debug, Serialize)]
struct DiscussionPosition {
    position_type: &'static str,
    base_sha: String,
    start_sha: String,
    head_sha: String,
    old_path: String,
    new_path: String,
    new_line: u64,
}

#[derive(Debug, Serialize)]
struct CreateHookRequest<'a> {
    url: &'a str,
    merge_requests_events: bool,
    note_events: bool,
    push_events: bool,
    enable_ssl_verification: bool,
    token: &'a str,
}

#[derive(Debug, Deserialize)]
struct HookResponse {
    id: u64,
}

#[derive(Debug, Serialize)]
struct InviteMemberRequest {
    user_id: u64,
    access_level: u8,
}

/// Percent-encode a `group/project` path for use as a project id.
pub fn encode_project_path(path: &str) -> String {
    path.replace('/', "%2F")
}

/// Generate a fresh 256-bit webhook token as hex.
pub fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn change_status(change: &ChangePayload) -> FileStatus {
    if change.new_file {
        FileStatus::Added
    } else if change.deleted_file {
        FileStatus::Removed
    } else if change.renamed_file {
        FileStatus::Renamed
    } else {
        FileStatus::Modified
    }
}

/// Count added/removed lines in a hunk body, skipping `+++`/`---`
/// header lines.
fn count_changes(diff: &str) -> (u64, u64) {
    let mut additions = 0;
    let mut deletions = 0;
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            additions += 1;
        } else if line.starts_with('-') {
            deletions += 1;
        }
    }
    (additions, deletions)
}

impl GitLabForge {
    pub fn new(bot_token: Option<String>, bot_user_id: Option<u64>) -> Self {
        let client = Client::builder()
            .user_agent(format!("reviewd/{}", reviewd_core::version()))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            bot_token,
            bot_user_id,
        }
    }

    /// PATs (`glpat-` prefix) go in the PRIVATE-TOKEN header; OAuth
    /// tokens are sent as a bearer.
    fn authed(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        if token.starts_with("glpat-") {
            builder.header("PRIVATE-TOKEN", token)
        } else {
            builder.bearer_auth(token)
        }
    }

    /// Create a merge-request hook on a project. Returns the hook id.
    pub async fn create_webhook(
        &self,
        project_path: &str,
        token: &str,
        secret: &str,
        webhook_url: &str,
    ) -> Result<u64> {
        let url = format!("{}/projects/{}/hooks", API_BASE, encode_project_path(project_path));
        let request = CreateHookRequest {
            url: webhook_url,
            merge_requests_events: true,
            note_events: true,
            push_events: false,
            enable_ssl_verification: true,
            token: secret,
        };

        let response = self
            .authed(self.client.post(&url), token)
            .json(&request)
            .send()
            .await
            .context("Failed to send hook creation request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("GitLab hook creation failed: {} - {}", status, error_text);
            return Err(anyhow!(
                "GitLab hook creation failed: {} - {}",
                status,
                error_text
            ));
        }

        let hook: HookResponse = response
            .json()
            .await
            .context("Failed to parse hook response")?;
        info!("Created GitLab hook {} on {}", hook.id, project_path);
        Ok(hook.id)
    }

    /// Delete a project hook. A missing hook counts as success.
    pub async fn delete_webhook(&self, project_path: &str, hook_id: u64, token: &str) -> Result<()> {
        let url = format!(
            "{}/projects/{}/hooks/{}",
            API_BASE,
            encode_project_path(project_path),
            hook_id
        );

        let response = self
            .authed(self.client.delete(&url), token)
            .send()
            .await
            .context("Failed to send hook deletion request")?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(()),
            status => {
                let error_text = response.text().await.unwrap_or_default();
                Err(anyhow!(
                    "GitLab hook deletion failed: {} - {}",
                    status,
                    error_text
                ))
            }
        }
    }

    /// Invite the bot account into a project so it can post
    /// discussions. Already-a-member (409) counts as success.
    pub async fn invite_bot(&self, project_path: &str, user_token: &str) -> Result<()> {
        let Some(bot_user_id) = self.bot_user_id else {
            return Ok(());
        };
        let url = format!(
            "{}/projects/{}/members",
            API_BASE,
            encode_project_path(project_path)
        );
        let request = InviteMemberRequest {
            user_id: bot_user_id,
            access_level: BOT_ACCESS_LEVEL,
        };

        let response = self
            .authed(self.client.post(&url), user_token)
            .json(&request)
            .send()
            .await
            .context("Failed to send member invitation")?;

        match response.status() {
            status if status.is_success() => {
                info!("Invited bot user {} into {}", bot_user_id, project_path);
                Ok(())
            }
            StatusCode::CONFLICT => Ok(()),
            status => {
                let error_text = response.text().await.unwrap_or_default();
                Err(anyhow!(
                    "GitLab member invitation failed: {} - {}",
                    status,
                    error_text
                ))
            }
        }
    }
}

#[async_trait]
impl ForgeAdapter for GitLabForge {
    fn provider(&self) -> Provider {
        Provider::GitLab
    }

    /// The `X-Gitlab-Token` header must equal the per-repo secret.
    fn verify_webhook(&self, _raw_body: &[u8], signature: &str, secret: &str) -> bool {
        constant_time_eq(signature.as_bytes(), secret.as_bytes())
    }

    fn parse_event(&self, raw_body: &[u8]) -> Option<ParsedEvent> {
        let payload: MergeRequestEventPayload = serde_json::from_slice(raw_body).ok()?;
        if payload.object_kind.as_deref() != Some("merge_request") {
            return None;
        }
        let attributes = payload.object_attributes?;
        let action = attributes.action?;
        let event_type = EventType::from_gitlab_action(&action)?;
        let project = payload.project?;

        Some(ParsedEvent {
            event_type,
            raw_action: action,
            repo_name: project.path_with_namespace,
            pr_number: attributes.iid,
            pr_title: attributes.title.unwrap_or_default(),
            pr_url: attributes.url.unwrap_or_default(),
            pr_author: payload.user.map(|u| u.username).unwrap_or_default(),
            base_branch: attributes.target_branch.unwrap_or_default(),
            head_branch: attributes.source_branch.unwrap_or_default(),
        })
    }

    async fn fetch_diff(
        &self,
        repo_name: &str,
        pr_number: u64,
        token: &str,
    ) -> Result<(PrMetadata, Vec<FileChange>)> {
        let url = format!(
            "{}/projects/{}/merge_requests/{}/changes",
            API_BASE,
            encode_project_path(repo_name),
            pr_number
        );

        let response = self
            .authed(self.client.get(&url), token)
            .send()
            .await
            .context("Failed to send changes request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("GitLab changes fetch failed: {} - {}", status, error_text);
            return Err(anyhow!(
                "GitLab changes fetch failed: {} - {}",
                status,
                error_text
            ));
        }

        let changes: ChangesResponse = response
            .json()
            .await
            .context("Failed to parse changes response")?;

        let files = changes
            .changes
            .iter()
            .map(|c| {
                let (additions, deletions) = count_changes(&c.diff);
                FileChange {
                    path: if c.deleted_file {
                        c.old_path.clone()
                    } else {
                        c.new_path.clone()
                    },
                    status: change_status(c),
                    additions,
                    deletions,
                    patch: if c.diff.is_empty() {
                        None
                    } else {
                        Some(c.diff.clone())
                    },
                }
            })
            .collect::<Vec<_>>();

        let metadata = PrMetadata {
            title: changes.title.unwrap_or_default(),
            description: changes.description.unwrap_or_default(),
            author: changes.author.map(|a| a.username).unwrap_or_default(),
            base_branch: changes.target_branch,
            head_branch: changes.source_branch,
            head_sha: changes.diff_refs.as_ref().map(|r| r.head_sha.clone()),
            draft: changes.draft,
            diff_refs: changes.diff_refs.map(|r| DiffRefs {
                base_sha: r.base_sha,
                start_sha: r.start_sha,
                head_sha: r.head_sha,
            }),
        };

        info!(
            "Fetched MR {}!{}: {} files changed",
            repo_name,
            pr_number,
            files.len()
        );
        Ok((metadata, files))
    }

    /// Post each comment as its own positioned discussion. Individual
    /// failures are logged and skipped.
    async fn post_review(
        &self,
        repo_name: &str,
        pr_number: u64,
        token: &str,
        comments: &[ReviewComment],
        meta: &PrMetadata,
    ) -> Result<usize> {
        if comments.is_empty() {
            return Ok(0);
        }
        let Some(diff_refs) = &meta.diff_refs else {
            return Err(anyhow!(
                "cannot post GitLab discussions without diff refs for {}!{}",
                repo_name,
                pr_number
            ));
        };

        let url = format!(
            "{}/projects/{}/merge_requests/{}/discussions",
            API_BASE,
            encode_project_path(repo_name),
            pr_number
        );

        let mut posted = 0;
        for comment in comments {
            let request = DiscussionRequest {
                body: format_comment_body(&comment.message, comment.suggestion.as_deref()),
                position: DiscussionPosition {
                    position_type: "text",
                    base_sha: diff_refs.base_sha.clone(),
                    start_sha: diff_refs.start_sha.clone(),
                    head_sha: diff_refs.head_sha.clone(),
                    old_path: comment.file.clone(),
                    new_path: comment.file.clone(),
                    new_line: comment.line,
                },
            };

            let result = self
                .authed(self.client.post(&url), token)
                .json(&request)
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_success() => posted += 1,
                Ok(response) => {
                    let status = response.status();
                    let error_text = response.text().await.unwrap_or_default();
                    warn!(
                        "Skipping discussion on {}:{} ({} - {})",
                        comment.file, comment.line, status, error_text
                    );
                }
                Err(e) => {
                    warn!(
                        "Skipping discussion on {}:{} (request failed: {})",
                        comment.file, comment.line, e
                    );
                }
            }
        }

        info!(
            "Posted {}/{} discussions on {}!{}",
            posted,
            comments.len(),
            repo_name,
            pr_number
        );
        Ok(posted)
    }

    async fn posting_token(&self, _repo_name: &str, user_token: &str) -> String {
        self.bot_token
            .clone()
            .unwrap_or_else(|| user_token.to_string())
    }

    fn clone_url(&self, repo_name: &str, token: &str) -> String {
        format!("https://oauth2:{}@gitlab.com/{}.git", token, repo_name)
    }

    fn review_ref(&self, pr_number: u64) -> (String, String) {
        (
            format!("merge-requests/{}/head:mr-review", pr_number),
            "mr-review".to_string(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forge() -> GitLabForge {
        GitLabForge::new(None, None)
    }

    #[test]
    fn test_verify_webhook_token_equality() {
        let forge = forge();
        assert!(forge.verify_webhook(b"ignored", "tok", "tok"));
        assert!(!forge.verify_webhook(b"ignored", "tok", "other"));
        assert!(!forge.verify_webhook(b"ignored", "tok", "tok2"));
    }

    #[test]
    fn test_parse_event_update() {
        let forge = forge();
        let body = serde_json::json!({
            "object_kind": "merge_request",
            "user": {"username": "dev"},
            "project": {"path_with_namespace": "acme/api"},
            "object_attributes": {
                "action": "update",
                "iid": 7,
                "title": "Refactor pipeline",
                "url": "https://gitlab.com/acme/api/-/merge_requests/7",
                "source_branch": "refactor",
                "target_branch": "main"
            }
        });
        let event = forge
            .parse_event(serde_json::to_vec(&body).unwrap().as_slice())
            .unwrap();
        assert_eq!(event.event_type, EventType::PrUpdated);
        assert_eq!(event.repo_name, "acme/api");
        assert_eq!(event.pr_number, 7);
        assert_eq!(event.head_branch, "refactor");
    }

    #[test]
    fn test_parse_event_rejects_other_object_kinds() {
        let forge = forge();
        let body = serde_json::json!({
            "object_kind": "push",
            "project": {"path_with_namespace": "acme/api"}
        });
        assert!(forge
            .parse_event(serde_json::to_vec(&body).unwrap().as_slice())
            .is_none());
    }

    #[test]
    fn test_parse_event_unmapped_action() {
        let forge = forge();
        let body = serde_json::json!({
            "object_kind": "merge_request",
            "project": {"path_with_namespace": "acme/api"},
            "object_attributes": {"action": "approved", "iid": 7}
        });
        assert!(forge
            .parse_event(serde_json::to_vec(&body).unwrap().as_slice())
            .is_none());
    }

    #[test]
    fn test_encode_project_path() {
        assert_eq!(encode_project_path("acme/api"), "acme%2Fapi");
        assert_eq!(encode_project_path("group/sub/api"), "group%2Fsub%2Fapi");
    }

    #[test]
    fn test_generate_webhook_secret_is_256_bit_hex() {
        let secret = generate_webhook_secret();
        assert_eq!(secret.len(), 64);
        assert!(secret.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(secret, generate_webhook_secret());
    }

    #[test]
    fn test_change_status_mapping() {
        let mut change = ChangePayload {
            old_path: "a".to_string(),
            new_path: "a".to_string(),
            diff: String::new(),
            new_file: false,
            renamed_file: false,
            deleted_file: false,
        };
        assert_eq!(change_status(&change), FileStatus::Modified);
        change.new_file = true;
        assert_eq!(change_status(&change), FileStatus::Added);
        change.new_file = false;
        change.deleted_file = true;
        assert_eq!(change_status(&change), FileStatus::Removed);
        change.deleted_file = false;
        change.renamed_file = true;
        assert_eq!(change_status(&change), FileStatus::Renamed);
    }

    #[test]
    fn test_count_changes_skips_file_headers() {
        let diff = "--- a/x.rs\n+++ b/x.rs\n@@ -1,2 +1,3 @@\n context\n+added one\n+added two\n-removed";
        assert_eq!(count_changes(diff), (2, 1));
    }

    #[test]
    fn test_pat_goes_in_private_token_header() {
        let forge = forge();
        let request = forge
            .authed(forge.client.get("https://gitlab.com"), "glpat-abc123")
            .build()
            .unwrap();
        assert_eq!(
            request.headers().get("PRIVATE-TOKEN").unwrap(),
            "glpat-abc123"
        );
        assert!(request.headers().get("Authorization").is_none());

        let request = forge
            .authed(forge.client.get("https://gitlab.com"), "oauth-token")
            .build()
            .unwrap();
        assert!(request.headers().get("PRIVATE-TOKEN").is_none());
        assert!(request
            .headers()
            .get("Authorization")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("Bearer "));
    }
}
