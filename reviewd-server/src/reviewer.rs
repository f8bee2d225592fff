//! Review jobs: admission control, diff acquisition, the sandboxed
//! agent run, comment post-processing, posting, and persistence.

use chrono::{Duration as ChronoDuration, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use reviewd_core::envelope::{parse_agent_json, EnvelopeError};
use reviewd_core::prompt::{build_review_user_message, render_review_system, ReviewRequestHeader};
use reviewd_core::{dedup_against_prior, format_diff, ReviewComment, Severity, WebhookEvent};

use crate::db::{Plan, ReviewRecord, FREE_PLAN_MONTHLY_REVIEWS};
use crate::errors::{JobError, JobOutcome};
use crate::forge::ForgeAdapter;
use crate::sandbox::{Sandbox, REPO_DIR};
use crate::skills::render_custom;
use crate::{agent, AppState};

/// Diffs with no files or more than this many are skipped.
const MAX_DIFF_FILES: usize = 100;

/// Above this many surviving comments, pure suggestions are dropped.
const SUGGESTION_DROP_THRESHOLD: usize = 5;

/// Days after which the free-plan monthly counter resets.
const REVIEW_COUNT_RESET_DAYS: i64 = 30;

#[derive(Debug, Deserialize)]
struct AgentReview {
    comments: Vec<ReviewComment>,
}

pub async fn run(state: &AppState, event: &WebhookEvent) -> Result<JobOutcome, JobError> {
    info!(
        "Reviewing {}#{} for user {}",
        event.repo_name, event.pr_number, event.user_id
    );

    // Admission control, cheapest checks first.
    let Some(repo) = state.store.get_repo(&event.user_id, &event.repo_slug).await? else {
        return Ok(JobOutcome::Skipped("repository no longer connected"));
    };
    if repo.status != reviewd_core::RepoStatus::Active {
        return Ok(JobOutcome::Skipped("repository is not active"));
    }
    let persona = repo
        .persona
        .as_ref()
        .map(|p| p.persona.clone())
        .filter(|p| !p.trim().is_empty());
    if persona.is_none() {
        return Ok(JobOutcome::Skipped("repository has no persona yet"));
    }

    let subscription = state.store.get_subscription(&event.user_id).await?;
    let plan = subscription.as_ref().map(|s| s.plan).unwrap_or(Plan::Free);
    if plan == Plan::Free {
        let mut count = subscription
            .as_ref()
            .map(|s| s.review_count_month)
            .unwrap_or(0);
        let stale = subscription.as_ref().is_some_and(|s| {
            Utc::now() - s.review_count_reset_at > ChronoDuration::days(REVIEW_COUNT_RESET_DAYS)
        });
        if stale {
            state
                .store
                .reset_review_count(&event.user_id, Utc::now())
                .await?;
            count = 0;
        }
        if count >= FREE_PLAN_MONTHLY_REVIEWS {
            info!(
                "User {} hit the free-plan monthly limit, skipping review",
                event.user_id
            );
            return Ok(JobOutcome::Skipped("monthly review limit reached"));
        }
    }

    // Not an admission skip: the token is invalid even after a
    // refresh attempt, so the job is consumed without retry and the
    // failure is surfaced as an authorization problem.
    let Some(token) = state.tokens.get_valid(&event.user_id, event.provider).await? else {
        return Err(JobError::Unauthorized(format!(
            "no valid {} token for {}",
            event.provider, event.user_id
        )));
    };

    let Some(settings) = state.store.get_user_settings(&event.user_id).await? else {
        return Ok(JobOutcome::Skipped("user has no settings"));
    };
    let Some(api_key) = settings.api_key.clone() else {
        return Ok(JobOutcome::Skipped("no agent API key"));
    };
    let model = settings.normalized_model(&state.config.default_model);

    // Diff acquisition.
    let forge = state.forge(event.provider);
    let (metadata, files) = forge
        .fetch_diff(&event.repo_name, event.pr_number, &token.access)
        .await?;
    if metadata.draft {
        return Ok(JobOutcome::Skipped("draft pull request"));
    }
    if files.is_empty() || files.len() > MAX_DIFF_FILES {
        info!(
            "Diff of {}#{} has {} files, skipping",
            event.repo_name,
            event.pr_number,
            files.len()
        );
        return Ok(JobOutcome::Skipped("diff empty or too large"));
    }
    let diff = format_diff(&files);

    // Prior comments feed dedup.
    let prior: Vec<ReviewComment> = state
        .store
        .prior_reviews(&event.user_id, &event.repo_slug, event.pr_number)
        .await?
        .into_iter()
        .flat_map(|r| r.comments)
        .collect();

    let system_prompt = render_review_system(
        persona.as_deref(),
        repo.analysis.as_ref().and_then(|a| a.profile.as_deref()),
        &state.skills.render_predefined(),
        &render_custom(&repo.custom_skills),
    );
    let header = ReviewRequestHeader {
        title: &metadata.title,
        description: &metadata.description,
        author: &metadata.author,
        target_branch: &metadata.base_branch,
        file_count: files.len(),
    };
    let user_message = build_review_user_message(&header, &prior, &diff);

    // Agent run in a scoped sandbox.
    let sandbox = Sandbox::start(&state.config.sandbox_image).await?;
    let response = review_in_sandbox(
        state,
        event,
        &token.access,
        &model,
        &api_key,
        &system_prompt,
        &user_message,
        &sandbox,
    )
    .await;
    sandbox.stop().await;
    let response = response?;

    let review: AgentReview = parse_agent_json(&response).map_err(|e| match e {
        EnvelopeError::Malformed(msg) | EnvelopeError::InvalidShape(msg) => {
            JobError::AgentResponse(msg)
        }
    })?;

    // Post-processing: cap, drop suggestions when noisy, dedup.
    let mut comments = review.comments;
    let produced = comments.len();
    comments.truncate(settings.max_comments.max(1) as usize);
    if comments.len() > SUGGESTION_DROP_THRESHOLD {
        comments.retain(|c| c.severity != Severity::Suggestion);
    }
    let comments = dedup_against_prior(comments, &prior);
    info!(
        "Agent produced {} comments, {} survive post-processing",
        produced,
        comments.len()
    );

    // Posting, as the bot identity when one is configured.
    let posting_token = forge
        .posting_token(&event.repo_name, &token.access)
        .await;
    let posted = forge
        .post_review(
            &event.repo_name,
            event.pr_number,
            &posting_token,
            &comments,
            &metadata,
        )
        .await?;
    if posted < comments.len() {
        warn!(
            "Forge accepted {}/{} comments on {}#{}",
            posted,
            comments.len(),
            event.repo_name,
            event.pr_number
        );
    }

    // The stored record describes what the agent produced after
    // post-processing, not what the forge accepted.
    let record = ReviewRecord {
        id: 0,
        user_id: event.user_id.clone(),
        repo_slug: event.repo_slug.clone(),
        pr_number: event.pr_number,
        pr_title: event.pr_title.clone(),
        pr_url: event.pr_url.clone(),
        pr_author: event.pr_author.clone(),
        verdict: "comment".to_string(),
        summary: summarize(&comments),
        comment_count: comments.len() as u32,
        comments,
        llm_provider: model.split('/').next().unwrap_or_default().to_string(),
        llm_model: model,
        created_at: Utc::now(),
    };
    state.store.insert_review(record).await?;

    if plan == Plan::Free {
        state.store.increment_review_count(&event.user_id).await?;
    }

    Ok(JobOutcome::Completed)
}

#[allow(clippy::too_many_arguments)]
async fn review_in_sandbox(
    state: &AppState,
    event: &WebhookEvent,
    token: &str,
    model: &str,
    api_key: &str,
    system_prompt: &str,
    user_message: &str,
    sandbox: &Sandbox,
) -> Result<String, JobError> {
    let forge = state.forge(event.provider);
    let clone_url = forge.clone_url(&event.repo_name, token);

    let clone = sandbox
        .exec_shell(&format!("git clone --depth 50 '{}' {}", clone_url, REPO_DIR))
        .await?;
    if !clone.success() {
        return Err(JobError::Sandbox(format!(
            "git clone failed: {}",
            clone.stderr.trim()
        )));
    }

    // Check out the PR head so the agent reads the changed code. A
    // failed checkout is not fatal: the agent still has the diff and
    // reviews against the default branch.
    let (refspec, branch) = forge.review_ref(event.pr_number);
    let checkout = sandbox
        .exec_shell(&format!(
            "cd {} && git fetch origin '{}' && git checkout {}",
            REPO_DIR, refspec, branch
        ))
        .await?;
    if !checkout.success() {
        warn!(
            "Could not check out {} for {}#{}: {}",
            branch,
            event.repo_name,
            event.pr_number,
            checkout.stderr.trim()
        );
    }

    agent::run_review(sandbox, model, api_key, system_prompt, user_message).await
}

fn summarize(comments: &[ReviewComment]) -> String {
    if comments.is_empty() {
        return "No issues to flag".to_string();
    }
    let critical = comments
        .iter()
        .filter(|c| c.severity == Severity::Critical)
        .count();
    let warning = comments
        .iter()
        .filter(|c| c.severity == Severity::Warning)
        .count();
    let suggestion = comments.len() - critical - warning;
    let mut parts = Vec::new();
    if critical > 0 {
        parts.push(format!("{} critical", critical));
    }
    if warning > 0 {
        parts.push(format!("{} warning", warning));
    }
    if suggestion > 0 {
        parts.push(format!("{} suggestion", suggestion));
    }
    format!("{} comments ({})", comments.len(), parts.join(", "))
}
