//! One-shot repository analysis jobs.
//!
//! Clones the repository into a sandbox, runs the analysis prompt, and
//! stores the resulting profile. Whatever happens, the repository
//! advances to `interview` so the user is never stuck waiting on a
//! failed analysis; the interview just asks broader questions when no
//! profile exists.

use chrono::Utc;
use tracing::{info, warn};

use reviewd_core::prompt::ANALYSIS_SYSTEM_PROMPT;
use reviewd_core::RepoAnalysisPayload;

use crate::agent;
use crate::db::AnalysisData;
use crate::errors::{JobError, JobOutcome};
use crate::forge::ForgeAdapter;
use crate::sandbox::{Sandbox, REPO_DIR};
use crate::AppState;

pub async fn run(state: &AppState, payload: &RepoAnalysisPayload) -> Result<JobOutcome, JobError> {
    info!(
        "Analyzing {} ({}) for user {}",
        payload.repo_name, payload.provider, payload.user_id
    );

    let token = match state
        .tokens
        .get_valid(&payload.user_id, payload.provider)
        .await?
    {
        Some(token) => token,
        None => {
            warn!(
                "No valid {} token for {}; advancing {} to interview without a profile",
                payload.provider, payload.user_id, payload.slug
            );
            state
                .store
                .store_analysis(&payload.user_id, &payload.slug, None)
                .await?;
            return Ok(JobOutcome::Skipped("no valid provider token"));
        }
    };

    let settings = state.store.get_user_settings(&payload.user_id).await?;
    let api_key = settings.as_ref().and_then(|s| s.api_key.clone());
    let Some(api_key) = api_key else {
        warn!(
            "No agent API key for {}; advancing {} to interview without a profile",
            payload.user_id, payload.slug
        );
        state
            .store
            .store_analysis(&payload.user_id, &payload.slug, None)
            .await?;
        return Ok(JobOutcome::Skipped("no agent API key"));
    };

    let model = settings
        .as_ref()
        .map(|s| s.normalized_model(&state.config.default_model))
        .unwrap_or_else(|| state.config.default_model.clone());

    // A sandbox that will not even start degrades the same way as a
    // failed run inside it: the repo must still reach `interview`.
    let profile = match Sandbox::start(&state.config.sandbox_image).await {
        Ok(sandbox) => {
            let result =
                analyze_in_sandbox(state, payload, &token.access, &model, &api_key, &sandbox).await;
            sandbox.stop().await;
            result
        }
        Err(e) => Err(e),
    };

    let analysis = match profile {
        Ok(profile) => {
            info!(
                "Analysis of {} produced a {}-char profile",
                payload.repo_name,
                profile.len()
            );
            Some(AnalysisData {
                profile: Some(profile),
                provider: model.split('/').next().unwrap_or_default().to_string(),
                model: model.clone(),
                analyzed_at: Utc::now(),
            })
        }
        Err(e) => {
            warn!(
                "Analysis of {} failed ({}); advancing to interview without a profile",
                payload.repo_name, e
            );
            None
        }
    };

    state
        .store
        .store_analysis(&payload.user_id, &payload.slug, analysis)
        .await?;
    Ok(JobOutcome::Completed)
}

async fn analyze_in_sandbox(
    state: &AppState,
    payload: &RepoAnalysisPayload,
    token: &str,
    model: &str,
    api_key: &str,
    sandbox: &Sandbox,
) -> Result<String, JobError> {
    let clone_url = state
        .forge(payload.provider)
        .clone_url(&payload.repo_name, token);

    let clone = sandbox
        .exec_shell(&format!("git clone --depth 1 '{}' {}", clone_url, REPO_DIR))
        .await?;
    if !clone.success() {
        return Err(JobError::Sandbox(format!(
            "git clone failed: {}",
            clone.stderr.trim()
        )));
    }

    let profile = agent::run_analysis(sandbox, model, api_key, ANALYSIS_SYSTEM_PROMPT).await?;
    if profile.trim().is_empty() {
        return Err(JobError::AgentResponse("analysis produced no text".to_string()));
    }
    Ok(profile)
}
