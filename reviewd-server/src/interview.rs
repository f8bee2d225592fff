//! The persona interview step.
//!
//! Stateless over `(analysis profile, answers so far)`: each call is
//! one model invocation that yields the next question or the finished
//! persona. Completion persists the persona and activates the
//! repository.

use anyhow::{anyhow, Result};
use tracing::{info, warn};

use reviewd_core::envelope::parse_agent_json;
use reviewd_core::prompt::{build_interview_user_message, INTERVIEW_SYSTEM_PROMPT};
use reviewd_core::{InterviewAnswer, InterviewStep, RepoStatus};

use crate::agent::run_host_agent;
use crate::db::PersonaData;
use crate::AppState;

/// Run one interview step for a repository. On a `complete` response
/// the persona is stored and the repository becomes `active`.
pub async fn step(
    state: &AppState,
    user_id: &str,
    slug: &str,
    answers: &[InterviewAnswer],
) -> Result<InterviewStep> {
    let repo = state
        .store
        .get_repo(user_id, slug)
        .await?
        .ok_or_else(|| anyhow!("repository {} is not connected", slug))?;
    if repo.status != RepoStatus::Interview {
        return Err(anyhow!(
            "repository {} is {}, not awaiting its interview",
            slug,
            repo.status.as_str()
        ));
    }

    let settings = state
        .store
        .get_user_settings(user_id)
        .await?
        .ok_or_else(|| anyhow!("user {} has no settings", user_id))?;
    let api_key = settings
        .api_key
        .clone()
        .ok_or_else(|| anyhow!("user {} has no agent API key", user_id))?;
    let model = settings.normalized_model(&state.config.default_model);

    let profile = repo.analysis.as_ref().and_then(|a| a.profile.as_deref());
    let user_message = build_interview_user_message(profile, answers);

    let text = run_host_agent(&model, &api_key, INTERVIEW_SYSTEM_PROMPT, &user_message)
        .await
        .map_err(|e| anyhow!("interview agent run failed: {}", e))?;

    let step: InterviewStep =
        parse_agent_json(&text).map_err(|e| anyhow!("interview response unusable: {}", e))?;
    step.validate().map_err(|reason| {
        warn!("Interview step failed validation: {}", reason);
        anyhow!("interview response invalid: {}", reason)
    })?;

    if let InterviewStep::Complete { persona } = &step {
        state
            .store
            .store_persona(
                user_id,
                slug,
                PersonaData {
                    persona: persona.clone(),
                    edited: false,
                },
            )
            .await?;
        info!("Interview for {} complete; repository is now active", slug);
    }

    Ok(step)
}
