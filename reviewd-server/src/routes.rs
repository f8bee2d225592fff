//! Operator-facing HTTP API: repository connect/disconnect, pause
//! toggling, custom skills, the interview, and review history. The
//! dashboard that drives these lives elsewhere; this is its data
//! plane.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post, put};
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use reviewd_core::{InterviewAnswer, Provider, RepoAnalysisPayload, RepoStatus};

use crate::db::ConnectedRepo;
use crate::forge::gitlab::generate_webhook_secret;
use crate::interview;
use crate::queue::QUEUE_REPO_ANALYSIS;
use crate::AppState;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({"error": message})))
}

fn internal_error(e: anyhow::Error) -> (StatusCode, Json<Value>) {
    error!("{:#}", e);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal error"})),
    )
}

pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .route("/repos", post(connect_repo))
        .route(
            "/repos/{user_id}/{slug}",
            axum::routing::delete(disconnect_repo),
        )
        .route("/repos/{user_id}/{slug}/status", post(set_status))
        .route("/repos/{user_id}/{slug}/skills", put(set_skills))
        .route("/repos/{user_id}/{slug}/interview", post(interview_step))
        .route("/users/{user_id}/reviews", get(list_reviews))
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "reviewd",
        "version": reviewd_core::version(),
    }))
}

#[derive(Debug, Deserialize)]
struct ConnectRequest {
    user_id: String,
    /// Forge identity in `owner/name` form.
    name: String,
    provider: String,
}

fn repo_json(repo: &ConnectedRepo) -> Value {
    json!({
        "user_id": repo.user_id,
        "slug": repo.slug,
        "name": repo.name,
        "provider": repo.provider.as_str(),
        "status": repo.status.as_str(),
        "connected_at": repo.connected_at.to_rfc3339(),
        "has_webhook": repo.webhook_hook_id.is_some(),
    })
}

/// Connect a repository: create the row (`analyzing`), set up the
/// GitLab hook when applicable, and enqueue the analysis job. Shared
/// by the HTTP handler and the operator CLI.
pub async fn connect_repository(
    state: &AppState,
    user_id: &str,
    name: &str,
    provider: Provider,
) -> anyhow::Result<ConnectedRepo> {
    if !name.contains('/') {
        anyhow::bail!("name must be in owner/name form");
    }
    let slug = name.replace('/', "-");

    if state.store.get_repo(user_id, &slug).await?.is_some() {
        anyhow::bail!("repository is already connected");
    }

    let mut repo = ConnectedRepo {
        user_id: user_id.to_string(),
        slug: slug.clone(),
        name: name.to_string(),
        provider,
        status: RepoStatus::Analyzing,
        connected_at: Utc::now(),
        analysis: None,
        persona: None,
        custom_skills: vec![],
        webhook_hook_id: None,
        webhook_secret: None,
    };

    // GitHub events arrive through the app-level webhook; GitLab needs
    // a per-repo hook carrying its own token.
    if provider == Provider::GitLab {
        match state.tokens.get_valid(user_id, provider).await? {
            Some(token) => {
                let secret = generate_webhook_secret();
                match state
                    .gitlab
                    .create_webhook(name, &token.access, &secret, &state.config.webhook_base_url)
                    .await
                {
                    Ok(hook_id) => {
                        repo.webhook_hook_id = Some(hook_id);
                        repo.webhook_secret = Some(secret);
                    }
                    Err(e) => {
                        warn!("Webhook creation for {} failed: {:#}", name, e);
                    }
                }
                if let Err(e) = state.gitlab.invite_bot(name, &token.access).await {
                    warn!("Bot invitation for {} failed: {:#}", name, e);
                }
            }
            None => {
                warn!(
                    "No valid GitLab token for {}; connecting {} without a webhook",
                    user_id, name
                );
            }
        }
    }

    state.store.create_repo(repo.clone()).await?;

    let payload = RepoAnalysisPayload {
        user_id: user_id.to_string(),
        slug,
        repo_name: name.to_string(),
        provider,
    };
    state.queue.enqueue(QUEUE_REPO_ANALYSIS, &payload).await?;

    info!("Connected {} and enqueued analysis", repo.name);
    Ok(repo)
}

async fn connect_repo(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ConnectRequest>,
) -> ApiResult {
    let Some(provider) = Provider::parse(&request.provider) else {
        return Err(bad_request("provider must be \"github\" or \"gitlab\""));
    };
    let repo = connect_repository(&state, &request.user_id, &request.name, provider)
        .await
        .map_err(|e| bad_request(&format!("{:#}", e)))?;
    Ok(Json(repo_json(&repo)))
}

/// Disconnect: best-effort delete the forge hook, then cascade.
async fn disconnect_repo(
    State(state): State<Arc<AppState>>,
    Path((user_id, slug)): Path<(String, String)>,
) -> ApiResult {
    let Some(repo) = state
        .store
        .get_repo(&user_id, &slug)
        .await
        .map_err(internal_error)?
    else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "repository not found"})),
        ));
    };

    if let (Provider::GitLab, Some(hook_id)) = (repo.provider, repo.webhook_hook_id) {
        match state.tokens.get_valid(&user_id, Provider::GitLab).await {
            Ok(Some(token)) => {
                if let Err(e) = state
                    .gitlab
                    .delete_webhook(&repo.name, hook_id, &token.access)
                    .await
                {
                    warn!("Webhook deletion for {} failed: {:#}", repo.name, e);
                }
            }
            Ok(None) => warn!(
                "No valid GitLab token for {}; leaving hook {} on {}",
                user_id, hook_id, repo.name
            ),
            Err(e) => warn!("Token lookup during disconnect failed: {:#}", e),
        }
    }

    state
        .store
        .delete_repo(&user_id, &slug)
        .await
        .map_err(internal_error)?;
    Ok(Json(json!({"deleted": true})))
}

#[derive(Debug, Deserialize)]
struct StatusRequest {
    paused: bool,
}

async fn set_status(
    State(state): State<Arc<AppState>>,
    Path((user_id, slug)): Path<(String, String)>,
    Json(request): Json<StatusRequest>,
) -> ApiResult {
    state
        .store
        .set_repo_paused(&user_id, &slug, request.paused)
        .await
        .map_err(|e| bad_request(&format!("{:#}", e)))?;
    let status = if request.paused { "paused" } else { "active" };
    Ok(Json(json!({"status": status})))
}

#[derive(Debug, Deserialize)]
struct SkillsRequest {
    skills: Vec<String>,
}

async fn set_skills(
    State(state): State<Arc<AppState>>,
    Path((user_id, slug)): Path<(String, String)>,
    Json(request): Json<SkillsRequest>,
) -> ApiResult {
    state
        .store
        .update_custom_skills(&user_id, &slug, request.skills)
        .await
        .map_err(|e| bad_request(&format!("{:#}", e)))?;
    Ok(Json(json!({"updated": true})))
}

#[derive(Debug, Deserialize)]
struct InterviewRequest {
    #[serde(default)]
    answers: Vec<InterviewAnswer>,
}

async fn interview_step(
    State(state): State<Arc<AppState>>,
    Path((user_id, slug)): Path<(String, String)>,
    Json(request): Json<InterviewRequest>,
) -> ApiResult {
    let step = interview::step(&state, &user_id, &slug, &request.answers)
        .await
        .map_err(internal_error)?;
    Ok(Json(serde_json::to_value(step).map_err(|e| internal_error(e.into()))?))
}

async fn list_reviews(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult {
    let reviews = state
        .store
        .list_reviews(&user_id, 100)
        .await
        .map_err(internal_error)?;
    let reviews: Vec<Value> = reviews
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "repo_slug": r.repo_slug,
                "pr_number": r.pr_number,
                "pr_title": r.pr_title,
                "pr_url": r.pr_url,
                "verdict": r.verdict,
                "summary": r.summary,
                "comment_count": r.comment_count,
                "llm_model": r.llm_model,
                "created_at": r.created_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(Json(json!({"reviews": reviews})))
}
