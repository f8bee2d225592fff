//! Webhook ingress.
//!
//! One POST endpoint for both forges, routed by header. Requests are
//! verified, normalized, fanned out to every connected repository row
//! for the forge repo, and enqueued; processing happens later on the
//! worker loop. Response codes tell the forge what to do: 2xx are
//! final (including skips and empty matches), 401 means the signature
//! or token failed, and 500 asks for a retry because we could not
//! enqueue.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};

use reviewd_core::{Provider, RepoStatus, WebhookEvent};

use crate::forge::{ForgeAdapter, ParsedEvent};
use crate::queue::QUEUE_WEBHOOK_EVENTS;
use crate::AppState;

pub fn webhook_router() -> Router<Arc<AppState>> {
    Router::new().route("/webhooks", post(webhook_handler))
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn skipped() -> Response {
    (StatusCode::OK, Json(json!({"skipped": true}))).into_response()
}

pub async fn webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if header(&headers, "x-github-event").is_some() {
        handle_github(&state, &headers, &body).await
    } else if header(&headers, "x-gitlab-event").is_some() {
        handle_gitlab(&state, &headers, &body).await
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "unrecognized webhook source"})),
        )
            .into_response()
    }
}

async fn handle_github(state: &Arc<AppState>, headers: &HeaderMap, body: &Bytes) -> Response {
    // Only pull_request events are interesting; everything else is
    // acknowledged so GitHub does not retry.
    if header(headers, "x-github-event") != Some("pull_request") {
        return skipped();
    }

    let Some(signature) = header(headers, "x-hub-signature-256") else {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "missing signature"})))
            .into_response();
    };
    if !state
        .github
        .verify_webhook(body, signature, &state.config.github_webhook_secret)
    {
        error!("Invalid GitHub webhook signature");
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid signature"})))
            .into_response();
    }

    if serde_json::from_slice::<serde_json::Value>(body).is_err() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "malformed body"})))
            .into_response();
    }
    let Some(event) = state.github.parse_event(body) else {
        return skipped();
    };

    let rows = match state.store.repos_for_name(Provider::GitHub, &event.repo_name).await {
        Ok(rows) => rows,
        Err(e) => {
            error!("Repository lookup failed: {:#}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "lookup failed"})))
                .into_response();
        }
    };

    enqueue_for_rows(state, Provider::GitHub, &event, rows).await
}

async fn handle_gitlab(state: &Arc<AppState>, headers: &HeaderMap, body: &Bytes) -> Response {
    if header(headers, "x-gitlab-event") != Some("Merge Request Hook") {
        return skipped();
    }

    // GitLab's token is header-only; the body is parsed first because
    // the project path selects which per-repo secrets to check.
    if serde_json::from_slice::<serde_json::Value>(body).is_err() {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "malformed body"})))
            .into_response();
    }
    let Some(event) = state.gitlab.parse_event(body) else {
        return skipped();
    };

    let Some(token) = header(headers, "x-gitlab-token") else {
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "missing token"})))
            .into_response();
    };

    let rows = match state.store.repos_for_name(Provider::GitLab, &event.repo_name).await {
        Ok(rows) => rows,
        Err(e) => {
            error!("Repository lookup failed: {:#}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "lookup failed"})))
                .into_response();
        }
    };

    // Accept when the token matches any row's stored secret; rows
    // without a secret are skipped, not matched.
    let accepted = rows.iter().any(|row| {
        row.webhook_secret
            .as_deref()
            .is_some_and(|secret| state.gitlab.verify_webhook(body, token, secret))
    });
    if !accepted {
        warn!("GitLab webhook token matched no connected row for {}", event.repo_name);
        return (StatusCode::UNAUTHORIZED, Json(json!({"error": "invalid token"})))
            .into_response();
    }

    enqueue_for_rows(state, Provider::GitLab, &event, rows).await
}

/// Enqueue one normalized event per matched row that is not paused.
/// Duplicates across users are intentional: each user gets their own
/// review.
async fn enqueue_for_rows(
    state: &Arc<AppState>,
    provider: Provider,
    event: &ParsedEvent,
    rows: Vec<crate::db::ConnectedRepo>,
) -> Response {
    let mut enqueued = 0;
    for row in rows {
        if row.status == RepoStatus::Paused {
            continue;
        }
        let webhook_event = WebhookEvent {
            provider,
            event_type: event.event_type,
            repo_slug: row.slug.clone(),
            repo_name: event.repo_name.clone(),
            pr_number: event.pr_number,
            pr_title: event.pr_title.clone(),
            pr_url: event.pr_url.clone(),
            pr_author: event.pr_author.clone(),
            base_branch: event.base_branch.clone(),
            head_branch: event.head_branch.clone(),
            raw_action: event.raw_action.clone(),
            user_id: row.user_id.clone(),
            received_at: Utc::now(),
        };
        if let Err(e) = state.queue.enqueue(QUEUE_WEBHOOK_EVENTS, &webhook_event).await {
            error!("Failed to enqueue webhook event: {:#}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "enqueue failed"})))
                .into_response();
        }
        enqueued += 1;
    }

    info!(
        "Webhook for {} {}#{} ({}) enqueued {} jobs",
        provider, event.repo_name, event.pr_number, event.raw_action, enqueued
    );
    (StatusCode::OK, Json(json!({"enqueued": enqueued}))).into_response()
}
