use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info, Level};

use reviewd_server::config::Config;
use reviewd_server::db::Store;
use reviewd_server::forge::github::GitHubApp;
use reviewd_server::forge::{GitHubForge, GitLabForge};
use reviewd_server::queue::Queue;
use reviewd_server::routes::api_router;
use reviewd_server::scheduler::run_scheduler;
use reviewd_server::skills::SkillsCatalog;
use reviewd_server::tokens::TokenStore;
use reviewd_server::webhook::webhook_router;
use reviewd_server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting reviewd {}", reviewd_core::version());

    let config = match Config::from_env() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            error!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    let db_path = config.state_dir.join("reviewd.db");
    info!("Using state database: {}", db_path.display());
    let store = Store::open(&db_path)?;
    let queue = Queue::open(&db_path)?;

    let skills = SkillsCatalog::load(&config.skills_dir)?;

    let github_app = match (config.github_app_id, config.github_app_private_key.clone()) {
        (Some(app_id), Some(private_key)) => Some(GitHubApp {
            app_id,
            private_key,
        }),
        (None, None) => None,
        _ => {
            error!("GITHUB_APP_ID and GITHUB_APP_PRIVATE_KEY must be set together");
            std::process::exit(1);
        }
    };

    let tokens = TokenStore::new(store.clone(), config.clone());
    let state = Arc::new(AppState {
        github: GitHubForge::new(github_app),
        gitlab: GitLabForge::new(
            config.gitlab_bot_token.clone(),
            config.gitlab_bot_user_id,
        ),
        config: config.clone(),
        store,
        queue,
        tokens,
        skills,
    });

    // Graceful shutdown: the scheduler finishes its in-flight
    // iteration; the HTTP server stops accepting new requests.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(run_scheduler(state.clone(), shutdown_rx));

    let app = Router::new()
        .merge(api_router())
        .merge(webhook_router())
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state.clone());

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    scheduler_handle.await?;

    Ok(())
}
