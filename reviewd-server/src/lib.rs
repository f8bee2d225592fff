pub mod agent;
pub mod analyzer;
pub mod config;
pub mod db;
pub mod errors;
pub mod forge;
pub mod interview;
pub mod queue;
pub mod reviewer;
pub mod routes;
pub mod sandbox;
pub mod scheduler;
pub mod skills;
pub mod tokens;
pub mod webhook;

use std::sync::Arc;

use reviewd_core::Provider;

use config::Config;
use db::Store;
use forge::{ForgeAdapter, GitHubForge, GitLabForge};
use queue::Queue;
use skills::SkillsCatalog;
use tokens::TokenStore;

/// Shared state for HTTP handlers and the worker loop.
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub queue: Queue,
    pub tokens: TokenStore,
    pub github: GitHubForge,
    pub gitlab: GitLabForge,
    pub skills: SkillsCatalog,
}

impl AppState {
    pub fn forge(&self, provider: Provider) -> &dyn ForgeAdapter {
        match provider {
            Provider::GitHub => &self.github,
            Provider::GitLab => &self.gitlab,
        }
    }
}
