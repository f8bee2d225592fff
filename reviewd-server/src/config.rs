use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::PathBuf;

#[derive(Clone)]
pub struct Config {
    /// App-level secret for GitHub webhook signatures.
    pub github_webhook_secret: String,
    /// OAuth client credentials for refreshing user tokens.
    pub github_client_id: String,
    pub github_client_secret: String,
    pub gitlab_client_id: String,
    pub gitlab_client_secret: String,
    /// GitHub App identity for posting reviews as the bot.
    /// When absent, reviews are posted with the user's token.
    pub github_app_id: Option<u64>,
    pub github_app_private_key: Option<String>,
    /// GitLab bot credentials. The PAT is detected by its `glpat-`
    /// prefix and sent via PRIVATE-TOKEN when posting.
    pub gitlab_bot_token: Option<String>,
    pub gitlab_bot_user_id: Option<u64>,
    /// Public base URL that per-repo GitLab hooks point at.
    pub webhook_base_url: String,
    /// Directory for persistent state (SQLite database).
    pub state_dir: PathBuf,
    /// Root of the predefined skills catalog.
    pub skills_dir: PathBuf,
    /// Container image for sandboxed agent runs.
    pub sandbox_image: String,
    /// Fallback model in `provider/model` form for users who have not
    /// picked one.
    pub default_model: String,
    pub poll_interval_ms: u64,
    pub port: u16,
}

/// Drop surrounding whitespace; an effectively blank value counts as
/// unset.
fn non_blank(raw: String) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Look up a secret by key.
///
/// `<KEY>_FILE`, when set, names a file whose contents are the value
/// and takes precedence over a plain `<KEY>` variable; a `_FILE` that
/// cannot be read is an error rather than a silent fallback. Values
/// taken from plain variables get `\n` escape sequences expanded,
/// since PEM keys are commonly stored as single-line env vars.
/// Returns `None` when the secret is unset or blank.
fn lookup_secret(key: &str) -> Result<Option<String>> {
    let file_var = format!("{}_FILE", key);
    if let Ok(path) = env::var(&file_var) {
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("{} names {}, which could not be read", file_var, path))?;
        return Ok(non_blank(raw));
    }
    match env::var(key) {
        Ok(raw) => Ok(non_blank(raw.replace("\\n", "\n"))),
        Err(_) => Ok(None),
    }
}

/// A secret the worker cannot run without.
fn require_secret(key: &str) -> Result<String> {
    lookup_secret(key)?
        .ok_or_else(|| anyhow!("set {} (or {}_FILE) before starting the worker", key, key))
}

fn lookup_u64(key: &str) -> Result<Option<u64>> {
    lookup_secret(key)?
        .map(|v| {
            v.parse::<u64>()
                .with_context(|| format!("{} must be a number, got {:?}", key, v))
        })
        .transpose()
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_webhook_secret = require_secret("GITHUB_WEBHOOK_SECRET")?;
        let github_client_id = require_secret("GITHUB_CLIENT_ID")?;
        let github_client_secret = require_secret("GITHUB_CLIENT_SECRET")?;
        let gitlab_client_id = require_secret("GITLAB_CLIENT_ID")?;
        let gitlab_client_secret = require_secret("GITLAB_CLIENT_SECRET")?;

        let github_app_id = lookup_u64("GITHUB_APP_ID")?;
        let github_app_private_key = lookup_secret("GITHUB_APP_PRIVATE_KEY")?;

        let gitlab_bot_token = lookup_secret("GITLAB_BOT_TOKEN")?;
        let gitlab_bot_user_id = lookup_u64("GITLAB_BOT_USER_ID")?;

        let webhook_base_url = env::var("WEBHOOK_BASE_URL")
            .context("WEBHOOK_BASE_URL environment variable is required")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let skills_dir = env::var("SKILLS_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("skills"));

        let sandbox_image =
            env::var("SANDBOX_IMAGE").unwrap_or_else(|_| "reviewd-sandbox:latest".to_string());

        let default_model =
            env::var("DEFAULT_MODEL").unwrap_or_else(|_| "anthropic/claude-sonnet-4-5".to_string());

        let poll_interval_ms = env::var("POLL_INTERVAL_MS")
            .unwrap_or_else(|_| "5000".to_string())
            .parse::<u64>()
            .context("POLL_INTERVAL_MS must be a valid number")?;

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        Ok(Config {
            github_webhook_secret,
            github_client_id,
            github_client_secret,
            gitlab_client_id,
            gitlab_client_secret,
            github_app_id,
            github_app_private_key,
            gitlab_bot_token,
            gitlab_bot_user_id,
            webhook_base_url,
            state_dir,
            skills_dir,
            sandbox_image,
            default_model,
            poll_interval_ms,
            port,
        })
    }
}
