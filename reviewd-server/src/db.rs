//! SQLite persistence for users, connected repositories, reviews, and
//! subscriptions.
//!
//! Uses a `Mutex<Connection>` because `rusqlite::Connection` is not
//! `Sync`; all public methods are async and run the synchronous
//! rusqlite work on `tokio::task::spawn_blocking`.
//!
//! # Schema Versioning
//!
//! A `schema_version` table tracks the schema version. When the schema
//! changes, increment `SCHEMA_VERSION` and add a migration in
//! `run_migrations`. Migrations run sequentially from the stored
//! version to the target version.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use reviewd_core::{Provider, RepoStatus, ReviewComment};

/// Current schema version. Increment when making schema changes.
const SCHEMA_VERSION: i64 = 1;

/// Upper bound on custom skills per repository.
pub const MAX_CUSTOM_SKILLS: usize = 5;
/// Upper bound on a single custom skill's length, in characters.
pub const MAX_CUSTOM_SKILL_CHARS: usize = 2000;

/// Monthly review allowance on the free plan.
pub const FREE_PLAN_MONTHLY_REVIEWS: u32 = 50;

#[derive(Debug, Clone, Default)]
pub struct UserSettings {
    pub user_id: String,
    pub github_token: Option<String>,
    pub github_refresh_token: Option<String>,
    pub gitlab_token: Option<String>,
    pub gitlab_refresh_token: Option<String>,
    pub llm_provider: Option<String>,
    /// Stored in `provider/model` form; legacy rows may hold a bare
    /// model name which callers normalize with [`UserSettings::normalized_model`].
    pub llm_model: Option<String>,
    pub api_key: Option<String>,
    pub max_comments: u32,
}

impl UserSettings {
    /// The model in `provider/model` form, falling back to the given
    /// default provider for legacy rows stored without a slash.
    pub fn normalized_model(&self, default_model: &str) -> String {
        match &self.llm_model {
            Some(m) if m.contains('/') => m.clone(),
            Some(m) => {
                let provider = self
                    .llm_provider
                    .as_deref()
                    .unwrap_or_else(|| default_model.split('/').next().unwrap_or("anthropic"));
                format!("{}/{}", provider, m)
            }
            None => default_model.to_string(),
        }
    }
}

/// Outcome of one repository analysis, stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisData {
    pub profile: Option<String>,
    pub provider: String,
    pub model: String,
    pub analyzed_at: DateTime<Utc>,
}

/// The finished review persona, stored as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaData {
    pub persona: String,
    #[serde(default)]
    pub edited: bool,
}

#[derive(Debug, Clone)]
pub struct ConnectedRepo {
    pub user_id: String,
    pub slug: String,
    /// Forge identity in `owner/name` form.
    pub name: String,
    pub provider: Provider,
    pub status: RepoStatus,
    pub connected_at: DateTime<Utc>,
    pub analysis: Option<AnalysisData>,
    pub persona: Option<PersonaData>,
    pub custom_skills: Vec<String>,
    pub webhook_hook_id: Option<u64>,
    /// Per-repo webhook token; set only for GitLab repositories.
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReviewRecord {
    pub id: i64,
    pub user_id: String,
    pub repo_slug: String,
    pub pr_number: u64,
    pub pr_title: String,
    pub pr_url: String,
    pub pr_author: String,
    pub verdict: String,
    pub summary: String,
    pub comment_count: u32,
    pub comments: Vec<ReviewComment>,
    pub llm_provider: String,
    pub llm_model: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plan {
    Free,
    Pro,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Pro => "pro",
        }
    }

    fn parse(s: &str) -> Plan {
        match s {
            "pro" => Plan::Pro,
            _ => Plan::Free,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub user_id: String,
    pub plan: Plan,
    pub status: String,
    pub review_count_month: u32,
    pub review_count_reset_at: DateTime<Utc>,
    pub current_period_end: Option<DateTime<Utc>>,
}

/// Reject a custom-skill list that exceeds the count or length caps.
pub fn validate_custom_skills(skills: &[String]) -> Result<()> {
    if skills.len() > MAX_CUSTOM_SKILLS {
        return Err(anyhow!(
            "at most {} custom skills are allowed, got {}",
            MAX_CUSTOM_SKILLS,
            skills.len()
        ));
    }
    for (i, s) in skills.iter().enumerate() {
        let chars = s.chars().count();
        if chars > MAX_CUSTOM_SKILL_CHARS {
            return Err(anyhow!(
                "custom skill {} is {} characters, max is {}",
                i + 1,
                chars,
                MAX_CUSTOM_SKILL_CHARS
            ));
        }
    }
    Ok(())
}

/// SQLite-backed store for the pipeline's relational state.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the store at the given path.
    ///
    /// The database is configured with WAL journaling and a busy
    /// timeout so the queue and store connections can share the file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).with_context(|| {
            format!("Failed to open SQLite database at {:?}", path.as_ref())
        })?;
        Self::from_connection(conn)
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            PRAGMA busy_timeout = 5000;
            "#,
        )
        .context("Failed to configure pragmas")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL
            );
            "#,
        )
        .context("Failed to create schema_version table")?;

        let current_version: i64 = conn
            .query_row(
                "SELECT version FROM schema_version WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read schema version")?
            .unwrap_or(0);

        Self::run_migrations(&conn, current_version)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection, from_version: i64) -> Result<()> {
        if from_version > SCHEMA_VERSION {
            return Err(anyhow!(
                "Database schema version {} is newer than supported version {}. \
                 Please upgrade the application.",
                from_version,
                SCHEMA_VERSION
            ));
        }
        if from_version == SCHEMA_VERSION {
            return Ok(());
        }

        if from_version < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS user_settings (
                    user_id TEXT PRIMARY KEY,
                    github_token TEXT,
                    github_refresh_token TEXT,
                    gitlab_token TEXT,
                    gitlab_refresh_token TEXT,
                    llm_provider TEXT,
                    llm_model TEXT,
                    api_key TEXT,
                    max_comments INTEGER NOT NULL DEFAULT 10
                );

                CREATE TABLE IF NOT EXISTS connected_repositories (
                    user_id TEXT NOT NULL,
                    slug TEXT NOT NULL,
                    name TEXT NOT NULL,
                    provider TEXT NOT NULL CHECK(provider IN ('github', 'gitlab')),
                    status TEXT NOT NULL CHECK(status IN (
                        'analyzing', 'interview', 'active', 'paused'
                    )),
                    connected_at TEXT NOT NULL,
                    analysis_data TEXT,
                    persona_data TEXT,
                    custom_skills TEXT NOT NULL DEFAULT '[]',
                    webhook_hook_id INTEGER,
                    webhook_secret TEXT,
                    PRIMARY KEY (user_id, slug)
                );

                CREATE INDEX IF NOT EXISTS idx_repos_by_name
                    ON connected_repositories(provider, name);

                CREATE TABLE IF NOT EXISTS reviews (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    user_id TEXT NOT NULL,
                    repo_slug TEXT NOT NULL,
                    pr_number INTEGER NOT NULL,
                    pr_title TEXT NOT NULL,
                    pr_url TEXT NOT NULL,
                    pr_author TEXT NOT NULL,
                    verdict TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    comment_count INTEGER NOT NULL,
                    comments TEXT NOT NULL,
                    llm_provider TEXT NOT NULL,
                    llm_model TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_reviews_repo
                    ON reviews(user_id, repo_slug);
                CREATE INDEX IF NOT EXISTS idx_reviews_recent
                    ON reviews(user_id, created_at DESC);

                CREATE TABLE IF NOT EXISTS subscriptions (
                    user_id TEXT PRIMARY KEY,
                    stripe_customer_id TEXT,
                    stripe_subscription_id TEXT,
                    plan TEXT NOT NULL DEFAULT 'free',
                    status TEXT NOT NULL DEFAULT 'active',
                    current_period_end TEXT,
                    review_count_month INTEGER NOT NULL DEFAULT 0,
                    review_count_reset_at TEXT NOT NULL
                );
                "#,
            )
            .context("Failed to run migration v1")?;
        }

        conn.execute(
            "INSERT INTO schema_version (id, version) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET version = ?1",
            params![SCHEMA_VERSION],
        )
        .context("Failed to record schema version")?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().expect("store mutex poisoned");
            f(&conn)
        })
        .await
        .context("store task panicked")?
    }

    // ---- user settings ----

    pub async fn get_user_settings(&self, user_id: &str) -> Result<Option<UserSettings>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT user_id, github_token, github_refresh_token, gitlab_token,
                        gitlab_refresh_token, llm_provider, llm_model, api_key, max_comments
                 FROM user_settings WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(UserSettings {
                        user_id: row.get(0)?,
                        github_token: row.get(1)?,
                        github_refresh_token: row.get(2)?,
                        gitlab_token: row.get(3)?,
                        gitlab_refresh_token: row.get(4)?,
                        llm_provider: row.get(5)?,
                        llm_model: row.get(6)?,
                        api_key: row.get(7)?,
                        max_comments: row.get::<_, i64>(8)? as u32,
                    })
                },
            )
            .optional()
            .context("Failed to read user settings")
        })
        .await
    }

    pub async fn upsert_user_settings(&self, settings: UserSettings) -> Result<()> {
        let max_comments = settings.max_comments.clamp(1, 50);
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO user_settings (user_id, github_token, github_refresh_token,
                        gitlab_token, gitlab_refresh_token, llm_provider, llm_model,
                        api_key, max_comments)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(user_id) DO UPDATE SET
                        github_token = excluded.github_token,
                        github_refresh_token = excluded.github_refresh_token,
                        gitlab_token = excluded.gitlab_token,
                        gitlab_refresh_token = excluded.gitlab_refresh_token,
                        llm_provider = excluded.llm_provider,
                        llm_model = excluded.llm_model,
                        api_key = excluded.api_key,
                        max_comments = excluded.max_comments",
                params![
                    settings.user_id,
                    settings.github_token,
                    settings.github_refresh_token,
                    settings.gitlab_token,
                    settings.gitlab_refresh_token,
                    settings.llm_provider,
                    settings.llm_model,
                    settings.api_key,
                    max_comments as i64,
                ],
            )
            .context("Failed to upsert user settings")?;
            Ok(())
        })
        .await
    }

    /// Write the provider token pair for a user.
    ///
    /// The access token is always written. When `refresh` is `Some`,
    /// the refresh token is written too; callers that refreshed should
    /// always pass the full latest pair (re-passing the old refresh
    /// token when the provider did not rotate it) so the stored pair
    /// never drifts.
    pub async fn save_provider_tokens(
        &self,
        user_id: &str,
        provider: Provider,
        access: &str,
        refresh: Option<&str>,
    ) -> Result<()> {
        let user_id = user_id.to_string();
        let access = access.to_string();
        let refresh = refresh.map(|s| s.to_string());
        self.with_conn(move |conn| {
            let (access_col, refresh_col) = match provider {
                Provider::GitHub => ("github_token", "github_refresh_token"),
                Provider::GitLab => ("gitlab_token", "gitlab_refresh_token"),
            };
            let sql = if refresh.is_some() {
                format!(
                    "INSERT INTO user_settings (user_id, {a}, {r}) VALUES (?1, ?2, ?3)
                     ON CONFLICT(user_id) DO UPDATE SET {a} = ?2, {r} = ?3",
                    a = access_col,
                    r = refresh_col
                )
            } else {
                format!(
                    "INSERT INTO user_settings (user_id, {a}) VALUES (?1, ?2)
                     ON CONFLICT(user_id) DO UPDATE SET {a} = ?2",
                    a = access_col
                )
            };
            if let Some(refresh) = refresh {
                conn.execute(&sql, params![user_id, access, refresh])
            } else {
                conn.execute(&sql, params![user_id, access])
            }
            .context("Failed to save provider tokens")?;
            Ok(())
        })
        .await
    }

    // ---- connected repositories ----

    fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<ConnectedRepo> {
        let provider: String = row.get(3)?;
        let status: String = row.get(4)?;
        let connected_at: String = row.get(5)?;
        let analysis: Option<String> = row.get(6)?;
        let persona: Option<String> = row.get(7)?;
        let custom_skills: String = row.get(8)?;
        Ok(ConnectedRepo {
            user_id: row.get(0)?,
            slug: row.get(1)?,
            name: row.get(2)?,
            provider: Provider::parse(&provider).unwrap_or(Provider::GitHub),
            status: RepoStatus::parse(&status).unwrap_or(RepoStatus::Paused),
            connected_at: DateTime::parse_from_rfc3339(&connected_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            analysis: analysis.and_then(|s| serde_json::from_str(&s).ok()),
            persona: persona.and_then(|s| serde_json::from_str(&s).ok()),
            custom_skills: serde_json::from_str(&custom_skills).unwrap_or_default(),
            webhook_hook_id: row.get::<_, Option<i64>>(9)?.map(|v| v as u64),
            webhook_secret: row.get(10)?,
        })
    }

    const REPO_COLUMNS: &'static str = "user_id, slug, name, provider, status, connected_at, \
         analysis_data, persona_data, custom_skills, webhook_hook_id, webhook_secret";

    pub async fn create_repo(&self, repo: ConnectedRepo) -> Result<()> {
        validate_custom_skills(&repo.custom_skills)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO connected_repositories
                     (user_id, slug, name, provider, status, connected_at,
                      analysis_data, persona_data, custom_skills, webhook_hook_id, webhook_secret)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    repo.user_id,
                    repo.slug,
                    repo.name,
                    repo.provider.as_str(),
                    repo.status.as_str(),
                    repo.connected_at.to_rfc3339(),
                    repo.analysis
                        .as_ref()
                        .map(|a| serde_json::to_string(a).unwrap_or_default()),
                    repo.persona
                        .as_ref()
                        .map(|p| serde_json::to_string(p).unwrap_or_default()),
                    serde_json::to_string(&repo.custom_skills).unwrap_or_else(|_| "[]".to_string()),
                    repo.webhook_hook_id.map(|v| v as i64),
                    repo.webhook_secret,
                ],
            )
            .context("Failed to insert connected repository")?;
            Ok(())
        })
        .await
    }

    pub async fn get_repo(&self, user_id: &str, slug: &str) -> Result<Option<ConnectedRepo>> {
        let user_id = user_id.to_string();
        let slug = slug.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM connected_repositories WHERE user_id = ?1 AND slug = ?2",
                    Self::REPO_COLUMNS
                ),
                params![user_id, slug],
                Self::repo_from_row,
            )
            .optional()
            .context("Failed to read connected repository")
        })
        .await
    }

    /// All connected rows for a forge repository, across users.
    /// Used by the webhook ingress to fan one forge event out to every
    /// user who connected the repository.
    pub async fn repos_for_name(
        &self,
        provider: Provider,
        name: &str,
    ) -> Result<Vec<ConnectedRepo>> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM connected_repositories WHERE provider = ?1 AND name = ?2",
                Self::REPO_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![provider.as_str(), name], Self::repo_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read connected repositories by name")?;
            Ok(rows)
        })
        .await
    }

    /// Record an analysis outcome and advance the repo from
    /// `analyzing` to `interview`. Called on both success (profile
    /// present) and failure (profile absent) so the user is never
    /// stuck in `analyzing`. A re-analysis of an already-interviewed
    /// or active repo updates the profile without moving the status
    /// backwards.
    pub async fn store_analysis(
        &self,
        user_id: &str,
        slug: &str,
        analysis: Option<AnalysisData>,
    ) -> Result<()> {
        let user_id = user_id.to_string();
        let slug = slug.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE connected_repositories
                 SET analysis_data = ?3,
                     status = CASE WHEN status = 'analyzing' THEN 'interview' ELSE status END
                 WHERE user_id = ?1 AND slug = ?2",
                params![
                    user_id,
                    slug,
                    analysis
                        .as_ref()
                        .map(|a| serde_json::to_string(a).unwrap_or_default()),
                ],
            )
            .context("Failed to store analysis")?;
            Ok(())
        })
        .await
    }

    /// Persist the finished persona and advance the repo to `active`.
    pub async fn store_persona(&self, user_id: &str, slug: &str, persona: PersonaData) -> Result<()> {
        let user_id = user_id.to_string();
        let slug = slug.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE connected_repositories
                 SET persona_data = ?3, status = 'active'
                 WHERE user_id = ?1 AND slug = ?2",
                params![user_id, slug, serde_json::to_string(&persona)?],
            )
            .context("Failed to store persona")?;
            Ok(())
        })
        .await
    }

    /// Toggle between `active` and `paused`. Other transitions are the
    /// analyzer's and interview's to make.
    pub async fn set_repo_paused(&self, user_id: &str, slug: &str, paused: bool) -> Result<()> {
        let user_id = user_id.to_string();
        let slug = slug.to_string();
        self.with_conn(move |conn| {
            let (to, from) = if paused {
                ("paused", "active")
            } else {
                ("active", "paused")
            };
            let changed = conn
                .execute(
                    "UPDATE connected_repositories SET status = ?3
                     WHERE user_id = ?1 AND slug = ?2 AND status = ?4",
                    params![user_id, slug, to, from],
                )
                .context("Failed to update repository status")?;
            if changed == 0 {
                return Err(anyhow!("repository not found or not in a toggleable state"));
            }
            Ok(())
        })
        .await
    }

    pub async fn update_custom_skills(
        &self,
        user_id: &str,
        slug: &str,
        skills: Vec<String>,
    ) -> Result<()> {
        validate_custom_skills(&skills)?;
        let user_id = user_id.to_string();
        let slug = slug.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE connected_repositories SET custom_skills = ?3
                 WHERE user_id = ?1 AND slug = ?2",
                params![user_id, slug, serde_json::to_string(&skills)?],
            )
            .context("Failed to update custom skills")?;
            Ok(())
        })
        .await
    }

    pub async fn set_webhook_metadata(
        &self,
        user_id: &str,
        slug: &str,
        hook_id: u64,
        secret: &str,
    ) -> Result<()> {
        let user_id = user_id.to_string();
        let slug = slug.to_string();
        let secret = secret.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE connected_repositories
                 SET webhook_hook_id = ?3, webhook_secret = ?4
                 WHERE user_id = ?1 AND slug = ?2",
                params![user_id, slug, hook_id as i64, secret],
            )
            .context("Failed to store webhook metadata")?;
            Ok(())
        })
        .await
    }

    /// Delete a repository and its review history.
    pub async fn delete_repo(&self, user_id: &str, slug: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let slug = slug.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM reviews WHERE user_id = ?1 AND repo_slug = ?2",
                params![user_id, slug],
            )
            .context("Failed to delete reviews")?;
            conn.execute(
                "DELETE FROM connected_repositories WHERE user_id = ?1 AND slug = ?2",
                params![user_id, slug],
            )
            .context("Failed to delete connected repository")?;
            Ok(())
        })
        .await
    }

    // ---- reviews ----

    pub async fn insert_review(&self, record: ReviewRecord) -> Result<i64> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO reviews
                     (user_id, repo_slug, pr_number, pr_title, pr_url, pr_author,
                      verdict, summary, comment_count, comments, llm_provider,
                      llm_model, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    record.user_id,
                    record.repo_slug,
                    record.pr_number as i64,
                    record.pr_title,
                    record.pr_url,
                    record.pr_author,
                    record.verdict,
                    record.summary,
                    record.comment_count as i64,
                    serde_json::to_string(&record.comments)?,
                    record.llm_provider,
                    record.llm_model,
                    record.created_at.to_rfc3339(),
                ],
            )
            .context("Failed to insert review")?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    fn review_from_row(row: &Row<'_>) -> rusqlite::Result<ReviewRecord> {
        let comments: String = row.get(10)?;
        let created_at: String = row.get(13)?;
        Ok(ReviewRecord {
            id: row.get(0)?,
            user_id: row.get(1)?,
            repo_slug: row.get(2)?,
            pr_number: row.get::<_, i64>(3)? as u64,
            pr_title: row.get(4)?,
            pr_url: row.get(5)?,
            pr_author: row.get(6)?,
            verdict: row.get(7)?,
            summary: row.get(8)?,
            comment_count: row.get::<_, i64>(9)? as u32,
            comments: serde_json::from_str(&comments).unwrap_or_default(),
            llm_provider: row.get(11)?,
            llm_model: row.get(12)?,
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
        })
    }

    const REVIEW_COLUMNS: &'static str = "id, user_id, repo_slug, pr_number, pr_title, pr_url, \
         pr_author, verdict, summary, comment_count, comments, llm_provider, llm_model, created_at";

    /// Prior reviews of one PR, newest first. Feeds comment dedup.
    pub async fn prior_reviews(
        &self,
        user_id: &str,
        repo_slug: &str,
        pr_number: u64,
    ) -> Result<Vec<ReviewRecord>> {
        let user_id = user_id.to_string();
        let repo_slug = repo_slug.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM reviews
                 WHERE user_id = ?1 AND repo_slug = ?2 AND pr_number = ?3
                 ORDER BY created_at DESC",
                Self::REVIEW_COLUMNS
            ))?;
            let rows = stmt
                .query_map(
                    params![user_id, repo_slug, pr_number as i64],
                    Self::review_from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to read prior reviews")?;
            Ok(rows)
        })
        .await
    }

    pub async fn list_reviews(&self, user_id: &str, limit: u32) -> Result<Vec<ReviewRecord>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM reviews WHERE user_id = ?1
                 ORDER BY created_at DESC LIMIT ?2",
                Self::REVIEW_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![user_id, limit as i64], Self::review_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .context("Failed to list reviews")?;
            Ok(rows)
        })
        .await
    }

    // ---- subscriptions ----

    pub async fn get_subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT user_id, plan, status, review_count_month, review_count_reset_at,
                        current_period_end
                 FROM subscriptions WHERE user_id = ?1",
                params![user_id],
                |row| {
                    let reset_at: String = row.get(4)?;
                    let period_end: Option<String> = row.get(5)?;
                    Ok(Subscription {
                        user_id: row.get(0)?,
                        plan: Plan::parse(&row.get::<_, String>(1)?),
                        status: row.get(2)?,
                        review_count_month: row.get::<_, i64>(3)? as u32,
                        review_count_reset_at: DateTime::parse_from_rfc3339(&reset_at)
                            .map(|t| t.with_timezone(&Utc))
                            .unwrap_or_else(|_| Utc::now()),
                        current_period_end: period_end.and_then(|s| {
                            DateTime::parse_from_rfc3339(&s)
                                .map(|t| t.with_timezone(&Utc))
                                .ok()
                        }),
                    })
                },
            )
            .optional()
            .context("Failed to read subscription")
        })
        .await
    }

    pub async fn upsert_subscription(&self, sub: Subscription) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO subscriptions
                     (user_id, plan, status, review_count_month, review_count_reset_at,
                      current_period_end)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(user_id) DO UPDATE SET
                     plan = excluded.plan,
                     status = excluded.status,
                     review_count_month = excluded.review_count_month,
                     review_count_reset_at = excluded.review_count_reset_at,
                     current_period_end = excluded.current_period_end",
                params![
                    sub.user_id,
                    sub.plan.as_str(),
                    sub.status,
                    sub.review_count_month as i64,
                    sub.review_count_reset_at.to_rfc3339(),
                    sub.current_period_end.map(|t| t.to_rfc3339()),
                ],
            )
            .context("Failed to upsert subscription")?;
            Ok(())
        })
        .await
    }

    /// Zero the monthly counter and stamp a new reset time.
    pub async fn reset_review_count(&self, user_id: &str, now: DateTime<Utc>) -> Result<()> {
        let user_id = user_id.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE subscriptions
                 SET review_count_month = 0, review_count_reset_at = ?2
                 WHERE user_id = ?1",
                params![user_id, now.to_rfc3339()],
            )
            .context("Failed to reset review count")?;
            Ok(())
        })
        .await
    }

    /// Atomically add one to the monthly counter, creating the row if
    /// the user has no subscription record yet.
    pub async fn increment_review_count(&self, user_id: &str) -> Result<()> {
        let user_id = user_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO subscriptions (user_id, review_count_month, review_count_reset_at)
                 VALUES (?1, 1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET
                     review_count_month = review_count_month + 1",
                params![user_id, now],
            )
            .context("Failed to increment review count")?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reviewd_core::Severity;

    fn sample_repo(user: &str, slug: &str) -> ConnectedRepo {
        ConnectedRepo {
            user_id: user.to_string(),
            slug: slug.to_string(),
            name: "acme/api".to_string(),
            provider: Provider::GitHub,
            status: RepoStatus::Analyzing,
            connected_at: Utc::now(),
            analysis: None,
            persona: None,
            custom_skills: vec![],
            webhook_hook_id: None,
            webhook_secret: None,
        }
    }

    fn sample_review(user: &str, slug: &str, pr: u64, messages: &[&str]) -> ReviewRecord {
        let comments: Vec<ReviewComment> = messages
            .iter()
            .map(|m| ReviewComment {
                file: "a.ts".to_string(),
                line: 10,
                end_line: None,
                severity: Severity::Warning,
                category: "correctness".to_string(),
                message: m.to_string(),
                suggestion: None,
            })
            .collect();
        ReviewRecord {
            id: 0,
            user_id: user.to_string(),
            repo_slug: slug.to_string(),
            pr_number: pr,
            pr_title: "Add feature".to_string(),
            pr_url: "https://github.com/acme/api/pull/42".to_string(),
            pr_author: "dev".to_string(),
            verdict: "comment".to_string(),
            summary: format!("{} comments", comments.len()),
            comment_count: comments.len() as u32,
            comments,
            llm_provider: "anthropic".to_string(),
            llm_model: "anthropic/claude-sonnet-4-5".to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_repo_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        store.create_repo(sample_repo("u1", "acme-api")).await.unwrap();

        let repo = store.get_repo("u1", "acme-api").await.unwrap().unwrap();
        assert_eq!(repo.status, RepoStatus::Analyzing);

        store
            .store_analysis(
                "u1",
                "acme-api",
                Some(AnalysisData {
                    profile: Some("# Profile".to_string()),
                    provider: "anthropic".to_string(),
                    model: "anthropic/claude-sonnet-4-5".to_string(),
                    analyzed_at: Utc::now(),
                }),
            )
            .await
            .unwrap();
        let repo = store.get_repo("u1", "acme-api").await.unwrap().unwrap();
        assert_eq!(repo.status, RepoStatus::Interview);
        assert_eq!(repo.analysis.unwrap().profile.as_deref(), Some("# Profile"));

        store
            .store_persona(
                "u1",
                "acme-api",
                PersonaData {
                    persona: "# Persona".to_string(),
                    edited: false,
                },
            )
            .await
            .unwrap();
        let repo = store.get_repo("u1", "acme-api").await.unwrap().unwrap();
        assert_eq!(repo.status, RepoStatus::Active);

        store.set_repo_paused("u1", "acme-api", true).await.unwrap();
        let repo = store.get_repo("u1", "acme-api").await.unwrap().unwrap();
        assert_eq!(repo.status, RepoStatus::Paused);

        store.set_repo_paused("u1", "acme-api", false).await.unwrap();
        let repo = store.get_repo("u1", "acme-api").await.unwrap().unwrap();
        assert_eq!(repo.status, RepoStatus::Active);
    }

    #[tokio::test]
    async fn test_reanalysis_does_not_regress_status() {
        let store = Store::open_in_memory().unwrap();
        store.create_repo(sample_repo("u1", "acme-api")).await.unwrap();
        store.store_analysis("u1", "acme-api", None).await.unwrap();
        store
            .store_persona(
                "u1",
                "acme-api",
                PersonaData {
                    persona: "# Persona".to_string(),
                    edited: false,
                },
            )
            .await
            .unwrap();

        store
            .store_analysis(
                "u1",
                "acme-api",
                Some(AnalysisData {
                    profile: Some("# Fresh profile".to_string()),
                    provider: "anthropic".to_string(),
                    model: "anthropic/claude-sonnet-4-5".to_string(),
                    analyzed_at: Utc::now(),
                }),
            )
            .await
            .unwrap();

        let repo = store.get_repo("u1", "acme-api").await.unwrap().unwrap();
        assert_eq!(repo.status, RepoStatus::Active);
        assert_eq!(
            repo.analysis.unwrap().profile.as_deref(),
            Some("# Fresh profile")
        );
    }

    #[tokio::test]
    async fn test_pause_requires_active_state() {
        let store = Store::open_in_memory().unwrap();
        store.create_repo(sample_repo("u1", "acme-api")).await.unwrap();
        // Still analyzing: cannot pause.
        assert!(store.set_repo_paused("u1", "acme-api", true).await.is_err());
    }

    #[tokio::test]
    async fn test_repos_for_name_spans_users() {
        let store = Store::open_in_memory().unwrap();
        store.create_repo(sample_repo("u1", "acme-api")).await.unwrap();
        store.create_repo(sample_repo("u2", "acme-api")).await.unwrap();

        let rows = store
            .repos_for_name(Provider::GitHub, "acme/api")
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let rows = store
            .repos_for_name(Provider::GitLab, "acme/api")
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_custom_skills_caps() {
        let store = Store::open_in_memory().unwrap();
        store.create_repo(sample_repo("u1", "acme-api")).await.unwrap();

        let too_many: Vec<String> = (0..6).map(|i| format!("skill {}", i)).collect();
        assert!(store
            .update_custom_skills("u1", "acme-api", too_many)
            .await
            .is_err());

        let too_long = vec!["x".repeat(2001)];
        assert!(store
            .update_custom_skills("u1", "acme-api", too_long)
            .await
            .is_err());

        let fine = vec!["Prefer builder structs over long arg lists".to_string()];
        store
            .update_custom_skills("u1", "acme-api", fine)
            .await
            .unwrap();
        let repo = store.get_repo("u1", "acme-api").await.unwrap().unwrap();
        assert_eq!(repo.custom_skills.len(), 1);
    }

    #[tokio::test]
    async fn test_save_provider_tokens_always_writes_pair() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_provider_tokens("u1", Provider::GitHub, "access-1", Some("refresh-1"))
            .await
            .unwrap();
        store
            .save_provider_tokens("u1", Provider::GitHub, "access-2", Some("refresh-2"))
            .await
            .unwrap();

        let settings = store.get_user_settings("u1").await.unwrap().unwrap();
        assert_eq!(settings.github_token.as_deref(), Some("access-2"));
        assert_eq!(settings.github_refresh_token.as_deref(), Some("refresh-2"));

        // Access-only write leaves the stored refresh token in place.
        store
            .save_provider_tokens("u1", Provider::GitHub, "access-3", None)
            .await
            .unwrap();
        let settings = store.get_user_settings("u1").await.unwrap().unwrap();
        assert_eq!(settings.github_token.as_deref(), Some("access-3"));
        assert_eq!(settings.github_refresh_token.as_deref(), Some("refresh-2"));
    }

    #[tokio::test]
    async fn test_review_history_and_cascade_delete() {
        let store = Store::open_in_memory().unwrap();
        store.create_repo(sample_repo("u1", "acme-api")).await.unwrap();

        store
            .insert_review(sample_review("u1", "acme-api", 42, &["first"]))
            .await
            .unwrap();
        store
            .insert_review(sample_review("u1", "acme-api", 42, &["second", "third"]))
            .await
            .unwrap();
        store
            .insert_review(sample_review("u1", "acme-api", 7, &["other pr"]))
            .await
            .unwrap();

        let prior = store.prior_reviews("u1", "acme-api", 42).await.unwrap();
        assert_eq!(prior.len(), 2);
        for r in &prior {
            assert_eq!(r.comment_count as usize, r.comments.len());
        }

        store.delete_repo("u1", "acme-api").await.unwrap();
        assert!(store.get_repo("u1", "acme-api").await.unwrap().is_none());
        assert!(store
            .prior_reviews("u1", "acme-api", 42)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_increment_review_count_upserts() {
        let store = Store::open_in_memory().unwrap();

        store.increment_review_count("u1").await.unwrap();
        store.increment_review_count("u1").await.unwrap();

        let sub = store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(sub.review_count_month, 2);
        assert_eq!(sub.plan, Plan::Free);

        store.reset_review_count("u1", Utc::now()).await.unwrap();
        let sub = store.get_subscription("u1").await.unwrap().unwrap();
        assert_eq!(sub.review_count_month, 0);
    }

    #[test]
    fn test_normalized_model() {
        let mut settings = UserSettings {
            llm_model: Some("anthropic/claude-sonnet-4-5".to_string()),
            ..Default::default()
        };
        assert_eq!(
            settings.normalized_model("openai/gpt-5"),
            "anthropic/claude-sonnet-4-5"
        );

        settings.llm_model = Some("claude-sonnet-4-5".to_string());
        settings.llm_provider = Some("anthropic".to_string());
        assert_eq!(
            settings.normalized_model("openai/gpt-5"),
            "anthropic/claude-sonnet-4-5"
        );

        settings.llm_model = None;
        assert_eq!(settings.normalized_model("openai/gpt-5"), "openai/gpt-5");
    }
}
