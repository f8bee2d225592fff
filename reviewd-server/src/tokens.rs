//! Provider token lifecycle: fresh-read, probe, refresh-on-expiry,
//! write-back.
//!
//! `get_valid` is the single entry point: callers hand it a user and a
//! provider and get back a token that passed a live probe moments ago,
//! or `None` meaning the user must re-authenticate. Writes overwrite
//! without locking; two workers refreshing concurrently may lose one
//! refresh token (the second write wins and both callers hold usable
//! access tokens). On providers with single-use refresh tokens a lost
//! race can force a re-authentication; this is accepted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use tracing::{info, warn};

use reviewd_core::Provider;

use crate::config::Config;
use crate::db::Store;

/// Probe and refresh requests are short interactive calls, not job
/// work; cap them well below the job timeouts.
const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

/// A token that passed its probe, with an explicit marker for whether
/// a refresh round-trip produced it.
#[derive(Debug, Clone)]
pub struct ValidToken {
    pub access: String,
    pub refreshed: bool,
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Clone)]
pub struct TokenStore {
    store: Store,
    config: Arc<Config>,
    client: Client,
}

impl TokenStore {
    pub fn new(store: Store, config: Arc<Config>) -> Self {
        let client = Client::builder()
            .user_agent(format!("reviewd/{}", reviewd_core::version()))
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");
        Self {
            store,
            config,
            client,
        }
    }

    /// Store an initial token pair after an OAuth dance.
    pub async fn save_initial(
        &self,
        user_id: &str,
        provider: Provider,
        access: &str,
        refresh: Option<&str>,
    ) -> Result<()> {
        self.store
            .save_provider_tokens(user_id, provider, access, refresh)
            .await
    }

    /// Return a currently-valid access token for `(user, provider)`,
    /// refreshing and writing back if the stored one no longer probes.
    ///
    /// Returns `Ok(None)` when there is no stored token, the refresh
    /// token is missing, or the refresh was rejected; all of these
    /// mean "re-authenticate".
    pub async fn get_valid(&self, user_id: &str, provider: Provider) -> Result<Option<ValidToken>> {
        let Some(settings) = self.store.get_user_settings(user_id).await? else {
            return Ok(None);
        };

        let (access, refresh) = match provider {
            Provider::GitHub => (settings.github_token, settings.github_refresh_token),
            Provider::GitLab => (settings.gitlab_token, settings.gitlab_refresh_token),
        };
        let Some(access) = access else {
            return Ok(None);
        };

        if self.probe(provider, &access).await {
            return Ok(Some(ValidToken {
                access,
                refreshed: false,
            }));
        }

        let Some(refresh) = refresh else {
            info!(
                "Access token for {} on {} is invalid and no refresh token is stored",
                user_id, provider
            );
            return Ok(None);
        };

        match self.refresh(provider, &refresh).await {
            Some(response) => {
                // Write the full latest pair back; when the provider
                // does not rotate the refresh token, re-store the old
                // one so the columns never drift apart.
                let new_refresh = response.refresh_token.unwrap_or(refresh);
                self.store
                    .save_provider_tokens(
                        user_id,
                        provider,
                        &response.access_token,
                        Some(&new_refresh),
                    )
                    .await?;
                info!("Refreshed {} token for {}", provider, user_id);
                Ok(Some(ValidToken {
                    access: response.access_token,
                    refreshed: true,
                }))
            }
            None => {
                warn!("Token refresh for {} on {} failed", user_id, provider);
                Ok(None)
            }
        }
    }

    /// Lightweight whoami call against the forge API. Any transport or
    /// HTTP error counts as invalid.
    async fn probe(&self, provider: Provider, access: &str) -> bool {
        let request = match provider {
            Provider::GitHub => self
                .client
                .get("https://api.github.com/user")
                .header("Authorization", format!("Bearer {}", access))
                .header("Accept", "application/vnd.github+json")
                .header("X-GitHub-Api-Version", "2022-11-28"),
            Provider::GitLab => self
                .client
                .get("https://gitlab.com/api/v4/user")
                .header("Authorization", format!("Bearer {}", access)),
        };

        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Token probe against {} failed: {}", provider, e);
                false
            }
        }
    }

    /// POST the forge's OAuth token endpoint with a refresh grant.
    /// Returns `None` on any transport error or non-2xx response.
    async fn refresh(&self, provider: Provider, refresh_token: &str) -> Option<OAuthTokenResponse> {
        let (url, client_id, client_secret) = match provider {
            Provider::GitHub => (
                "https://github.com/login/oauth/access_token",
                &self.config.github_client_id,
                &self.config.github_client_secret,
            ),
            Provider::GitLab => (
                "https://gitlab.com/oauth/token",
                &self.config.gitlab_client_id,
                &self.config.gitlab_client_secret,
            ),
        };

        let body = serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
            "client_id": client_id,
            "client_secret": client_secret,
        });

        let response = match self
            .client
            .post(url)
            .header("Accept", "application/json")
            .json(&body)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!("Token refresh request to {} failed: {}", provider, e);
                return None;
            }
        };

        if !response.status().is_success() {
            warn!(
                "Token refresh against {} returned {}",
                provider,
                response.status()
            );
            return None;
        }

        match response
            .json::<OAuthTokenResponse>()
            .await
            .context("Failed to parse OAuth token response")
        {
            Ok(tokens) => Some(tokens),
            Err(e) => {
                warn!("{:#}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oauth_response_with_rotated_refresh() {
        let json = r#"{"access_token": "new-access", "refresh_token": "new-refresh"}"#;
        let parsed: OAuthTokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.access_token, "new-access");
        assert_eq!(parsed.refresh_token.as_deref(), Some("new-refresh"));
    }

    #[test]
    fn test_oauth_response_without_rotated_refresh() {
        let json = r#"{"access_token": "new-access", "token_type": "bearer", "scope": ""}"#;
        let parsed: OAuthTokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.access_token, "new-access");
        assert!(parsed.refresh_token.is_none());
    }
}
