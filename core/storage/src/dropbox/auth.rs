//! OAuth2 token management for Dropbox.
//!
//! Access tokens are short-lived; a refresh token is exchanged at the token
//! endpoint whenever fewer than five minutes of validity remain.

use chrono::{DateTime, Duration, Utc};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use soundvault_common::{Error, Result};

/// OAuth2 token endpoint.
const DROPBOX_TOKEN_URL: &str = "https://api.dropbox.com/oauth2/token";

/// Refresh when fewer than this many seconds remain.
const REFRESH_MARGIN_SECS: i64 = 300;

/// OAuth2 tokens with expiration tracking.
#[derive(Clone, Serialize, Deserialize)]
pub struct Tokens {
    /// Access token for API requests.
    pub access_token: String,
    /// Refresh token for obtaining new access tokens.
    pub refresh_token: String,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now() + Duration::seconds(REFRESH_MARGIN_SECS)
    }
}

impl std::fmt::Debug for Tokens {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// App credentials for the token endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Dropbox app key.
    pub app_key: String,
    /// Dropbox app secret.
    pub app_secret: String,
    /// Token endpoint (overridable for testing).
    #[serde(default = "default_token_url")]
    pub token_url: String,
}

fn default_token_url() -> String {
    DROPBOX_TOKEN_URL.to_string()
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Build the `application/x-www-form-urlencoded` body of a refresh request.
fn refresh_form(refresh_token: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("grant_type", "refresh_token")
        .append_pair("refresh_token", refresh_token)
        .finish()
}

/// Token manager that automatically refreshes expiring tokens.
pub struct TokenManager {
    http: Client,
    config: AuthConfig,
    tokens: tokio::sync::RwLock<Tokens>,
}

impl TokenManager {
    /// Create a new token manager with initial tokens.
    pub fn new(http: Client, config: AuthConfig, tokens: Tokens) -> Self {
        Self {
            http,
            config,
            tokens: tokio::sync::RwLock::new(tokens),
        }
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// # Errors
    /// - `AuthExpired` if the refresh token was rejected
    /// - `Network` on transport failure
    pub async fn get_access_token(&self) -> Result<String> {
        let tokens = self.tokens.read().await;

        if !tokens.is_expired() {
            return Ok(tokens.access_token.clone());
        }

        drop(tokens);

        let mut tokens = self.tokens.write().await;

        // Double-check after acquiring write lock
        if !tokens.is_expired() {
            return Ok(tokens.access_token.clone());
        }

        info!("Refreshing expiring Dropbox access token");

        let refreshed = self.refresh(&tokens.refresh_token).await?;
        *tokens = refreshed;

        Ok(tokens.access_token.clone())
    }

    /// Force the next `get_access_token` to refresh.
    pub async fn invalidate(&self) {
        self.tokens.write().await.expires_at = Utc::now();
    }

    /// Get the current tokens (for persistence).
    pub async fn get_tokens(&self) -> Tokens {
        self.tokens.read().await.clone()
    }

    async fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        let response = self
            .http
            .post(&self.config.token_url)
            .basic_auth(&self.config.app_key, Some(&self.config.app_secret))
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(refresh_form(refresh_token))
            .send()
            .await
            .map_err(|e| Error::Network(format!("Token refresh request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = serde_json::from_str::<TokenErrorResponse>(&body)
                .map(|e| match e.error_description {
                    Some(desc) => format!("{}: {}", e.error, desc),
                    None => e.error,
                })
                .unwrap_or_else(|_| status.to_string());
            warn!(status = %status, "Dropbox token refresh rejected");

            return Err(if status.is_client_error() {
                Error::AuthExpired(format!("Token refresh rejected: {}", detail))
            } else {
                Error::Network(format!("Token refresh failed: {}", detail))
            });
        }

        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Network(format!("Failed to parse token response: {}", e)))?;

        Ok(Tokens {
            access_token: token.access_token,
            refresh_token: token
                .refresh_token
                .unwrap_or_else(|| refresh_token.to_string()),
            expires_at: Utc::now() + Duration::seconds(token.expires_in),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(expires_at: DateTime<Utc>) -> Tokens {
        Tokens {
            access_token: "access".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at,
        }
    }

    #[test]
    fn test_tokens_expiration() {
        assert!(tokens(Utc::now() - Duration::hours(1)).is_expired());
        assert!(!tokens(Utc::now() + Duration::hours(1)).is_expired());
    }

    #[test]
    fn test_tokens_near_expiration() {
        // Four minutes left is inside the five minute margin
        assert!(tokens(Utc::now() + Duration::minutes(4)).is_expired());
    }

    #[test]
    fn test_tokens_debug_redacted() {
        let debug = format!("{:?}", tokens(Utc::now()));
        assert!(!debug.contains("access\""));
        assert!(debug.contains("REDACTED"));
    }

    #[test]
    fn test_refresh_form_encoding() {
        let form = refresh_form("a b&c");
        assert_eq!(form, "grant_type=refresh_token&refresh_token=a+b%26c");
    }

    #[test]
    fn test_auth_config_default_token_url() {
        let config: AuthConfig =
            serde_json::from_str(r#"{"app_key":"k","app_secret":"s"}"#).unwrap();
        assert_eq!(config.token_url, DROPBOX_TOKEN_URL);
    }

    #[tokio::test]
    async fn test_valid_token_returned_without_refresh() {
        let manager = TokenManager::new(
            Client::new(),
            AuthConfig {
                app_key: "k".to_string(),
                app_secret: "s".to_string(),
                token_url: "http://127.0.0.1:9/unused".to_string(),
            },
            tokens(Utc::now() + Duration::hours(2)),
        );

        assert_eq!(manager.get_access_token().await.unwrap(), "access");
    }
}
