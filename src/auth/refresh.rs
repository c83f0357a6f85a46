//! OAuth refresh-token exchange.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{CredentialError, Role};

/// Tokens returned by a successful refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    /// New bearer token.
    pub access_token: String,
    /// Rotated refresh token, if the provider issued one.
    pub refresh_token: Option<String>,
    /// Lifetime of `access_token` in seconds.
    pub expires_in: Option<i64>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "[REDACTED]"))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Exchanges a refresh token for a new access token.
///
/// Invoked on demand by [`super::CredentialManager`]; persistence is the
/// manager's job, not the refresher's.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Performs the exchange for `role`.
    async fn refresh(&self, role: Role, refresh_token: &str) -> Result<TokenGrant, CredentialError>;
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// `grant_type=refresh_token` exchange against an OAuth token endpoint.
#[derive(Clone)]
pub struct OAuthRefresher {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl std::fmt::Debug for OAuthRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuthRefresher")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .finish_non_exhaustive()
    }
}

impl OAuthRefresher {
    /// Creates a refresher posting to `token_url` with the given client pair.
    #[must_use]
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    #[instrument(skip(self, refresh_token), fields(role = %role))]
    async fn refresh(&self, role: Role, refresh_token: &str) -> Result<TokenGrant, CredentialError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| CredentialError::refresh_failed(role, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(CredentialError::refresh_failed(
                role,
                format!("token endpoint returned {status}: {snippet}"),
            ));
        }

        let parsed: TokenResponse = response
            .json()
            .await
            .map_err(|e| CredentialError::refresh_failed(role, format!("bad token response: {e}")))?;
        debug!(expires_in = ?parsed.expires_in, rotated = parsed.refresh_token.is_some(), "token refreshed");

        Ok(TokenGrant {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_in: parsed.expires_in,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn test_refresh_posts_form_and_parses_grant() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let refresher = OAuthRefresher::new(
            reqwest::Client::new(),
            format!("{}/token", server.uri()),
            "cid",
            "secret",
        );
        let grant = refresher.refresh(Role::Upload, "r1").await.unwrap();

        assert_eq!(grant.access_token, "fresh");
        assert_eq!(grant.expires_in, Some(3599));
        assert!(grant.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_refresh_rejected_maps_to_refresh_failed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("invalid_grant"))
            .mount(&server)
            .await;

        let refresher =
            OAuthRefresher::new(reqwest::Client::new(), server.uri(), "cid", "secret");
        let err = refresher.refresh(Role::Download, "dead").await.unwrap_err();

        assert!(matches!(err, CredentialError::RefreshFailed { role: Role::Download, .. }));
        assert!(err.to_string().contains("invalid_grant"));
    }

    #[test]
    fn test_token_grant_debug_redacts_tokens() {
        let grant = TokenGrant {
            access_token: "secret-a".to_string(),
            refresh_token: Some("secret-r".to_string()),
            expires_in: Some(10),
        };
        let debug = format!("{grant:?}");
        assert!(!debug.contains("secret-a"));
        assert!(!debug.contains("secret-r"));
    }
}
