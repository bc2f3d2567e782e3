//! App-only OAuth token manager for Microsoft Graph and SharePoint.
//!
//! Acquires tokens with the client-credentials grant, caches them per scope in-memory and
//! re-acquires them shortly before they expire.

use dashmap::DashMap;
use serde::Deserialize;
use tracing::{debug, info};

/// Cached token with expiration.
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
}

impl CachedToken {
    fn is_expired(&self) -> bool {
        chrono::Utc::now() >= self.expires_at - chrono::Duration::minutes(5)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Manages app-only tokens per scope with caching and automatic renewal.
pub struct TokenManager {
    http: reqwest::Client,
    authority_url: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    cache: DashMap<String, CachedToken>,
}

impl TokenManager {
    pub fn new(
        http: reqwest::Client,
        authority_url: impl Into<String>,
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            authority_url: authority_url.into().trim_end_matches('/').to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cache: DashMap::new(),
        }
    }

    /// Get a valid access token for a resource scope, e.g. `https://graph.microsoft.com/.default`.
    pub async fn get_token(&self, scope: &str) -> anyhow::Result<String> {
        if let Some(cached) = self.cache.get(scope) {
            if !cached.is_expired() {
                debug!("Token cache hit for {}", scope);
                return Ok(cached.access_token.clone());
            }
            debug!("Token for {} expired, acquiring a new one", scope);
        }

        let url = format!(
            "{}/{}/oauth2/v2.0/token",
            self.authority_url, self.tenant_id
        );
        let resp = self
            .http
            .post(&url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("scope", scope),
                ("grant_type", "client_credentials"),
            ])
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Token request for {} failed: {} {}", scope, status, body);
        }

        let token: TokenResponse = resp.json().await?;
        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(token.expires_in);
        self.cache.insert(
            scope.to_string(),
            CachedToken {
                access_token: token.access_token.clone(),
                expires_at,
            },
        );

        info!("Acquired token for {}, expires at {}", scope, expires_at);
        Ok(token.access_token)
    }

    /// Drop a cached token, e.g. after the resource rejected it.
    pub fn invalidate(&self, scope: &str) {
        self.cache.remove(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_token_is_cached_per_scope() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/tenant-1/oauth2/v2.0/token"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "token_type": "Bearer",
                "expires_in": 3600,
                "access_token": "token-abc"
            })))
            .expect(2)
            .mount(&server)
            .await;

        let manager = TokenManager::new(
            reqwest::Client::new(),
            server.uri(),
            "tenant-1",
            "client",
            "secret",
        );
        let graph = "https://graph.microsoft.com/.default";
        assert_eq!(manager.get_token(graph).await.unwrap(), "token-abc");
        assert_eq!(manager.get_token(graph).await.unwrap(), "token-abc");
        // Another scope needs its own token.
        manager
            .get_token("https://contoso.sharepoint.com/.default")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_token_failure_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
            .mount(&server)
            .await;

        let manager =
            TokenManager::new(reqwest::Client::new(), server.uri(), "t", "c", "wrong");
        let err = manager
            .get_token("https://graph.microsoft.com/.default")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("invalid_client"));
    }

    #[test]
    fn test_expiry_margin() {
        let soon = CachedToken {
            access_token: "t".into(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(2),
        };
        assert!(soon.is_expired());
        let later = CachedToken {
            access_token: "t".into(),
            expires_at: chrono::Utc::now() + chrono::Duration::minutes(30),
        };
        assert!(!later.is_expired());
    }
}
