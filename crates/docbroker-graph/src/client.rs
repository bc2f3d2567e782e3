use std::sync::Arc;
use std::time::Duration;

use docbroker_core::{BrokerError, Result};
use reqwest::header::RETRY_AFTER;
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::token_manager::TokenManager;

/// Scope of app-only Graph tokens.
pub const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

/// Connection settings for Graph and SharePoint REST.
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Graph API root, e.g. `https://graph.microsoft.com/v1.0`.
    pub graph_base_url: String,
    /// Identity platform root, e.g. `https://login.microsoftonline.com`.
    pub authority_url: String,
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: String,
    /// Shared secret echoed back by the repository in webhook notifications.
    pub client_state: Option<String>,
    pub timeout: Duration,
    /// Retries of throttled (429) or unavailable (503/504) responses.
    pub max_retries: u32,
}

impl GraphConfig {
    pub fn new(
        tenant_id: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            graph_base_url: "https://graph.microsoft.com/v1.0".to_string(),
            authority_url: "https://login.microsoftonline.com".to_string(),
            tenant_id: tenant_id.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            client_state: None,
            timeout: Duration::from_secs(60),
            max_retries: 3,
        }
    }
}

/// Authenticated HTTP access to Graph and SharePoint REST, shared by the repository adapter and
/// the mail notifier.
pub struct GraphClient {
    http: reqwest::Client,
    tokens: TokenManager,
    config: GraphConfig,
}

impl GraphClient {
    pub fn new(config: GraphConfig) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| BrokerError::Config(format!("Failed to build HTTP client: {}", e)))?;
        let tokens = TokenManager::new(
            http.clone(),
            &config.authority_url,
            &config.tenant_id,
            &config.client_id,
            &config.client_secret,
        );
        Ok(Arc::new(Self {
            http,
            tokens,
            config,
        }))
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub(crate) fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Absolute Graph URL of a path such as `/drives/{id}`.
    pub(crate) fn graph_url(&self, path: &str) -> String {
        format!("{}{}", self.config.graph_base_url.trim_end_matches('/'), path)
    }

    /// Send a request with a bearer token for `scope`.
    ///
    /// Returns `None` on 404. Throttling is retried with `Retry-After` or exponential backoff;
    /// every other failure is mapped onto the broker error taxonomy.
    pub(crate) async fn send(&self, scope: &str, request: RequestBuilder) -> Result<Option<Response>> {
        let token = self
            .tokens
            .get_token(scope)
            .await
            .map_err(|e| BrokerError::Unauthorized(format!("{:#}", e)))?;
        let request = request.bearer_auth(token).build().map_err(transport)?;

        let mut attempt = 0;
        loop {
            let attempt_request = request.try_clone().ok_or_else(|| {
                BrokerError::Transport("request body cannot be replayed".to_string())
            })?;
            let resp = self.http.execute(attempt_request).await.map_err(transport)?;
            let status = resp.status();

            if status == StatusCode::NOT_FOUND {
                debug!("{} {} -> 404", request.method(), request.url());
                return Ok(None);
            }
            if is_throttled(status) && attempt < self.config.max_retries {
                let delay = retry_after(&resp).unwrap_or_else(|| backoff(attempt));
                warn!(
                    "{} {} throttled ({}), retrying in {:?}",
                    request.method(),
                    request.url(),
                    status,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            if status == StatusCode::UNAUTHORIZED {
                self.tokens.invalidate(scope);
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(status_error(status, &body));
            }
            return Ok(Some(resp));
        }
    }

    /// `send` followed by JSON decoding of the body.
    pub(crate) async fn send_json<T: DeserializeOwned>(
        &self,
        scope: &str,
        request: RequestBuilder,
    ) -> Result<Option<T>> {
        match self.send(scope, request).await? {
            Some(resp) => Ok(Some(read_json(resp).await?)),
            None => Ok(None),
        }
    }
}

pub(crate) async fn read_json<T: DeserializeOwned>(resp: Response) -> Result<T> {
    let bytes = resp.bytes().await.map_err(transport)?;
    Ok(serde_json::from_slice(&bytes)?)
}

pub(crate) fn transport(e: reqwest::Error) -> BrokerError {
    BrokerError::Transport(e.to_string())
}

/// Token scope of a SharePoint site, e.g. `https://contoso.sharepoint.com/.default`.
pub(crate) fn sharepoint_scope(site_url: &str) -> Result<String> {
    let url = Url::parse(site_url)
        .map_err(|e| BrokerError::Config(format!("Invalid site URL {}: {}", site_url, e)))?;
    Ok(format!("{}/.default", url.origin().ascii_serialization()))
}

fn is_throttled(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    )
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs.min(60)))
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(500 * 2u64.pow(attempt))
}

/// SharePoint answers a stale or out-of-range change token with an
/// `ArgumentOutOfRangeException` (code -2146233086).
fn is_invalid_change_token(body: &str) -> bool {
    body.contains("-2146233086")
        || body.contains("ArgumentOutOfRangeException")
        || body.to_ascii_lowercase().contains("change token")
}

pub(crate) fn status_error(status: StatusCode, body: &str) -> BrokerError {
    let detail = format!("{} {}", status, body);
    match status {
        StatusCode::UNAUTHORIZED => BrokerError::Unauthorized(detail),
        StatusCode::FORBIDDEN => BrokerError::Forbidden(detail),
        // Graph expires delta tokens with 410 Gone ("resyncRequired").
        StatusCode::GONE => BrokerError::InvalidToken(detail),
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => BrokerError::Conflict(detail),
        _ if is_invalid_change_token(body) => BrokerError::InvalidToken(detail),
        _ => BrokerError::Transport(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, "accessDenied"),
            BrokerError::Forbidden(_)
        ));
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, ""),
            BrokerError::Unauthorized(_)
        ));
        assert!(matches!(
            status_error(StatusCode::GONE, "resyncRequired"),
            BrokerError::InvalidToken(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_GATEWAY, "upstream"),
            BrokerError::Transport(_)
        ));
    }

    #[test]
    fn test_stale_change_token_is_recognized() {
        let body = r#"{"odata.error":{"code":"-2146233086, System.ArgumentOutOfRangeException","message":{"lang":"en-US","value":"Specified argument was out of the range of valid values."}}}"#;
        assert!(matches!(
            status_error(StatusCode::INTERNAL_SERVER_ERROR, body),
            BrokerError::InvalidToken(_)
        ));
        assert!(matches!(
            status_error(StatusCode::BAD_REQUEST, "The change token is invalid"),
            BrokerError::InvalidToken(_)
        ));
    }

    #[test]
    fn test_sharepoint_scope() {
        assert_eq!(
            sharepoint_scope("https://contoso.sharepoint.com/sites/records").unwrap(),
            "https://contoso.sharepoint.com/.default"
        );
        assert!(matches!(
            sharepoint_scope("/sites/records"),
            Err(BrokerError::Config(_))
        ));
    }

    #[test]
    fn test_backoff_grows() {
        assert_eq!(backoff(0), Duration::from_millis(500));
        assert_eq!(backoff(2), Duration::from_secs(2));
    }
}
