use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use docbroker_core::{
    BrokerError, CheckpointStore, FeedType, Result, SubscriptionStore, SyncCheckpoint,
    WebhookSubscriptionState,
};
use reqwest::{Client as HttpClient, RequestBuilder, Response, StatusCode};
use tracing::{debug, instrument, warn};

const MAX_RETRIES: u32 = 5;
const BASE_DELAY_MS: u64 = 200;

/// Cloudflare KV REST API client.
///
/// Uses the Cloudflare API v4 to interact with one KV namespace.
/// All requests use exponential backoff retry on 429 (rate limit).
pub struct KvClient {
    http_client: HttpClient,
    base_url: String,
    api_token: String,
}

impl KvClient {
    pub fn new(account_id: &str, namespace_id: &str, api_token: impl Into<String>) -> Self {
        Self::with_base_url(
            format!(
                "https://api.cloudflare.com/client/v4/accounts/{}/storage/kv/namespaces/{}",
                account_id, namespace_id
            ),
            api_token,
        )
    }

    /// Client for a namespace URL, e.g. a local emulator.
    pub fn with_base_url(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            http_client: HttpClient::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_token: api_token.into(),
        }
    }

    fn value_url(&self, key: &str) -> String {
        format!("{}/values/{}", self.base_url, urlencoding::encode(key))
    }

    /// Send a request with exponential backoff retry on 429.
    async fn send_with_retry(&self, build_request: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut delay = Duration::from_millis(BASE_DELAY_MS);
        let mut attempt = 0;

        loop {
            let response = build_request()
                .bearer_auth(&self.api_token)
                .send()
                .await
                .map_err(|e| BrokerError::Transport(format!("KV request failed: {}", e)))?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }
            if attempt == MAX_RETRIES {
                let text = response.text().await.unwrap_or_default();
                return Err(BrokerError::Transport(format!(
                    "KV rate limited after {} retries: {}",
                    MAX_RETRIES, text
                )));
            }

            warn!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "KV rate limited (429), retrying"
            );
            tokio::time::sleep(delay).await;
            delay *= 2;
            attempt += 1;
        }
    }

    async fn failure(operation: &str, response: Response) -> BrokerError {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let detail = format!("KV {} failed with status {}: {}", operation, status, text);
        match status {
            StatusCode::UNAUTHORIZED => BrokerError::Unauthorized(detail),
            StatusCode::FORBIDDEN => BrokerError::Forbidden(detail),
            _ => BrokerError::Transport(detail),
        }
    }

    /// Get a value from KV.
    #[instrument(skip(self), level = "debug")]
    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let url = self.value_url(key);
        let response = self.send_with_retry(|| self.http_client.get(&url)).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            debug!("KV key not found: {}", key);
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Self::failure("GET", response).await);
        }

        let value = response
            .text()
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to read KV response: {}", e)))?;
        debug!("KV GET {} ({} bytes)", key, value.len());
        Ok(Some(value))
    }

    /// Put a value to KV.
    #[instrument(skip(self, value), level = "debug", fields(value_len = value.len()))]
    pub async fn put(&self, key: &str, value: &str) -> Result<()> {
        let url = self.value_url(key);
        let response = self
            .send_with_retry(|| {
                self.http_client
                    .put(&url)
                    .header("Content-Type", "text/plain")
                    .body(value.to_string())
            })
            .await?;

        if !response.status().is_success() {
            return Err(Self::failure("PUT", response).await);
        }
        debug!("KV PUT {} ({} bytes)", key, value.len());
        Ok(())
    }

    /// Delete a value from KV.
    #[instrument(skip(self), level = "debug")]
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let url = self.value_url(key);
        let response = self.send_with_retry(|| self.http_client.delete(&url)).await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !status.is_success() {
            return Err(Self::failure("DELETE", response).await);
        }
        debug!("KV DELETE {}", key);
        Ok(true)
    }
}

fn checkpoint_key(feed: FeedType) -> String {
    format!("checkpoint:{}", feed)
}

fn subscription_key(container_id: &str) -> String {
    format!("subscription:{}", container_id.to_lowercase())
}

/// Per-feed checkpoints in KV, stored as `{"lastRun": ..., "tokens": "k=v;k2=v2"}`.
pub struct KvCheckpointStore {
    kv: Arc<KvClient>,
}

impl KvCheckpointStore {
    pub fn new(kv: Arc<KvClient>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl CheckpointStore for KvCheckpointStore {
    async fn load(&self, feed: FeedType) -> Result<SyncCheckpoint> {
        match self.kv.get(&checkpoint_key(feed)).await? {
            Some(value) => Ok(serde_json::from_str(&value)?),
            None => Ok(SyncCheckpoint::default()),
        }
    }

    async fn save(&self, feed: FeedType, checkpoint: &SyncCheckpoint) -> Result<()> {
        let value = serde_json::to_string(checkpoint)?;
        self.kv.put(&checkpoint_key(feed), &value).await
    }
}

/// Webhook subscription state per monitored list, in KV.
pub struct KvSubscriptionStore {
    kv: Arc<KvClient>,
}

impl KvSubscriptionStore {
    pub fn new(kv: Arc<KvClient>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl SubscriptionStore for KvSubscriptionStore {
    async fn load(&self, container_id: &str) -> Result<Option<WebhookSubscriptionState>> {
        match self.kv.get(&subscription_key(container_id)).await? {
            Some(value) => Ok(Some(serde_json::from_str(&value)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, state: &WebhookSubscriptionState) -> Result<()> {
        let value = serde_json::to_string(state)?;
        self.kv
            .put(&subscription_key(&state.container_id), &value)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> Arc<KvClient> {
        Arc::new(KvClient::with_base_url(
            format!("{}/accounts/a/storage/kv/namespaces/n", server.uri()),
            "kv-token",
        ))
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_default() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let store = KvCheckpointStore::new(client(&server));
        assert_eq!(
            store.load(FeedType::New).await.unwrap(),
            SyncCheckpoint::default()
        );
    }

    #[tokio::test]
    async fn test_checkpoint_is_read_from_kv() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/a/storage/kv/namespaces/n/values/checkpoint%3Aupdated"))
            .and(header("authorization", "Bearer kv-token"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"lastRun":"2024-06-01T12:00:00Z","tokens":"driveA=abc;driveB=x=="}"#,
            ))
            .mount(&server)
            .await;

        let store = KvCheckpointStore::new(client(&server));
        let checkpoint = store.load(FeedType::Updated).await.unwrap();
        assert_eq!(
            checkpoint.last_run,
            Some(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(checkpoint.tokens.get("driveB"), Some("x=="));
    }

    #[tokio::test]
    async fn test_checkpoint_save_writes_token_map() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/accounts/a/storage/kv/namespaces/n/values/checkpoint%3Adeleted"))
            .and(body_string_contains(r#""tokens":"driveA=t1""#))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true
            })))
            .expect(1)
            .mount(&server)
            .await;

        let store = KvCheckpointStore::new(client(&server));
        let mut checkpoint = SyncCheckpoint::default();
        checkpoint.tokens.insert("driveA", "t1");
        store.save(FeedType::Deleted, &checkpoint).await.unwrap();
    }

    #[tokio::test]
    async fn test_rate_limit_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"containerId":"list-1","subscriptionId":"sub-1","lastChangeToken":"1;3;x;5;-1"}"#,
            ))
            .mount(&server)
            .await;

        let store = KvSubscriptionStore::new(client(&server));
        let state = store.load("LIST-1").await.unwrap().unwrap();
        assert_eq!(state.subscription_id, "sub-1");
        assert_eq!(state.last_change_token, "1;3;x;5;-1");
        assert_eq!(state.expiration_date_time, None);
    }

    #[tokio::test]
    async fn test_forbidden_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(403).set_body_string("no access"))
            .mount(&server)
            .await;

        let kv = client(&server);
        assert!(matches!(
            kv.delete("k").await,
            Err(BrokerError::Forbidden(_))
        ));
    }

    #[test]
    fn test_keys() {
        assert_eq!(checkpoint_key(FeedType::New), "checkpoint:new");
        assert_eq!(subscription_key("List-1"), "subscription:list-1");
    }
}
