//! Outbound sinks owned by the server: third-party callbacks, and log-only fallbacks used when
//! no callback endpoint or mail sender is configured.

use std::time::Duration;

use async_trait::async_trait;
use docbroker_core::{
    AuthorNotice, AuthorNotifier, BrokerError, CallbackEvent, CallbackSink, Result,
};
use tracing::{debug, info, instrument};

/// Announces changes to the third party:
/// `POST {base}/{create|update}/{objectId}` with the public metadata as JSON body, and
/// `GET {base}/delete/{objectId}`.
pub struct HttpCallbackSink {
    http: reqwest::Client,
    base_url: String,
}

impl HttpCallbackSink {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BrokerError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, event: &CallbackEvent) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            event.action(),
            urlencoding::encode(event.object_id())
        )
    }
}

#[async_trait]
impl CallbackSink for HttpCallbackSink {
    #[instrument(skip(self, event), level = "debug", fields(action = event.action(), object_id = event.object_id()))]
    async fn send(&self, event: &CallbackEvent) -> Result<()> {
        let url = self.url(event);
        let request = match event {
            CallbackEvent::Create { body, .. } | CallbackEvent::Update { body, .. } => {
                self.http.post(&url).json(body)
            }
            CallbackEvent::Delete { .. } => self.http.get(&url),
        };

        let response = request
            .send()
            .await
            .map_err(|e| BrokerError::Transport(format!("Callback request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(BrokerError::Transport(format!(
                "Callback {} returned {}: {}",
                url, status, text
            )));
        }

        debug!("Callback {} delivered", url);
        Ok(())
    }
}

/// Callback sink for deployments without a third party.
pub struct LogCallbackSink;

#[async_trait]
impl CallbackSink for LogCallbackSink {
    async fn send(&self, event: &CallbackEvent) -> Result<()> {
        info!("Callback {} for {} (no endpoint configured)", event.action(), event.object_id());
        Ok(())
    }
}

/// Author notifier that only logs.
pub struct LogNotifier;

#[async_trait]
impl AuthorNotifier for LogNotifier {
    async fn notify(&self, notice: &AuthorNotice) -> Result<()> {
        info!(
            recipient = %notice.recipient,
            object_id = %notice.object_id,
            succeeded = notice.succeeded,
            "{}",
            notice.message
        );
        Ok(())
    }
}
