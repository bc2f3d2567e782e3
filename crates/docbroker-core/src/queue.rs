use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One change notification as pushed by the repository's webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeNotification {
    pub subscription_id: String,
    #[serde(default)]
    pub client_state: Option<String>,
    pub expiration_date_time: DateTime<Utc>,
    /// Id of the list the change happened in.
    pub resource: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Server-relative URL of the site, e.g. `/sites/records`.
    #[serde(default)]
    pub site_url: Option<String>,
    #[serde(default)]
    pub web_id: Option<String>,
}

/// The body of one webhook push.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NotificationBatch {
    pub value: Vec<ChangeNotification>,
}

/// A batch received from the queue, with the receipt needed to acknowledge it.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub receipt: String,
    pub enqueued_at: DateTime<Utc>,
    /// Times the message was handed out by `receive`, this delivery included.
    pub deliveries: u32,
    pub batch: NotificationBatch,
}

/// Durable buffer between webhook intake and notification processing.
///
/// Delivery is at-least-once: a received message stays on the queue until acknowledged or
/// dead-lettered.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Enqueue a batch and return its message id.
    async fn enqueue(&self, batch: &NotificationBatch) -> Result<String>;

    /// Oldest-first messages, at most `max`. Each call counts as one delivery of every
    /// returned message.
    async fn receive(&self, max: usize) -> Result<Vec<QueuedMessage>>;

    async fn ack(&self, receipt: &str) -> Result<()>;

    /// Take a message that keeps failing off the queue, keeping it aside for inspection.
    async fn dead_letter(&self, receipt: &str) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_webhook_payload() {
        let body = r#"{
            "value": [{
                "subscriptionId": "91779246-afe9-4525-b122-6c199ae89211",
                "clientState": "00000000-0000-0000-0000-000000000000",
                "expirationDateTime": "2024-04-30T17:27:00.0000000Z",
                "resource": "b9f6f714-9df8-470b-b22e-653855e1c181",
                "tenantId": "00000000-0000-0000-0000-000000000000",
                "siteUrl": "/sites/records",
                "webId": "a0a1b2c3-0000-0000-0000-000000000000"
            }]
        }"#;
        let batch: NotificationBatch = serde_json::from_str(body).unwrap();
        assert_eq!(batch.value.len(), 1);
        assert_eq!(batch.value[0].resource, "b9f6f714-9df8-470b-b22e-653855e1c181");
        assert_eq!(batch.value[0].site_url.as_deref(), Some("/sites/records"));
    }
}
