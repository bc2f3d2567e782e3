use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use docbroker_core::{NotificationBatch, NotificationQueue, QueuedMessage, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::r2::{PutOptions, R2Bucket};

const QUEUE_PREFIX: &str = "queue/";
const DEAD_LETTER_PREFIX: &str = "queue-dead/";

/// Stored form of a queued batch. `deliveries` is rewritten on every receive.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    #[serde(default)]
    deliveries: u32,
    #[serde(flatten)]
    batch: NotificationBatch,
}

/// Durable notification queue: one R2 object per batch, named so that listing order is enqueue
/// order (`queue/{millis:020}-{uuid}.json`). The object key is the receipt.
///
/// Messages stay visible until acknowledged or dead-lettered into `queue-dead/`; a single worker
/// drains the queue.
pub struct R2NotificationQueue {
    bucket: R2Bucket,
}

impl R2NotificationQueue {
    pub fn new(bucket: R2Bucket) -> Self {
        Self { bucket }
    }

    async fn move_to_dead_letters(&self, key: &str, data: &[u8]) -> Result<()> {
        self.bucket
            .put_object(&dead_letter_key(key), data, json_options())
            .await?;
        self.bucket.delete_object(key).await
    }
}

fn json_options() -> PutOptions<'static> {
    PutOptions {
        content_type: Some("application/json"),
        metadata: None,
    }
}

fn message_key(enqueued_at: DateTime<Utc>, id: &uuid::Uuid) -> String {
    format!(
        "{}{:020}-{}.json",
        QUEUE_PREFIX,
        enqueued_at.timestamp_millis().max(0),
        id
    )
}

fn dead_letter_key(key: &str) -> String {
    format!(
        "{}{}",
        DEAD_LETTER_PREFIX,
        key.strip_prefix(QUEUE_PREFIX).unwrap_or(key)
    )
}

fn enqueued_at(key: &str) -> Option<DateTime<Utc>> {
    let millis = key.strip_prefix(QUEUE_PREFIX)?.split('-').next()?;
    Utc.timestamp_millis_opt(millis.parse().ok()?).single()
}

#[async_trait]
impl NotificationQueue for R2NotificationQueue {
    #[instrument(skip(self, batch), level = "debug", fields(notifications = batch.value.len()))]
    async fn enqueue(&self, batch: &NotificationBatch) -> Result<String> {
        let key = message_key(Utc::now(), &uuid::Uuid::new_v4());
        let data = serde_json::to_vec(&StoredMessage {
            deliveries: 0,
            batch: batch.clone(),
        })?;
        self.bucket.put_object(&key, &data, json_options()).await?;
        debug!("Enqueued {}", key);
        Ok(key)
    }

    #[instrument(skip(self), level = "debug")]
    async fn receive(&self, max: usize) -> Result<Vec<QueuedMessage>> {
        let keys = self.bucket.list_objects(QUEUE_PREFIX, Some(max)).await?;
        let mut messages = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(data) = self.bucket.get_object(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<StoredMessage>(&data) {
                Ok(mut stored) => {
                    stored.deliveries += 1;
                    self.bucket
                        .put_object(&key, &serde_json::to_vec(&stored)?, json_options())
                        .await?;
                    messages.push(QueuedMessage {
                        enqueued_at: enqueued_at(&key).unwrap_or_else(Utc::now),
                        receipt: key,
                        deliveries: stored.deliveries,
                        batch: stored.batch,
                    });
                }
                Err(e) => {
                    // Poison message: set it aside instead of blocking the queue head.
                    warn!("Dead-lettering unreadable queue message {}: {}", key, e);
                    self.move_to_dead_letters(&key, &data).await?;
                }
            }
        }
        Ok(messages)
    }

    #[instrument(skip(self), level = "debug")]
    async fn ack(&self, receipt: &str) -> Result<()> {
        self.bucket.delete_object(receipt).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn dead_letter(&self, receipt: &str) -> Result<()> {
        match self.bucket.get_object(receipt).await? {
            Some(data) => self.move_to_dead_letters(receipt, &data).await,
            None => Ok(()),
        }
    }
}
