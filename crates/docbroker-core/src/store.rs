use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::{NaturalKey, ObjectIdentifiers, StorageKey};

/// Outcome of a create-only identity insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Inserted,
    /// The natural key was already registered; carries the stored record.
    Existing(ObjectIdentifiers),
}

/// Table of identity records, one per object, indexed by object id, natural key and storage pair.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn get_by_object_id(&self, object_id: &str) -> Result<Option<ObjectIdentifiers>>;

    async fn get_by_natural_key(&self, key: &NaturalKey) -> Result<Option<ObjectIdentifiers>>;

    async fn get_by_storage_key(&self, key: &StorageKey) -> Result<Option<ObjectIdentifiers>>;

    /// Create a record under all of its keys unless its natural key is already registered.
    async fn insert(&self, ids: &ObjectIdentifiers) -> Result<InsertOutcome>;

    /// Overwrite a record under all of its keys.
    async fn upsert(&self, ids: &ObjectIdentifiers) -> Result<()>;

    /// Remove the given natural-key and storage-key rows where they still point at `object_id`.
    /// The by-id row is kept.
    async fn delete_keys(
        &self,
        object_id: &str,
        natural: Option<&NaturalKey>,
        storage: Option<&StorageKey>,
    ) -> Result<()>;

    async fn delete(&self, ids: &ObjectIdentifiers) -> Result<()>;
}

/// The shared object-id sequence.
///
/// Implementations must make the increment atomic with respect to other processes (compare-and-
/// swap or lease); two callers never observe the same value.
#[async_trait]
pub trait SequenceCounter: Send + Sync {
    /// Increment and return the new value.
    async fn increment(&self) -> Result<u64>;

    /// Current value without incrementing.
    async fn current(&self) -> Result<u64>;
}

/// A document whose export is deferred until its publication date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicationQueueEntry {
    pub object_id: String,
    pub publication_date: DateTime<Utc>,
}

#[async_trait]
pub trait PublicationStore: Send + Sync {
    /// Insert or replace the entry of an object.
    async fn put(&self, entry: &PublicationQueueEntry) -> Result<()>;

    /// Remove the entry of an object. Returns whether one existed.
    async fn remove(&self, object_id: &str) -> Result<bool>;

    async fn list(&self) -> Result<Vec<PublicationQueueEntry>>;
}

/// Push subscription and change-token cursor of one monitored container.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookSubscriptionState {
    pub container_id: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default)]
    pub expiration_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_change_token: String,
}

impl WebhookSubscriptionState {
    pub fn new(container_id: impl Into<String>) -> Self {
        Self {
            container_id: container_id.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn load(&self, container_id: &str) -> Result<Option<WebhookSubscriptionState>>;

    async fn save(&self, state: &WebhookSubscriptionState) -> Result<()>;
}
