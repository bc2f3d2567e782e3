//! Identity records, the object-id sequence and deferred-publication entries as JSON rows in R2.
//!
//! Layout:
//! ```text
//! identity/
//!   by-id/{object_id}.json           # record
//!   by-key/{sha256(natural)}.json    # record, created with If-None-Match: *
//!   by-storage/{sha256(pair)}.json   # record
//!   sequence.json                    # {"value": n}, updated with If-Match
//! publication/
//!   {object_id}.json                 # PublicationQueueEntry
//! ```

use async_trait::async_trait;
use docbroker_core::{
    BrokerError, IdentityStore, InsertOutcome, NaturalKey, ObjectIdentifiers,
    PublicationQueueEntry, PublicationStore, Result, SequenceCounter, StorageKey,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::r2::{PutOptions, R2Bucket, CAS_MAX_RETRIES};

fn hashed(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

fn by_id_key(object_id: &str) -> String {
    format!("identity/by-id/{}.json", urlencoding::encode(object_id))
}

fn by_natural_key(key: &NaturalKey) -> String {
    format!("identity/by-key/{}.json", hashed(key.as_str()))
}

fn by_storage_key(key: &StorageKey) -> String {
    format!("identity/by-storage/{}.json", hashed(key.as_str()))
}

const SEQUENCE_KEY: &str = "identity/sequence.json";

const PUBLICATION_PREFIX: &str = "publication/";

fn publication_key(object_id: &str) -> String {
    format!("{}{}.json", PUBLICATION_PREFIX, urlencoding::encode(object_id))
}

fn json_options() -> PutOptions<'static> {
    PutOptions {
        content_type: Some("application/json"),
        metadata: None,
    }
}

async fn read_row<T: for<'de> Deserialize<'de>>(bucket: &R2Bucket, key: &str) -> Result<Option<T>> {
    match bucket.get_object(key).await? {
        Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
        None => Ok(None),
    }
}

/// Identity table over R2.
///
/// The natural-key row is the create-only claim: whoever writes it first owns the document.
pub struct R2IdentityStore {
    bucket: R2Bucket,
}

impl R2IdentityStore {
    pub fn new(bucket: R2Bucket) -> Self {
        Self { bucket }
    }

    async fn write_indexes(&self, ids: &ObjectIdentifiers, data: &[u8]) -> Result<()> {
        self.bucket
            .put_object(&by_id_key(&ids.object_id), data, json_options())
            .await?;
        if let Some(key) = ids.storage_key() {
            self.bucket
                .put_object(&by_storage_key(&key), data, json_options())
                .await?;
        }
        Ok(())
    }

    /// Delete an index row only if it still belongs to `object_id`.
    async fn delete_owned(&self, key: &str, object_id: &str) -> Result<()> {
        if let Some(row) = read_row::<ObjectIdentifiers>(&self.bucket, key).await? {
            if row.object_id == object_id {
                self.bucket.delete_object(key).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityStore for R2IdentityStore {
    #[instrument(skip(self), level = "debug")]
    async fn get_by_object_id(&self, object_id: &str) -> Result<Option<ObjectIdentifiers>> {
        read_row(&self.bucket, &by_id_key(object_id)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_by_natural_key(&self, key: &NaturalKey) -> Result<Option<ObjectIdentifiers>> {
        read_row(&self.bucket, &by_natural_key(key)).await
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_by_storage_key(&self, key: &StorageKey) -> Result<Option<ObjectIdentifiers>> {
        read_row(&self.bucket, &by_storage_key(key)).await
    }

    #[instrument(skip(self, ids), fields(object_id = %ids.object_id), level = "debug")]
    async fn insert(&self, ids: &ObjectIdentifiers) -> Result<InsertOutcome> {
        let natural = ids.natural_key().ok_or_else(|| {
            BrokerError::InvalidInput("identity record without repository triple".to_string())
        })?;
        let key = by_natural_key(&natural);
        let data = serde_json::to_vec(ids)?;

        match self.bucket.put_object_conditional(&key, &data, None).await {
            Ok(_) => {
                self.write_indexes(ids, &data).await?;
                debug!("Inserted identity {}", ids.object_id);
                Ok(InsertOutcome::Inserted)
            }
            Err(BrokerError::Conflict(_)) => {
                let winner = read_row::<ObjectIdentifiers>(&self.bucket, &key)
                    .await?
                    .ok_or_else(|| {
                        BrokerError::DataIntegrity(format!(
                            "natural key {} claimed but unreadable",
                            natural
                        ))
                    })?;
                Ok(InsertOutcome::Existing(winner))
            }
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self, ids), fields(object_id = %ids.object_id), level = "debug")]
    async fn upsert(&self, ids: &ObjectIdentifiers) -> Result<()> {
        let data = serde_json::to_vec(ids)?;
        if let Some(natural) = ids.natural_key() {
            self.bucket
                .put_object(&by_natural_key(&natural), &data, json_options())
                .await?;
        }
        self.write_indexes(ids, &data).await
    }

    #[instrument(skip(self, natural, storage), level = "debug")]
    async fn delete_keys(
        &self,
        object_id: &str,
        natural: Option<&NaturalKey>,
        storage: Option<&StorageKey>,
    ) -> Result<()> {
        if let Some(natural) = natural {
            self.delete_owned(&by_natural_key(natural), object_id).await?;
        }
        if let Some(storage) = storage {
            self.delete_owned(&by_storage_key(storage), object_id).await?;
        }
        Ok(())
    }

    #[instrument(skip(self, ids), fields(object_id = %ids.object_id), level = "debug")]
    async fn delete(&self, ids: &ObjectIdentifiers) -> Result<()> {
        self.delete_keys(
            &ids.object_id,
            ids.natural_key().as_ref(),
            ids.storage_key().as_ref(),
        )
        .await?;
        self.bucket.delete_object(&by_id_key(&ids.object_id)).await
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SequenceRow {
    value: u64,
}

/// Object-id sequence over R2, incremented with ETag compare-and-swap.
pub struct R2SequenceCounter {
    bucket: R2Bucket,
}

impl R2SequenceCounter {
    pub fn new(bucket: R2Bucket) -> Self {
        Self { bucket }
    }
}

#[async_trait]
impl SequenceCounter for R2SequenceCounter {
    /// 1. GET the row with its ETag
    /// 2. PUT value + 1 with If-Match (or If-None-Match: * for the first id)
    /// 3. On 412, retry from step 1 (up to `CAS_MAX_RETRIES`)
    #[instrument(skip(self), level = "debug")]
    async fn increment(&self) -> Result<u64> {
        for attempt in 0..CAS_MAX_RETRIES {
            let (current, etag) = match self.bucket.get_object_with_etag(SEQUENCE_KEY).await? {
                Some((data, etag)) => (serde_json::from_slice::<SequenceRow>(&data)?, Some(etag)),
                None => (SequenceRow::default(), None),
            };
            let next = SequenceRow {
                value: current.value + 1,
            };
            let data = serde_json::to_vec(&next)?;

            match self
                .bucket
                .put_object_conditional(SEQUENCE_KEY, &data, etag.as_deref())
                .await
            {
                Ok(_) => {
                    debug!(attempt, value = next.value, "Sequence incremented");
                    return Ok(next.value);
                }
                Err(BrokerError::Conflict(_)) => {
                    warn!(attempt, "Sequence conflict (412), retrying");
                    self.bucket.backoff_sleep(attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(BrokerError::Conflict(format!(
            "sequence increment exhausted {} retries",
            CAS_MAX_RETRIES
        )))
    }

    async fn current(&self) -> Result<u64> {
        Ok(read_row::<SequenceRow>(&self.bucket, SEQUENCE_KEY)
            .await?
            .unwrap_or_default()
            .value)
    }
}

/// Deferred-publication entries, one object per document.
pub struct R2PublicationStore {
    bucket: R2Bucket,
}

impl R2PublicationStore {
    pub fn new(bucket: R2Bucket) -> Self {
        Self { bucket }
    }
}

#[async_trait]
impl PublicationStore for R2PublicationStore {
    #[instrument(skip(self, entry), fields(object_id = %entry.object_id), level = "debug")]
    async fn put(&self, entry: &PublicationQueueEntry) -> Result<()> {
        let data = serde_json::to_vec(entry)?;
        self.bucket
            .put_object(&publication_key(&entry.object_id), &data, json_options())
            .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn remove(&self, object_id: &str) -> Result<bool> {
        let key = publication_key(object_id);
        if self.bucket.get_object(&key).await?.is_none() {
            return Ok(false);
        }
        self.bucket.delete_object(&key).await?;
        Ok(true)
    }

    async fn list(&self) -> Result<Vec<PublicationQueueEntry>> {
        let mut entries = Vec::new();
        for key in self.bucket.list_objects(PUBLICATION_PREFIX, None).await? {
            // Entries removed between listing and reading are skipped.
            if let Some(entry) = read_row::<PublicationQueueEntry>(&self.bucket, &key).await? {
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| {
            a.publication_date
                .cmp(&b.publication_date)
                .then_with(|| a.object_id.cmp(&b.object_id))
        });
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const BUCKET: &str = "docbroker";

    fn bucket(server: &MockServer) -> R2Bucket {
        R2Bucket::at_endpoint(&server.uri(), "test-key", "test-secret", BUCKET)
            .with_base_delay(Duration::ZERO)
    }

    fn object_path(key: &str) -> String {
        format!("/{}/{}", BUCKET, key)
    }

    fn precondition_failed() -> ResponseTemplate {
        ResponseTemplate::new(412).set_body_raw(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
             <Error><Code>PreconditionFailed</Code>\
             <Message>At least one of the pre-conditions you specified did not hold</Message>\
             </Error>",
            "application/xml",
        )
    }

    fn json_object(body: &impl Serialize, etag: &str) -> ResponseTemplate {
        ResponseTemplate::new(200)
            .insert_header("ETag", etag)
            .set_body_raw(serde_json::to_vec(body).unwrap(), "application/json")
    }

    async fn mount_sequence(server: &MockServer, value: u64, etag: &str) {
        Mock::given(method("GET"))
            .and(path(object_path(SEQUENCE_KEY)))
            .respond_with(json_object(&SequenceRow { value }, etag))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_increment_retries_after_lost_swap() {
        let server = MockServer::start().await;
        mount_sequence(&server, 7, "\"v7\"").await;
        Mock::given(method("PUT"))
            .and(path(object_path(SEQUENCE_KEY)))
            .and(header("if-match", "\"v7\""))
            .respond_with(precondition_failed())
            .up_to_n_times(1)
            .with_priority(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(object_path(SEQUENCE_KEY)))
            .and(header("if-match", "\"v7\""))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"v8\""))
            .expect(1)
            .mount(&server)
            .await;

        let counter = R2SequenceCounter::new(bucket(&server));
        assert_eq!(counter.increment().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_increment_gives_up_after_repeated_conflicts() {
        let server = MockServer::start().await;
        mount_sequence(&server, 7, "\"v7\"").await;
        Mock::given(method("PUT"))
            .and(path(object_path(SEQUENCE_KEY)))
            .respond_with(precondition_failed())
            .expect(u64::from(CAS_MAX_RETRIES))
            .mount(&server)
            .await;

        let counter = R2SequenceCounter::new(bucket(&server));
        let err = counter.increment().await.unwrap_err();
        assert!(matches!(err, BrokerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_insert_losing_the_claim_returns_winner() {
        let server = MockServer::start().await;
        let ids = ObjectIdentifiers {
            object_id: "ZLD2024-2".into(),
            ..ObjectIdentifiers::from_repository("site-1", "list-1", "7")
        };
        let winner = ObjectIdentifiers {
            object_id: "ZLD2024-1".into(),
            ..ids.clone()
        };
        let claim = object_path(&by_natural_key(&ids.natural_key().unwrap()));

        Mock::given(method("PUT"))
            .and(path(claim.clone()))
            .and(header("if-none-match", "*"))
            .respond_with(precondition_failed())
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(claim))
            .respond_with(json_object(&winner, "\"w1\""))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(object_path(&by_id_key("ZLD2024-2"))))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let store = R2IdentityStore::new(bucket(&server));
        assert_eq!(
            store.insert(&ids).await.unwrap(),
            InsertOutcome::Existing(winner)
        );
    }

    #[tokio::test]
    async fn test_insert_winning_the_claim_writes_indexes() {
        let server = MockServer::start().await;
        let ids = ObjectIdentifiers {
            object_id: "ZLD2024-1".into(),
            drive_id: "driveA".into(),
            drive_item_id: "01ITEM".into(),
            ..ObjectIdentifiers::from_repository("site-1", "list-1", "7")
        };

        Mock::given(method("PUT"))
            .and(path(object_path(&by_natural_key(&ids.natural_key().unwrap()))))
            .and(header("if-none-match", "*"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(object_path(&by_id_key("ZLD2024-1"))))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path(object_path(&by_storage_key(&ids.storage_key().unwrap()))))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let store = R2IdentityStore::new(bucket(&server));
        assert_eq!(store.insert(&ids).await.unwrap(), InsertOutcome::Inserted);
    }

    #[test]
    fn test_row_names() {
        let ids = ObjectIdentifiers::from_repository("Site", "List", "7");
        let natural = ids.natural_key().unwrap();
        let key = by_natural_key(&natural);
        assert!(key.starts_with("identity/by-key/"));
        assert!(key.ends_with(".json"));
        // 64 hex characters of SHA256.
        assert_eq!(key.len(), "identity/by-key/".len() + 64 + ".json".len());
        assert_eq!(
            key,
            by_natural_key(&ObjectIdentifiers::from_repository("site", "list", "7")
                .natural_key()
                .unwrap())
        );

        assert_eq!(by_id_key("ZLD2024-101"), "identity/by-id/ZLD2024-101.json");
        assert_eq!(publication_key("a/b"), "publication/a%2Fb.json");
    }

    #[test]
    fn test_sequence_row_shape() {
        let row: SequenceRow = serde_json::from_str(r#"{"value":100}"#).unwrap();
        assert_eq!(row.value, 100);
        assert_eq!(serde_json::to_string(&SequenceRow { value: 101 }).unwrap(), r#"{"value":101}"#);
    }
}
