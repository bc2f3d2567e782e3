use std::sync::Arc;

use chrono::Datelike;
use dashmap::DashMap;
use docbroker_core::{
    BrokerError, IdentityStore, InsertOutcome, NaturalKey, ObjectIdentifiers, Result,
    SequenceCounter,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::resolver::IdentityResolver;
use crate::Clock;

/// An identity record returned by the minter.
#[derive(Debug, Clone, PartialEq)]
pub struct Minted {
    pub record: ObjectIdentifiers,
    /// Whether this call assigned the object id.
    pub created: bool,
}

/// Assigns object ids of the form `<prefix><year>-<sequence>`.
///
/// An object id is assigned once per natural key. Concurrent mints for the same key inside this
/// process are serialized by a per-key lock; across processes the create-only identity insert
/// decides the winner.
pub struct ObjectIdMinter {
    resolver: Arc<IdentityResolver>,
    identities: Arc<dyn IdentityStore>,
    counter: Arc<dyn SequenceCounter>,
    prefix: String,
    clock: Clock,
    key_locks: DashMap<NaturalKey, Arc<Mutex<()>>>,
}

impl ObjectIdMinter {
    pub fn new(
        resolver: Arc<IdentityResolver>,
        identities: Arc<dyn IdentityStore>,
        counter: Arc<dyn SequenceCounter>,
        prefix: impl Into<String>,
        clock: Clock,
    ) -> Self {
        Self {
            resolver,
            identities,
            counter,
            prefix: prefix.into(),
            clock,
            key_locks: DashMap::new(),
        }
    }

    /// Return the object id of a document, minting and persisting one if it has none yet.
    #[instrument(skip(self, ids), level = "debug")]
    pub async fn mint(&self, ids: &ObjectIdentifiers) -> Result<String> {
        Ok(self.mint_record(ids).await?.object_id)
    }

    /// Like [`mint`](Self::mint) but returns the full identity record.
    pub async fn mint_record(&self, ids: &ObjectIdentifiers) -> Result<ObjectIdentifiers> {
        Ok(self.mint_tracked(ids).await?.record)
    }

    /// Like [`mint_record`](Self::mint_record), also telling whether the object id is new.
    pub async fn mint_tracked(&self, ids: &ObjectIdentifiers) -> Result<Minted> {
        let resolved = self.resolver.resolve(ids).await?;
        resolved.require_complete()?;
        let key = resolved.natural_key().ok_or_else(|| {
            BrokerError::DataIntegrity("complete identifiers without natural key".to_string())
        })?;

        let lock = self
            .key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;
            self.mint_locked(&key, resolved).await
        };
        drop(lock);
        self.key_locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn mint_locked(
        &self,
        key: &NaturalKey,
        resolved: ObjectIdentifiers,
    ) -> Result<Minted> {
        if let Some(existing) = self.identities.get_by_natural_key(key).await? {
            let augmented = existing.merged(&resolved);
            let indexed = self
                .identities
                .get_by_object_id(&existing.object_id)
                .await?
                .is_some();
            if !indexed {
                warn!("Restoring index rows of {}", existing.object_id);
                self.identities.upsert(&augmented).await?;
            } else if augmented != existing {
                debug!("Augmenting identity record {}", existing.object_id);
                self.identities.upsert(&augmented).await?;
            }
            return Ok(Minted {
                record: augmented,
                created: false,
            });
        }

        let fresh = resolved.object_id.is_empty();
        let record = if fresh {
            let sequence = self.counter.increment().await?;
            let year = (self.clock)().year();
            ObjectIdentifiers {
                object_id: format!("{}{}-{}", self.prefix, year, sequence),
                ..resolved
            }
        } else {
            // Known object id whose record was lost; re-register without consuming the sequence.
            resolved
        };

        match self.identities.insert(&record).await? {
            InsertOutcome::Inserted => {
                info!("Minted object id {} for {}", record.object_id, key);
                Ok(Minted {
                    record,
                    created: fresh,
                })
            }
            InsertOutcome::Existing(winner) => {
                warn!(
                    "Natural key {} registered concurrently as {}; {} left unused",
                    key, winner.object_id, record.object_id
                );
                Ok(Minted {
                    record: winner,
                    created: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed_clock;
    use crate::memory::{MemoryIdentityStore, MemoryRepository, MemorySequenceCounter};
    use crate::settings::ReferenceMap;
    use chrono::TimeZone;
    use serde_json::Map;

    fn minter_at(
        start: u64,
    ) -> (
        Arc<MemoryRepository>,
        Arc<MemoryIdentityStore>,
        Arc<MemorySequenceCounter>,
        ObjectIdMinter,
    ) {
        let repository = Arc::new(MemoryRepository::new());
        repository.add_library("site-1", "list-1", "drive-1");
        let identities = Arc::new(MemoryIdentityStore::new());
        let counter = Arc::new(MemorySequenceCounter::starting_at(start));
        let resolver = Arc::new(IdentityResolver::new(
            repository.clone(),
            identities.clone(),
            ReferenceMap::default(),
        ));
        let minter = ObjectIdMinter::new(
            resolver,
            identities.clone(),
            counter.clone(),
            "ZLD",
            fixed_clock(chrono::Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()),
        );
        (repository, identities, counter, minter)
    }

    #[tokio::test]
    async fn test_existing_record_consumes_no_sequence() {
        let (repository, _, counter, minter) = minter_at(10);
        let doc = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();

        let first = minter.mint(&doc).await.unwrap();
        let second = minter
            .mint(&ObjectIdentifiers::from_storage("drive-1", &doc.drive_item_id))
            .await
            .unwrap();

        assert_eq!(first, "ZLD2024-11");
        assert_eq!(first, second);
        assert_eq!(counter.current().await.unwrap(), 11);
    }

    #[tokio::test]
    async fn test_missing_coordinate_is_named() {
        let (_, _, _, minter) = minter_at(0);
        let err = minter
            .mint(&ObjectIdentifiers::from_object_id("ZLD2024-1"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            BrokerError::MissingCoordinate(docbroker_core::Coordinate::SiteId)
        );
    }

    #[tokio::test]
    async fn test_lock_table_is_cleaned_up() {
        let (repository, _, _, minter) = minter_at(0);
        let doc = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();
        minter.mint(&doc).await.unwrap();
        assert!(minter.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_remint_reports_existing_record() {
        let (repository, _, _, minter) = minter_at(0);
        let doc = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();

        assert!(minter.mint_tracked(&doc).await.unwrap().created);
        let again = minter.mint_tracked(&doc).await.unwrap();
        assert!(!again.created);
        assert_eq!(again.record.object_id, "ZLD2024-1");
    }

    #[tokio::test]
    async fn test_missing_object_row_is_restored() {
        let (repository, identities, counter, minter) = minter_at(0);
        let doc = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();
        minter.mint(&doc).await.unwrap();
        identities.drop_object_row("ZLD2024-1");

        assert_eq!(minter.mint(&doc).await.unwrap(), "ZLD2024-1");

        let record = identities.get_by_object_id("ZLD2024-1").await.unwrap().unwrap();
        assert_eq!(record.drive_item_id, doc.drive_item_id);
        assert_eq!(counter.current().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_lost_race_returns_winner() {
        let (repository, identities, _, minter) = minter_at(0);
        let doc = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();
        identities.hide_natural_key_lookups(true);
        identities
            .insert(&ObjectIdentifiers {
                object_id: "ZLD2024-900".into(),
                ..doc.clone()
            })
            .await
            .unwrap();

        let minted = minter.mint(&doc).await.unwrap();
        assert_eq!(minted, "ZLD2024-900");
    }
}
