use std::sync::Arc;
use std::time::Duration;

use docbroker_core::{IdentityStore, ObjectIdentifiers, RepositoryClient, Result};
use moka::future::Cache;
use tracing::{debug, instrument};

use crate::settings::ReferenceMap;

const DRIVE_CACHE_CAPACITY: u64 = 1024;
const DRIVE_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Completes a partial identifier set from the repository, the identity table and configuration.
///
/// Resolution only fills empty fields, so resolving an already-resolved set returns it unchanged.
pub struct IdentityResolver {
    repository: Arc<dyn RepositoryClient>,
    identities: Arc<dyn IdentityStore>,
    references: ReferenceMap,
    /// (site, list) -> drive id
    drive_ids: Cache<(String, String), String>,
}

impl IdentityResolver {
    pub fn new(
        repository: Arc<dyn RepositoryClient>,
        identities: Arc<dyn IdentityStore>,
        references: ReferenceMap,
    ) -> Self {
        Self {
            repository,
            identities,
            references,
            drive_ids: Cache::builder()
                .max_capacity(DRIVE_CACHE_CAPACITY)
                .time_to_live(DRIVE_CACHE_TTL)
                .build(),
        }
    }

    #[instrument(skip(self, ids), level = "debug", fields(object_id = %ids.object_id))]
    pub async fn resolve(&self, ids: &ObjectIdentifiers) -> Result<ObjectIdentifiers> {
        ids.ensure_addressable()?;

        let mut resolved = self.fill_from_repository(ids.clone()).await?;

        if !resolved.object_id.is_empty() && resolved.has_missing_coordinates() {
            if let Some(stored) = self.identities.get_by_object_id(&resolved.object_id).await? {
                let merged = resolved.merged(&stored);
                if merged != resolved {
                    debug!("Filled coordinates of {} from identity table", resolved.object_id);
                    // The stored record may bring one coordinate space the repository can extend.
                    resolved = self.fill_from_repository(merged).await?;
                }
            }
        }

        if resolved.external_reference_list_id.is_empty() {
            if let Some(reference) = self
                .references
                .lookup(&resolved.site_id, &resolved.list_id)
            {
                resolved.external_reference_list_id = reference.to_string();
            }
        }

        Ok(resolved)
    }

    async fn fill_from_repository(&self, ids: ObjectIdentifiers) -> Result<ObjectIdentifiers> {
        let mut ids = ids;

        if !ids.has_storage_pair() && !ids.site_id.is_empty() && !ids.list_id.is_empty() {
            let mut patch = ObjectIdentifiers {
                drive_id: self.container_id(&ids.site_id, &ids.list_id).await?,
                ..Default::default()
            };
            if !ids.list_item_id.is_empty() && ids.drive_item_id.is_empty() {
                patch.drive_item_id = self
                    .repository
                    .get_item_id(&ids.site_id, &ids.list_id, &ids.list_item_id)
                    .await?;
            }
            ids = ids.merged(&patch);
        }

        if !ids.has_repository_triple() && ids.has_storage_pair() {
            let coordinates = self
                .repository
                .get_repository_coordinates(&ids.drive_id, &ids.drive_item_id)
                .await?;
            ids = ids.merged(&ObjectIdentifiers::from_repository(
                coordinates.site_id,
                coordinates.list_id,
                coordinates.list_item_id,
            ));
        }

        Ok(ids)
    }

    async fn container_id(&self, site_id: &str, list_id: &str) -> Result<String> {
        let key = (site_id.to_lowercase(), list_id.to_lowercase());
        if let Some(drive_id) = self.drive_ids.get(&key).await {
            return Ok(drive_id);
        }
        let drive_id = self.repository.get_container_id(site_id, list_id).await?;
        self.drive_ids.insert(key, drive_id.clone()).await;
        Ok(drive_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryIdentityStore, MemoryRepository};
    use docbroker_core::BrokerError;
    use serde_json::Map;

    fn setup() -> (Arc<MemoryRepository>, Arc<MemoryIdentityStore>, IdentityResolver) {
        let repository = Arc::new(MemoryRepository::new());
        repository.add_library("site-1", "list-1", "drive-1");
        let identities = Arc::new(MemoryIdentityStore::new());
        let resolver = IdentityResolver::new(
            repository.clone(),
            identities.clone(),
            ReferenceMap::default().with_entry("site-1", "list-1", "refs-1"),
        );
        (repository, identities, resolver)
    }

    #[tokio::test]
    async fn test_resolve_from_triple() {
        let (repository, _, resolver) = setup();
        let created = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();

        let partial =
            ObjectIdentifiers::from_repository("site-1", "list-1", &created.list_item_id);
        let resolved = resolver.resolve(&partial).await.unwrap();

        assert_eq!(resolved.drive_id, "drive-1");
        assert_eq!(resolved.drive_item_id, created.drive_item_id);
        assert_eq!(resolved.external_reference_list_id, "refs-1");
    }

    #[tokio::test]
    async fn test_resolve_from_pair() {
        let (repository, _, resolver) = setup();
        let created = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();

        let partial = ObjectIdentifiers::from_storage("drive-1", &created.drive_item_id);
        let resolved = resolver.resolve(&partial).await.unwrap();

        assert_eq!(resolved.site_id, "site-1");
        assert_eq!(resolved.list_id, "list-1");
        assert_eq!(resolved.list_item_id, created.list_item_id);
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let (repository, _, resolver) = setup();
        let created = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();

        let partial = ObjectIdentifiers::from_storage("drive-1", &created.drive_item_id);
        let once = resolver.resolve(&partial).await.unwrap();
        let twice = resolver.resolve(&once).await.unwrap();
        assert_eq!(once, twice);
    }

    #[tokio::test]
    async fn test_resolve_from_object_id() {
        let (repository, identities, resolver) = setup();
        let created = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();
        let record = ObjectIdentifiers {
            object_id: "ZLD2024-7".into(),
            ..created.clone()
        };
        identities.upsert(&record).await.unwrap();

        let resolved = resolver
            .resolve(&ObjectIdentifiers::from_object_id("ZLD2024-7"))
            .await
            .unwrap();
        assert_eq!(resolved.drive_item_id, created.drive_item_id);
        assert_eq!(resolved.list_item_id, created.list_item_id);
    }

    #[tokio::test]
    async fn test_never_overwrites_populated_fields() {
        let (repository, _, resolver) = setup();
        let created = repository.add_document("drive-1", "a.docx", b"x", Map::new()).unwrap();

        let partial = ObjectIdentifiers {
            external_reference_list_id: "custom".into(),
            ..ObjectIdentifiers::from_repository("site-1", "list-1", &created.list_item_id)
        };
        let resolved = resolver.resolve(&partial).await.unwrap();
        assert_eq!(resolved.external_reference_list_id, "custom");
    }

    #[tokio::test]
    async fn test_not_found_per_coordinate() {
        let (_, _, resolver) = setup();

        let err = resolver
            .resolve(&ObjectIdentifiers::from_repository("site-1", "missing", "1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ContainerMissing(_)));

        let err = resolver
            .resolve(&ObjectIdentifiers::from_repository("site-1", "list-1", "999"))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ItemMissing(_)));
    }

    #[tokio::test]
    async fn test_rejects_empty_input() {
        let (_, _, resolver) = setup();
        let err = resolver
            .resolve(&ObjectIdentifiers::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidInput(_)));
    }
}
