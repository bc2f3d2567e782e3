use docbroker_core::{BrokerError, ObjectIdentifiers, Result};
use serde_json::{Map, Value};
use tracing::{error, info, instrument, warn};

use crate::context::BrokerContext;

/// Creates documents upstream with an object id, and deletes whole objects.
pub struct DocumentRegistrar {
    ctx: BrokerContext,
}

impl DocumentRegistrar {
    pub fn new(ctx: BrokerContext) -> Self {
        Self { ctx }
    }

    /// Upload a document and mint its object id. If minting fails the upload is rolled back.
    #[instrument(skip(self, content, fields), fields(size = content.len()))]
    pub async fn register(
        &self,
        site_id: &str,
        list_id: &str,
        file_name: &str,
        content: &[u8],
        fields: &Map<String, Value>,
    ) -> Result<ObjectIdentifiers> {
        if file_name.trim().is_empty() {
            return Err(BrokerError::InvalidInput("file name is required".to_string()));
        }

        let created = self
            .ctx
            .repository
            .create_document(site_id, list_id, file_name, content, fields)
            .await?;

        match self.ctx.minter.mint_record(&created).await {
            Ok(record) => {
                info!("Registered {} as {}", file_name, record.object_id);
                Ok(record)
            }
            Err(e) => {
                warn!("Minting failed for {}, removing upload: {}", file_name, e);
                if let Err(rollback) = self.ctx.repository.delete_document(&created).await {
                    error!(
                        "Rollback of {} ({}) failed: {}",
                        file_name, created.list_item_id, rollback
                    );
                }
                Err(e)
            }
        }
    }

    /// Delete an object everywhere: repository document, exported artifacts, publication entry
    /// and identity record.
    #[instrument(skip(self))]
    pub async fn delete(&self, object_id: &str) -> Result<()> {
        let record = self
            .ctx
            .identities
            .get_by_object_id(object_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("object {}", object_id)))?;

        match self.ctx.repository.delete_document(&record).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                warn!("Document of {} already gone upstream", object_id);
            }
            Err(e) => return Err(e),
        }

        self.ctx.exporter.remove(object_id).await?;
        self.ctx.publications.remove_if_exists(object_id).await?;
        self.ctx.identities.delete(&record).await?;
        info!("Deleted {}", object_id);
        Ok(())
    }
}
