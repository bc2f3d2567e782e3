use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use docbroker_core::{ObjectIdentifiers, PublicationQueueEntry, PublicationStore, Result};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::export::{ExportKind, Exporter};
use crate::resolver::IdentityResolver;
use crate::{Clock, FailedItem};

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub succeeded: Vec<String>,
    /// Entries kept because the document's publication date moved further out.
    pub postponed: Vec<String>,
    pub failed: Vec<FailedItem>,
}

enum Publication {
    Published,
    Postponed(DateTime<Utc>),
}

/// Documents whose export waits for their publication date.
pub struct PublicationQueue {
    store: Arc<dyn PublicationStore>,
    resolver: Arc<IdentityResolver>,
    exporter: Arc<Exporter>,
    clock: Clock,
}

impl PublicationQueue {
    pub fn new(
        store: Arc<dyn PublicationStore>,
        resolver: Arc<IdentityResolver>,
        exporter: Arc<Exporter>,
        clock: Clock,
    ) -> Self {
        Self {
            store,
            resolver,
            exporter,
            clock,
        }
    }

    pub async fn enqueue(&self, object_id: &str, publication_date: DateTime<Utc>) -> Result<()> {
        info!("Deferring {} until {}", object_id, publication_date.date_naive());
        self.store
            .put(&PublicationQueueEntry {
                object_id: object_id.to_string(),
                publication_date,
            })
            .await
    }

    pub async fn remove_if_exists(&self, object_id: &str) -> Result<bool> {
        self.store.remove(object_id).await
    }

    pub async fn entries(&self) -> Result<Vec<PublicationQueueEntry>> {
        self.store.list().await
    }

    /// Export every entry whose publication date is today or earlier.
    #[instrument(skip(self), level = "debug")]
    pub async fn drain(&self) -> Result<DrainReport> {
        let today = (self.clock)().date_naive();
        let due: Vec<_> = self
            .store
            .list()
            .await?
            .into_iter()
            .filter(|entry| entry.publication_date.date_naive() <= today)
            .collect();

        let mut report = DrainReport::default();
        for entry in due {
            match self.publish(&entry.object_id, today).await {
                Ok(Publication::Published) => {
                    self.store.remove(&entry.object_id).await?;
                    report.succeeded.push(entry.object_id);
                }
                Ok(Publication::Postponed(publication_date)) => {
                    self.enqueue(&entry.object_id, publication_date).await?;
                    report.postponed.push(entry.object_id);
                }
                Err(e) => {
                    warn!("Failed to publish {}: {}", entry.object_id, e);
                    report.failed.push(FailedItem {
                        id: entry.object_id,
                        error: e.to_string(),
                    });
                }
            }
        }

        if !report.succeeded.is_empty()
            || !report.postponed.is_empty()
            || !report.failed.is_empty()
        {
            info!(
                "Publication drain: {} published, {} postponed, {} failed",
                report.succeeded.len(),
                report.postponed.len(),
                report.failed.len()
            );
        }
        Ok(report)
    }

    async fn publish(&self, object_id: &str, today: NaiveDate) -> Result<Publication> {
        let ids = self
            .resolver
            .resolve(&ObjectIdentifiers::from_object_id(object_id))
            .await?;
        ids.require_complete()?;
        let metadata = self.exporter.load_metadata(&ids).await?;
        if let Some(publication_date) = metadata
            .publication_date()
            .filter(|date| date.date_naive() > today)
        {
            return Ok(Publication::Postponed(publication_date));
        }
        self.exporter
            .export(&ids, &metadata, ExportKind::Create)
            .await?;
        Ok(Publication::Published)
    }
}
