//! Delta synchronization over the monitored drives' change feeds.
//!
//! Each feed type keeps its own checkpoint: the start time of its last completed run and the map
//! of per-drive delta tokens. A run fetches every drive's changes since its token, classifies them
//! against the checkpoint time, processes the items one by one and only then stores the new
//! checkpoint, so an interrupted run is replayed in full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use docbroker_core::{
    BrokerError, ChangeFeedItem, CheckpointStore, FeedType, ObjectIdentifiers, Result,
    StorageKey, SyncCheckpoint, TokenMap,
};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::context::BrokerContext;
use crate::export::ExportKind;
use crate::{FailedItem, ItemOutcome};

/// Outcome of one feed run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub feed: FeedType,
    /// Encoded token map stored by this run.
    pub token_map: String,
    /// Ids of the items the run attempted, in processing order.
    pub items: Vec<String>,
    pub succeeded: usize,
    pub deferred: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedItem>,
    /// Set when shutdown interrupted the run; the checkpoint was not advanced.
    pub cancelled: bool,
}

impl SyncReport {
    fn new(feed: FeedType) -> Self {
        Self {
            feed,
            token_map: String::new(),
            items: Vec::new(),
            succeeded: 0,
            deferred: Vec::new(),
            skipped: Vec::new(),
            failed: Vec::new(),
            cancelled: false,
        }
    }
}

/// At most one run per feed type.
#[derive(Default)]
struct RunningFlags {
    new: AtomicBool,
    updated: AtomicBool,
    deleted: AtomicBool,
}

impl RunningFlags {
    fn flag(&self, feed: FeedType) -> &AtomicBool {
        match feed {
            FeedType::New => &self.new,
            FeedType::Updated => &self.updated,
            FeedType::Deleted => &self.deleted,
        }
    }

    fn acquire(&self, feed: FeedType) -> Result<RunningGuard<'_>> {
        let flag = self.flag(feed);
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BrokerError::AlreadyRunning(feed))?;
        Ok(RunningGuard(flag))
    }
}

/// Clears the running flag however the run ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct FetchedChanges {
    items: Vec<ChangeFeedItem>,
    tokens: TokenMap,
}

pub struct DeltaSyncEngine {
    ctx: BrokerContext,
    checkpoints: Arc<dyn CheckpointStore>,
    running: RunningFlags,
    shutdown: Option<watch::Receiver<bool>>,
}

impl DeltaSyncEngine {
    pub fn new(ctx: BrokerContext, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            ctx,
            checkpoints,
            running: RunningFlags::default(),
            shutdown: None,
        }
    }

    /// Stop runs between items once the receiver reads `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn is_running(&self, feed: FeedType) -> bool {
        self.running.flag(feed).load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    #[instrument(skip(self), fields(feed = %feed))]
    pub async fn run(&self, feed: FeedType) -> Result<SyncReport> {
        let _running = self.running.acquire(feed)?;
        let started_at = self.ctx.now();

        let checkpoint = self.checkpoints.load(feed).await?;
        let fetched = match self.fetch(&checkpoint.tokens).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!("Change feed fetch failed, checkpoint kept: {}", e);
                return Err(e);
            }
        };

        let items = classify(feed, fetched.items, checkpoint.threshold());
        info!("{} {} item(s) to process", items.len(), feed);

        let mut report = SyncReport::new(feed);
        for item in &items {
            if self.is_cancelled() {
                info!("Shutdown requested, {} run stopped before {}", feed, item.id);
                report.cancelled = true;
                return Ok(report);
            }

            report.items.push(item.id.clone());
            match self.process(feed, item).await {
                Ok(ItemOutcome::Exported) => report.succeeded += 1,
                Ok(ItemOutcome::Deferred) => report.deferred.push(item.id.clone()),
                Ok(ItemOutcome::Skipped(reason)) => {
                    debug!("Skipped {}: {}", item.id, reason);
                    report.skipped.push(item.id.clone());
                }
                Err(e) => {
                    warn!("Failed to process {} ({}): {}", item.id, item.name, e);
                    report.failed.push(FailedItem {
                        id: item.id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        let next = SyncCheckpoint {
            last_run: Some(started_at),
            tokens: fetched.tokens,
        };
        self.checkpoints.save(feed, &next).await?;
        report.token_map = next.tokens.encode();

        info!(
            "{} run done: {} succeeded, {} deferred, {} skipped, {} failed",
            feed,
            report.succeeded,
            report.deferred.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Page every monitored drive's feed from its stored token, concurrently.
    async fn fetch(&self, tokens: &TokenMap) -> Result<FetchedChanges> {
        let drives: Vec<&str> = self
            .ctx
            .settings
            .containers
            .iter()
            .map(|c| c.drive_id.as_str())
            .collect();

        let results = join_all(
            drives
                .iter()
                .map(|drive_id| self.fetch_drive(drive_id, tokens.get(drive_id))),
        )
        .await;

        let mut next_tokens = tokens.clone();
        let mut items = Vec::new();
        for (drive_id, result) in drives.iter().zip(results) {
            let (drive_items, token) = result?;
            items.extend(drive_items);
            if !token.is_empty() {
                next_tokens.insert(*drive_id, token);
            }
        }

        Ok(FetchedChanges {
            items: dedupe(items),
            tokens: next_tokens,
        })
    }

    async fn fetch_drive(
        &self,
        drive_id: &str,
        token: Option<&str>,
    ) -> Result<(Vec<ChangeFeedItem>, String)> {
        let mut items = Vec::new();
        let mut cursor = token.map(str::to_string);
        loop {
            let page = match self
                .ctx
                .repository
                .get_change_feed_page(drive_id, cursor.as_deref())
                .await
            {
                Ok(page) => page,
                Err(BrokerError::InvalidToken(reason)) if cursor.is_some() && items.is_empty() => {
                    warn!(
                        "Delta token of {} rejected ({}), enumerating from scratch",
                        drive_id, reason
                    );
                    cursor = None;
                    continue;
                }
                Err(e) => return Err(e),
            };
            items.extend(page.items.into_iter().map(|mut item| {
                if item.container_id.is_empty() {
                    item.container_id = drive_id.to_string();
                }
                item
            }));

            if !page.has_more {
                let next = page.cursor.or(cursor).unwrap_or_default();
                debug!("Drive {}: {} change(s)", drive_id, items.len());
                return Ok((items, next));
            }
            cursor = Some(page.cursor.ok_or_else(|| {
                BrokerError::DataIntegrity(format!(
                    "change feed of {} reported more pages without a cursor",
                    drive_id
                ))
            })?);
        }
    }

    async fn process(&self, feed: FeedType, item: &ChangeFeedItem) -> Result<ItemOutcome> {
        match feed {
            FeedType::New => self.export_item(item, ExportKind::Create).await,
            FeedType::Updated => self.export_item(item, ExportKind::Update).await,
            FeedType::Deleted => self.remove_item(item).await,
        }
    }

    async fn export_item(&self, item: &ChangeFeedItem, kind: ExportKind) -> Result<ItemOutcome> {
        let partial = ObjectIdentifiers::from_storage(&item.container_id, &item.id);
        let ids = match self.ctx.resolver.resolve(&partial).await {
            Ok(ids) => ids,
            Err(e) if e.is_not_found() => {
                return Ok(ItemOutcome::Skipped(format!("no longer in repository: {}", e)))
            }
            Err(e) => return Err(e),
        };

        let metadata = self.ctx.exporter.load_metadata(&ids).await?;
        if !metadata.is_populated(&self.ctx.mapping) {
            return Ok(ItemOutcome::Skipped("metadata not filled in yet".to_string()));
        }

        let minted = self.ctx.minter.mint_tracked(&ids).await?;
        let kind = if minted.created { ExportKind::Create } else { kind };
        let record = minted.record;

        if let Some(publication_date) = metadata.publication_date() {
            if publication_date > self.ctx.now() {
                self.ctx
                    .publications
                    .enqueue(&record.object_id, publication_date)
                    .await?;
                return Ok(ItemOutcome::Deferred);
            }
        }

        self.ctx.exporter.export(&record, &metadata, kind).await?;
        Ok(ItemOutcome::Exported)
    }

    async fn remove_item(&self, item: &ChangeFeedItem) -> Result<ItemOutcome> {
        let key = StorageKey::new(&item.container_id, &item.id);
        let Some(record) = self.ctx.identities.get_by_storage_key(&key).await? else {
            return Ok(ItemOutcome::Skipped("never registered".to_string()));
        };

        let removed = self.ctx.exporter.remove(&record.object_id).await?;
        self.ctx
            .publications
            .remove_if_exists(&record.object_id)
            .await?;
        debug!("Removed {} artifact(s) of {}", removed, record.object_id);
        Ok(ItemOutcome::Exported)
    }
}

/// Later entries for the same `(container, item)` replace earlier ones, keeping first-seen order.
fn dedupe(items: Vec<ChangeFeedItem>) -> Vec<ChangeFeedItem> {
    let mut index: HashMap<(String, String), usize> = HashMap::new();
    let mut unique: Vec<ChangeFeedItem> = Vec::with_capacity(items.len());
    for item in items {
        let key = (item.container_id.clone(), item.id.clone());
        match index.get(&key) {
            Some(&position) => unique[position] = item,
            None => {
                index.insert(key, unique.len());
                unique.push(item);
            }
        }
    }
    unique
}

/// Select and order the items a feed type acts on. Folders are never selected.
pub fn classify(
    feed: FeedType,
    items: Vec<ChangeFeedItem>,
    threshold: DateTime<Utc>,
) -> Vec<ChangeFeedItem> {
    let mut selected: Vec<ChangeFeedItem> = items
        .into_iter()
        .filter(|item| !item.is_folder)
        .filter(|item| match feed {
            FeedType::New => !item.is_deleted && item.created_at >= threshold,
            FeedType::Updated => !item.is_deleted && item.created_at < threshold,
            FeedType::Deleted => item.is_deleted,
        })
        .collect();

    match feed {
        FeedType::New => selected.sort_by_key(|item| item.created_at),
        FeedType::Updated | FeedType::Deleted => selected.sort_by_key(|item| item.modified_at),
    }
    selected
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn item(id: &str, created_day: u32, modified_day: u32) -> ChangeFeedItem {
        ChangeFeedItem {
            id: id.to_string(),
            container_id: "driveA".to_string(),
            name: format!("{}.docx", id),
            is_folder: false,
            is_deleted: false,
            created_at: Utc.with_ymd_and_hms(2024, 1, created_day, 0, 0, 0).unwrap(),
            modified_at: Utc.with_ymd_and_hms(2024, 1, modified_day, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_classification_is_exclusive() {
        let threshold = Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap();
        let mut deleted = item("gone", 2, 12);
        deleted.is_deleted = true;
        let mut folder = item("folder", 11, 11);
        folder.is_folder = true;
        let items = vec![
            item("old", 1, 15),
            item("fresh", 12, 12),
            item("edge", 10, 10),
            deleted,
            folder,
        ];

        let new = classify(FeedType::New, items.clone(), threshold);
        let updated = classify(FeedType::Updated, items.clone(), threshold);
        let removed = classify(FeedType::Deleted, items, threshold);

        let ids = |v: &[ChangeFeedItem]| v.iter().map(|i| i.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&new), vec!["edge", "fresh"]);
        assert_eq!(ids(&updated), vec!["old"]);
        assert_eq!(ids(&removed), vec!["gone"]);
    }

    #[test]
    fn test_no_checkpoint_means_everything_is_new() {
        let items = vec![item("a", 1, 1), item("b", 2, 3)];
        let threshold = SyncCheckpoint::default().threshold();
        assert_eq!(classify(FeedType::New, items.clone(), threshold).len(), 2);
        assert!(classify(FeedType::Updated, items, threshold).is_empty());
    }

    #[test]
    fn test_updated_ordered_by_modification() {
        let threshold = Utc.with_ymd_and_hms(2024, 1, 20, 0, 0, 0).unwrap();
        let items = vec![item("late", 1, 9), item("early", 2, 3)];
        let updated = classify(FeedType::Updated, items, threshold);
        assert_eq!(updated[0].id, "early");
    }

    #[test]
    fn test_dedupe_keeps_latest_state() {
        let mut removed = item("a", 1, 5);
        removed.is_deleted = true;
        let unique = dedupe(vec![item("a", 1, 1), item("b", 1, 1), removed]);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].id, "a");
        assert!(unique[0].is_deleted);
    }

    #[test]
    fn test_running_flag_released_on_drop() {
        let flags = RunningFlags::default();
        {
            let _guard = flags.acquire(FeedType::New).unwrap();
            assert_eq!(
                flags.acquire(FeedType::New).err(),
                Some(BrokerError::AlreadyRunning(FeedType::New))
            );
            assert!(flags.acquire(FeedType::Deleted).is_ok());
        }
        assert!(flags.acquire(FeedType::New).is_ok());
    }
}
