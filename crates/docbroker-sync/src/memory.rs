//! In-memory implementations of every backend trait.
//!
//! Used for local runs of the server (`--backend memory`) and by the engine tests. The repository
//! keeps an append-only change log per drive and per list so feeds and list changes page the same
//! way the remote ones do, with offsets as tokens.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use docbroker_core::{
    AuthorNotice, AuthorNotifier, BrokerError, CallbackEvent, CallbackSink, ChangeFeedItem,
    ChangeFeedPage, ChangeType, CheckpointStore, ContentStore, CreatedSubscription,
    DestinationFolder, FeedType, IdentityStore, InsertOutcome, ListChange, ListChangesPage,
    NaturalKey, NotificationBatch, NotificationQueue, ObjectIdentifiers, PublicationQueueEntry,
    PublicationStore, QueuedMessage, RepositoryClient, RepositoryCoordinates, Result,
    SequenceCounter, StorageKey, SubscriptionStore, SyncCheckpoint, WebhookSubscriptionState,
};
use serde_json::{Map, Value};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Repository
// =============================================================================

#[derive(Debug, Clone)]
struct Library {
    site_id: String,
    list_id: String,
    drive_id: String,
}

#[derive(Debug, Clone)]
struct Document {
    ids: ObjectIdentifiers,
    name: String,
    content: Vec<u8>,
    fields: Map<String, Value>,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
    deleted: bool,
}

impl Document {
    fn feed_item(&self) -> ChangeFeedItem {
        ChangeFeedItem {
            id: self.ids.drive_item_id.clone(),
            container_id: self.ids.drive_id.clone(),
            name: self.name.clone(),
            is_folder: false,
            is_deleted: self.deleted,
            created_at: self.created_at,
            modified_at: self.modified_at,
        }
    }
}

#[derive(Debug, Clone)]
struct Subscription {
    list_id: String,
    notification_url: String,
    expiration: DateTime<Utc>,
}

#[derive(Default)]
struct RepositoryState {
    libraries: Vec<Library>,
    /// Keyed by drive item id.
    documents: BTreeMap<String, Document>,
    next_item: u64,
    feeds: HashMap<String, Vec<ChangeFeedItem>>,
    list_changes: HashMap<String, Vec<ListChange>>,
    list_change_tokens: Vec<String>,
    subscriptions: BTreeMap<String, Subscription>,
    renewals: usize,
    fail_feed: bool,
    fail_downloads: bool,
}

impl RepositoryState {
    fn library_by_list(&self, site_id: &str, list_id: &str) -> Option<&Library> {
        self.libraries.iter().find(|l| {
            l.site_id.eq_ignore_ascii_case(site_id) && l.list_id.eq_ignore_ascii_case(list_id)
        })
    }

    fn library_by_drive(&self, drive_id: &str) -> Option<&Library> {
        self.libraries.iter().find(|l| l.drive_id == drive_id)
    }

    fn document(&self, ids: &ObjectIdentifiers) -> Result<&Document> {
        let found = if ids.has_storage_pair() {
            self.documents
                .get(&ids.drive_item_id)
                .filter(|d| d.ids.drive_id == ids.drive_id)
        } else {
            self.documents.values().find(|d| {
                d.ids.list_id.eq_ignore_ascii_case(&ids.list_id)
                    && d.ids.list_item_id == ids.list_item_id
            })
        };
        found
            .filter(|d| !d.deleted)
            .ok_or_else(|| BrokerError::ItemMissing(format!("{:?}", ids)))
    }

    fn record_change(&mut self, drive_item_id: &str, change_type: ChangeType) {
        let Some(document) = self.documents.get(drive_item_id) else {
            return;
        };
        let item = document.feed_item();
        let change = ListChange {
            item_id: document.ids.list_item_id.clone(),
            change_type,
        };
        let list_key = document.ids.list_id.to_lowercase();
        self.feeds
            .entry(item.container_id.clone())
            .or_default()
            .push(item);
        self.list_changes.entry(list_key).or_default().push(change);
    }

    fn insert_document(
        &mut self,
        drive_id: &str,
        name: &str,
        content: &[u8],
        fields: Map<String, Value>,
        created_at: DateTime<Utc>,
    ) -> Result<ObjectIdentifiers> {
        let library = self
            .library_by_drive(drive_id)
            .cloned()
            .ok_or_else(|| BrokerError::ContainerMissing(drive_id.to_string()))?;
        self.next_item += 1;
        let item_id = self.next_item.to_string();
        let ids = ObjectIdentifiers {
            site_id: library.site_id,
            list_id: library.list_id,
            list_item_id: item_id.clone(),
            drive_id: library.drive_id,
            drive_item_id: item_id.clone(),
            ..Default::default()
        };
        self.documents.insert(
            item_id.clone(),
            Document {
                ids: ids.clone(),
                name: name.to_string(),
                content: content.to_vec(),
                fields,
                created_at,
                modified_at: created_at,
                deleted: false,
            },
        );
        self.record_change(&item_id, ChangeType::Add);
        Ok(ids)
    }
}

/// Document libraries held in memory. Item ids are sequential numbers shared by the list item
/// and the drive item.
pub struct MemoryRepository {
    state: Mutex<RepositoryState>,
    page_size: usize,
}

impl Default for MemoryRepository {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::with_page_size(50)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Mutex::new(RepositoryState::default()),
            page_size: page_size.max(1),
        }
    }

    pub fn add_library(&self, site_id: &str, list_id: &str, drive_id: &str) {
        lock(&self.state).libraries.push(Library {
            site_id: site_id.to_string(),
            list_id: list_id.to_string(),
            drive_id: drive_id.to_string(),
        });
    }

    /// Upload a document created now.
    pub fn add_document(
        &self,
        drive_id: &str,
        name: &str,
        content: &[u8],
        fields: Map<String, Value>,
    ) -> Result<ObjectIdentifiers> {
        self.add_document_at(drive_id, name, content, fields, Utc::now())
    }

    pub fn add_document_at(
        &self,
        drive_id: &str,
        name: &str,
        content: &[u8],
        fields: Map<String, Value>,
        created_at: DateTime<Utc>,
    ) -> Result<ObjectIdentifiers> {
        lock(&self.state).insert_document(drive_id, name, content, fields, created_at)
    }

    /// Change fields as a user would, recording an update at `modified_at`.
    pub fn edit_fields(
        &self,
        drive_item_id: &str,
        patch: Map<String, Value>,
        modified_at: DateTime<Utc>,
    ) {
        let mut state = lock(&self.state);
        if let Some(document) = state.documents.get_mut(drive_item_id) {
            document.fields.extend(patch);
            document.modified_at = modified_at;
            state.record_change(drive_item_id, ChangeType::Update);
        }
    }

    pub fn remove_document(&self, drive_item_id: &str, deleted_at: DateTime<Utc>) {
        let mut state = lock(&self.state);
        if let Some(document) = state.documents.get_mut(drive_item_id) {
            document.deleted = true;
            document.modified_at = deleted_at;
            state.record_change(drive_item_id, ChangeType::Delete);
        }
    }

    pub fn fields(&self, drive_item_id: &str) -> Map<String, Value> {
        lock(&self.state)
            .documents
            .get(drive_item_id)
            .map(|d| d.fields.clone())
            .unwrap_or_default()
    }

    pub fn location(&self, drive_item_id: &str) -> Option<ObjectIdentifiers> {
        lock(&self.state)
            .documents
            .get(drive_item_id)
            .map(|d| d.ids.clone())
    }

    pub fn is_deleted(&self, drive_item_id: &str) -> bool {
        lock(&self.state)
            .documents
            .get(drive_item_id)
            .is_some_and(|d| d.deleted)
    }

    pub fn fail_feed(&self, fail: bool) {
        lock(&self.state).fail_feed = fail;
    }

    pub fn fail_downloads(&self, fail: bool) {
        lock(&self.state).fail_downloads = fail;
    }

    /// Change tokens passed to `get_list_changes`, in call order.
    pub fn list_change_tokens(&self) -> Vec<String> {
        lock(&self.state).list_change_tokens.clone()
    }

    /// (subscription id, list id, notification url, expiration) of every subscription.
    pub fn subscriptions(&self) -> Vec<(String, String, String, DateTime<Utc>)> {
        lock(&self.state)
            .subscriptions
            .iter()
            .map(|(id, s)| {
                (
                    id.clone(),
                    s.list_id.clone(),
                    s.notification_url.clone(),
                    s.expiration,
                )
            })
            .collect()
    }

    pub fn renewals(&self) -> usize {
        lock(&self.state).renewals
    }

    fn parse_offset(token: &str, len: usize) -> Result<usize> {
        if token.is_empty() {
            return Ok(0);
        }
        match token.parse::<usize>() {
            Ok(offset) if offset <= len => Ok(offset),
            _ => Err(BrokerError::InvalidToken(format!(
                "change token {} is not valid",
                token
            ))),
        }
    }
}

#[async_trait]
impl RepositoryClient for MemoryRepository {
    async fn get_container_id(&self, site_id: &str, list_id: &str) -> Result<String> {
        lock(&self.state)
            .library_by_list(site_id, list_id)
            .map(|l| l.drive_id.clone())
            .ok_or_else(|| BrokerError::ContainerMissing(format!("{}/{}", site_id, list_id)))
    }

    async fn get_item_id(
        &self,
        site_id: &str,
        list_id: &str,
        list_item_id: &str,
    ) -> Result<String> {
        let state = lock(&self.state);
        if state.library_by_list(site_id, list_id).is_none() {
            return Err(BrokerError::ContainerMissing(format!("{}/{}", site_id, list_id)));
        }
        let ids = ObjectIdentifiers::from_repository(site_id, list_id, list_item_id);
        state.document(&ids).map(|d| d.ids.drive_item_id.clone())
    }

    async fn get_repository_coordinates(
        &self,
        drive_id: &str,
        drive_item_id: &str,
    ) -> Result<RepositoryCoordinates> {
        let state = lock(&self.state);
        let document = state.document(&ObjectIdentifiers::from_storage(drive_id, drive_item_id))?;
        Ok(RepositoryCoordinates {
            site_id: document.ids.site_id.clone(),
            list_id: document.ids.list_id.clone(),
            list_item_id: document.ids.list_item_id.clone(),
        })
    }

    async fn get_change_feed_page(
        &self,
        drive_id: &str,
        cursor: Option<&str>,
    ) -> Result<ChangeFeedPage> {
        let state = lock(&self.state);
        if state.fail_feed {
            return Err(BrokerError::Transport("change feed unavailable".to_string()));
        }
        if state.library_by_drive(drive_id).is_none() {
            return Err(BrokerError::ContainerMissing(drive_id.to_string()));
        }
        let log = state.feeds.get(drive_id).map(Vec::as_slice).unwrap_or(&[]);
        let start = Self::parse_offset(cursor.unwrap_or_default(), log.len())?;
        let end = (start + self.page_size).min(log.len());
        Ok(ChangeFeedPage {
            items: log[start..end].to_vec(),
            cursor: Some(end.to_string()),
            has_more: end < log.len(),
        })
    }

    async fn get_list_changes(
        &self,
        _site_url: &str,
        list_id: &str,
        change_token: &str,
    ) -> Result<ListChangesPage> {
        let mut state = lock(&self.state);
        state.list_change_tokens.push(change_token.to_string());
        let log = state
            .list_changes
            .get(&list_id.to_lowercase())
            .cloned()
            .unwrap_or_default();
        let start = Self::parse_offset(change_token, log.len())?;
        let end = (start + self.page_size).min(log.len());
        Ok(ListChangesPage {
            changes: log[start..end].to_vec(),
            new_token: end.to_string(),
            has_more: end < log.len(),
        })
    }

    async fn get_item_fields(&self, ids: &ObjectIdentifiers) -> Result<Map<String, Value>> {
        Ok(lock(&self.state).document(ids)?.fields.clone())
    }

    async fn download_content(&self, ids: &ObjectIdentifiers) -> Result<(String, Vec<u8>)> {
        let state = lock(&self.state);
        if state.fail_downloads {
            return Err(BrokerError::Transport("download failed".to_string()));
        }
        let document = state.document(ids)?;
        Ok((document.name.clone(), document.content.clone()))
    }

    async fn update_item_fields(
        &self,
        ids: &ObjectIdentifiers,
        fields: &Map<String, Value>,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        let key = state.document(ids)?.ids.drive_item_id.clone();
        if let Some(document) = state.documents.get_mut(&key) {
            document
                .fields
                .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
            document.modified_at = Utc::now();
        }
        state.record_change(&key, ChangeType::Update);
        Ok(())
    }

    async fn move_item(
        &self,
        ids: &ObjectIdentifiers,
        destination: &DestinationFolder,
    ) -> Result<ObjectIdentifiers> {
        let mut state = lock(&self.state);
        let key = state.document(ids)?.ids.drive_item_id.clone();
        let library = state
            .library_by_drive(&destination.drive_id)
            .cloned()
            .ok_or_else(|| BrokerError::ContainerMissing(destination.drive_id.clone()))?;
        let document = state
            .documents
            .get_mut(&key)
            .ok_or_else(|| BrokerError::ItemMissing(key.clone()))?;
        document.ids.site_id = library.site_id;
        document.ids.list_id = library.list_id;
        document.ids.drive_id = library.drive_id;
        Ok(ObjectIdentifiers {
            object_id: ids.object_id.clone(),
            external_reference_list_id: ids.external_reference_list_id.clone(),
            ..document.ids.clone()
        })
    }

    async fn create_document(
        &self,
        site_id: &str,
        list_id: &str,
        file_name: &str,
        content: &[u8],
        fields: &Map<String, Value>,
    ) -> Result<ObjectIdentifiers> {
        let mut state = lock(&self.state);
        let drive_id = state
            .library_by_list(site_id, list_id)
            .map(|l| l.drive_id.clone())
            .ok_or_else(|| BrokerError::ContainerMissing(format!("{}/{}", site_id, list_id)))?;
        state.insert_document(&drive_id, file_name, content, fields.clone(), Utc::now())
    }

    async fn delete_document(&self, ids: &ObjectIdentifiers) -> Result<()> {
        let mut state = lock(&self.state);
        let key = state.document(ids)?.ids.drive_item_id.clone();
        if let Some(document) = state.documents.get_mut(&key) {
            document.deleted = true;
            document.modified_at = Utc::now();
        }
        state.record_change(&key, ChangeType::Delete);
        Ok(())
    }

    async fn create_subscription(
        &self,
        _site_url: &str,
        list_id: &str,
        notification_url: &str,
        expiration: DateTime<Utc>,
    ) -> Result<CreatedSubscription> {
        let id = uuid::Uuid::new_v4().to_string();
        lock(&self.state).subscriptions.insert(
            id.clone(),
            Subscription {
                list_id: list_id.to_string(),
                notification_url: notification_url.to_string(),
                expiration,
            },
        );
        Ok(CreatedSubscription {
            subscription_id: id,
            expiration_date_time: expiration,
        })
    }

    async fn renew_subscription(
        &self,
        _site_url: &str,
        _list_id: &str,
        subscription_id: &str,
        expiration: DateTime<Utc>,
    ) -> Result<CreatedSubscription> {
        let mut state = lock(&self.state);
        let subscription = state
            .subscriptions
            .get_mut(subscription_id)
            .ok_or_else(|| BrokerError::NotFound(format!("subscription {}", subscription_id)))?;
        subscription.expiration = expiration;
        state.renewals += 1;
        Ok(CreatedSubscription {
            subscription_id: subscription_id.to_string(),
            expiration_date_time: expiration,
        })
    }
}

// =============================================================================
// Identity table and sequence
// =============================================================================

/// Identity table. Like the remote table, the natural-key index holds whole records while the
/// storage index points at object ids.
#[derive(Default)]
pub struct MemoryIdentityStore {
    by_id: DashMap<String, ObjectIdentifiers>,
    by_natural: DashMap<NaturalKey, ObjectIdentifiers>,
    by_storage: DashMap<StorageKey, String>,
    hide_natural_keys: AtomicBool,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make natural-key reads miss while inserts still see every key, as when another process
    /// registers a key between this process's read and write.
    pub fn hide_natural_key_lookups(&self, hide: bool) {
        self.hide_natural_keys.store(hide, Ordering::SeqCst);
    }

    /// Drop only the by-id row of an object, as left behind by an insert that stopped after
    /// claiming the natural key.
    pub fn drop_object_row(&self, object_id: &str) {
        self.by_id.remove(object_id);
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn all(&self) -> Vec<ObjectIdentifiers> {
        let mut records: Vec<_> = self.by_id.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.object_id.cmp(&b.object_id));
        records
    }

    fn index(&self, ids: &ObjectIdentifiers) {
        if let Some(key) = ids.storage_key() {
            self.by_storage.insert(key, ids.object_id.clone());
        }
        self.by_id.insert(ids.object_id.clone(), ids.clone());
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn get_by_object_id(&self, object_id: &str) -> Result<Option<ObjectIdentifiers>> {
        Ok(self.by_id.get(object_id).map(|r| r.value().clone()))
    }

    async fn get_by_natural_key(&self, key: &NaturalKey) -> Result<Option<ObjectIdentifiers>> {
        if self.hide_natural_keys.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(self.by_natural.get(key).map(|r| r.value().clone()))
    }

    async fn get_by_storage_key(&self, key: &StorageKey) -> Result<Option<ObjectIdentifiers>> {
        let object_id = self.by_storage.get(key).map(|r| r.value().clone());
        Ok(object_id.and_then(|id| self.by_id.get(&id).map(|r| r.value().clone())))
    }

    async fn insert(&self, ids: &ObjectIdentifiers) -> Result<InsertOutcome> {
        let key = ids.natural_key().ok_or_else(|| {
            BrokerError::InvalidInput("identity record without repository triple".to_string())
        })?;
        match self.by_natural.entry(key) {
            Entry::Occupied(existing) => Ok(InsertOutcome::Existing(existing.get().clone())),
            Entry::Vacant(slot) => {
                slot.insert(ids.clone());
                self.index(ids);
                Ok(InsertOutcome::Inserted)
            }
        }
    }

    async fn upsert(&self, ids: &ObjectIdentifiers) -> Result<()> {
        if let Some(key) = ids.natural_key() {
            self.by_natural.insert(key, ids.clone());
        }
        self.index(ids);
        Ok(())
    }

    async fn delete_keys(
        &self,
        object_id: &str,
        natural: Option<&NaturalKey>,
        storage: Option<&StorageKey>,
    ) -> Result<()> {
        if let Some(key) = natural {
            self.by_natural.remove_if(key, |_, row| row.object_id == object_id);
        }
        if let Some(key) = storage {
            self.by_storage.remove_if(key, |_, id| id == object_id);
        }
        Ok(())
    }

    async fn delete(&self, ids: &ObjectIdentifiers) -> Result<()> {
        self.delete_keys(
            &ids.object_id,
            ids.natural_key().as_ref(),
            ids.storage_key().as_ref(),
        )
        .await?;
        self.by_id.remove(&ids.object_id);
        Ok(())
    }
}

pub struct MemorySequenceCounter {
    value: AtomicU64,
    fail: AtomicBool,
}

impl MemorySequenceCounter {
    pub fn starting_at(value: u64) -> Self {
        Self {
            value: AtomicU64::new(value),
            fail: AtomicBool::new(false),
        }
    }

    /// Make increments fail as if the compare-and-swap kept losing.
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

impl Default for MemorySequenceCounter {
    fn default() -> Self {
        Self::starting_at(0)
    }
}

#[async_trait]
impl SequenceCounter for MemorySequenceCounter {
    async fn increment(&self) -> Result<u64> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Conflict("sequence counter contended".to_string()));
        }
        Ok(self.value.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn current(&self) -> Result<u64> {
        Ok(self.value.load(Ordering::SeqCst))
    }
}

// =============================================================================
// Resumption state
// =============================================================================

#[derive(Default)]
pub struct MemoryCheckpointStore(DashMap<FeedType, SyncCheckpoint>);

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_checkpoint(self, feed: FeedType, checkpoint: SyncCheckpoint) -> Self {
        self.0.insert(feed, checkpoint);
        self
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, feed: FeedType) -> Result<SyncCheckpoint> {
        Ok(self.0.get(&feed).map(|r| r.value().clone()).unwrap_or_default())
    }

    async fn save(&self, feed: FeedType, checkpoint: &SyncCheckpoint) -> Result<()> {
        self.0.insert(feed, checkpoint.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemorySubscriptionStore(DashMap<String, WebhookSubscriptionState>);

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn load(&self, container_id: &str) -> Result<Option<WebhookSubscriptionState>> {
        Ok(self
            .0
            .get(&container_id.to_lowercase())
            .map(|r| r.value().clone()))
    }

    async fn save(&self, state: &WebhookSubscriptionState) -> Result<()> {
        self.0
            .insert(state.container_id.to_lowercase(), state.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryPublicationStore(DashMap<String, PublicationQueueEntry>);

impl MemoryPublicationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PublicationStore for MemoryPublicationStore {
    async fn put(&self, entry: &PublicationQueueEntry) -> Result<()> {
        self.0.insert(entry.object_id.clone(), entry.clone());
        Ok(())
    }

    async fn remove(&self, object_id: &str) -> Result<bool> {
        Ok(self.0.remove(object_id).is_some())
    }

    async fn list(&self) -> Result<Vec<PublicationQueueEntry>> {
        let mut entries: Vec<_> = self.0.iter().map(|r| r.value().clone()).collect();
        entries.sort_by(|a, b| {
            a.publication_date
                .cmp(&b.publication_date)
                .then_with(|| a.object_id.cmp(&b.object_id))
        });
        Ok(entries)
    }
}

// =============================================================================
// Export targets and side channels
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct StoredBlob {
    pub data: Vec<u8>,
    pub content_type: String,
    pub tag: String,
}

#[derive(Default)]
pub struct MemoryContentStore {
    blobs: DashMap<(String, String), StoredBlob>,
    fail_puts: AtomicBool,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, container: &str, name: &str) -> Option<StoredBlob> {
        self.blobs
            .get(&(container.to_string(), name.to_string()))
            .map(|r| r.value().clone())
    }

    /// Sorted blob names of a container.
    pub fn names(&self, container: &str) -> Vec<String> {
        let mut names: Vec<String> = self
            .blobs
            .iter()
            .filter(|r| r.key().0 == container)
            .map(|r| r.key().1.clone())
            .collect();
        names.sort();
        names
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn put(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
        content_type: &str,
        tag: &str,
    ) -> Result<()> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("blob store unavailable".to_string()));
        }
        self.blobs.insert(
            (container.to_string(), name.to_string()),
            StoredBlob {
                data: data.to_vec(),
                content_type: content_type.to_string(),
                tag: tag.to_string(),
            },
        );
        Ok(())
    }

    async fn delete_by_tag(&self, container: &str, tag: &str) -> Result<usize> {
        let before = self.blobs.len();
        self.blobs
            .retain(|(blob_container, _), blob| !(blob_container == container && blob.tag == tag));
        Ok(before - self.blobs.len())
    }
}

#[derive(Default)]
pub struct RecordingCallbackSink {
    events: Mutex<Vec<CallbackEvent>>,
    fail: AtomicBool,
}

impl RecordingCallbackSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CallbackEvent> {
        lock(&self.events).clone()
    }

    /// Reject every event (after recording it).
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl CallbackSink for RecordingCallbackSink {
    async fn send(&self, event: &CallbackEvent) -> Result<()> {
        lock(&self.events).push(event.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(BrokerError::Transport("callback endpoint unavailable".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier(Mutex<Vec<AuthorNotice>>);

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<AuthorNotice> {
        lock(&self.0).clone()
    }
}

#[async_trait]
impl AuthorNotifier for RecordingNotifier {
    async fn notify(&self, notice: &AuthorNotice) -> Result<()> {
        lock(&self.0).push(notice.clone());
        Ok(())
    }
}

/// FIFO notification queue. Received messages stay queued until acknowledged or dead-lettered.
#[derive(Default)]
pub struct MemoryNotificationQueue {
    pending: Mutex<Vec<QueuedMessage>>,
    dead: Mutex<Vec<QueuedMessage>>,
}

impl MemoryNotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    pub fn dead_letters(&self) -> Vec<QueuedMessage> {
        lock(&self.dead).clone()
    }
}

#[async_trait]
impl NotificationQueue for MemoryNotificationQueue {
    async fn enqueue(&self, batch: &NotificationBatch) -> Result<String> {
        let receipt = uuid::Uuid::new_v4().to_string();
        lock(&self.pending).push(QueuedMessage {
            receipt: receipt.clone(),
            enqueued_at: Utc::now(),
            deliveries: 0,
            batch: batch.clone(),
        });
        Ok(receipt)
    }

    async fn receive(&self, max: usize) -> Result<Vec<QueuedMessage>> {
        let mut pending = lock(&self.pending);
        Ok(pending
            .iter_mut()
            .take(max)
            .map(|message| {
                message.deliveries += 1;
                message.clone()
            })
            .collect())
    }

    async fn ack(&self, receipt: &str) -> Result<()> {
        lock(&self.pending).retain(|m| m.receipt != receipt);
        Ok(())
    }

    async fn dead_letter(&self, receipt: &str) -> Result<()> {
        let mut pending = lock(&self.pending);
        if let Some(position) = pending.iter().position(|m| m.receipt == receipt) {
            let message = pending.remove(position);
            lock(&self.dead).push(message);
        }
        Ok(())
    }
}
