#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use docbroker_core::SubscriptionStore;
use docbroker_sync::memory::{
    MemoryCheckpointStore, MemoryContentStore, MemoryIdentityStore, MemoryNotificationQueue,
    MemoryPublicationStore, MemoryRepository, MemorySequenceCounter, MemorySubscriptionStore,
    RecordingCallbackSink, RecordingNotifier,
};
use docbroker_sync::{
    fixed_clock, Backends, BrokerContext, BrokerSettings, DeltaSyncEngine, DocumentRegistrar,
    WebhookPipeline,
};
use serde_json::{json, Map, Value};

pub const SITE: &str = "site-1";
pub const LIST: &str = "list-1";
pub const DRIVE: &str = "driveA";
pub const PUBLIC_LIST: &str = "list-public";
pub const PUBLIC_DRIVE: &str = "drivePublic";

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

pub fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

pub fn settings() -> BrokerSettings {
    let raw = json!({
        "objectIdPrefix": "ZLD",
        "contentContainer": "documents",
        "metadataContainer": "metadata",
        "containers": [{
            "key": "records",
            "siteId": SITE,
            "listId": LIST,
            "driveId": DRIVE,
            "siteUrl": "https://contoso.sharepoint.com/sites/records",
            "externalReferenceListId": "refs-1"
        }],
        "fields": [
            {"name": "Title", "column": "Title", "kind": "text", "required": true, "public": true},
            {"name": "PublicationDate", "column": "PubDate", "kind": "date_time", "public": true},
            {"name": "Classification", "column": "Klass", "kind": "lookup"},
            {"name": "Author", "column": "Owner", "kind": "person"},
            {"name": "MetadataComplete", "column": "Complete", "kind": "boolean"},
            {"name": "ExportStatus", "column": "Status", "kind": "text"},
            {"name": "ExportMessage", "column": "StatusMessage", "kind": "text"}
        ],
        "classificationDestinations": {
            "Public": {"driveId": PUBLIC_DRIVE, "folderId": "root"}
        },
        "webhook": {
            "notificationUrl": "https://broker.example.com/webhooks/notifications",
            "clientState": "secret-state"
        }
    });
    BrokerSettings::from_json(&raw.to_string()).unwrap()
}

pub fn fields(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Every backend in memory, plus a broker context over them.
pub struct Harness {
    pub repository: Arc<MemoryRepository>,
    pub identities: Arc<MemoryIdentityStore>,
    pub counter: Arc<MemorySequenceCounter>,
    pub publications: Arc<MemoryPublicationStore>,
    pub content: Arc<MemoryContentStore>,
    pub callbacks: Arc<RecordingCallbackSink>,
    pub checkpoints: Arc<MemoryCheckpointStore>,
    pub subscriptions: Arc<MemorySubscriptionStore>,
    pub queue: Arc<MemoryNotificationQueue>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: BrokerContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(MemoryRepository::new(), 0)
    }

    pub fn with_sequence(start: u64) -> Self {
        Self::build(MemoryRepository::new(), start)
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self::build(MemoryRepository::with_page_size(page_size), 0)
    }

    fn build(repository: MemoryRepository, start: u64) -> Self {
        repository.add_library(SITE, LIST, DRIVE);
        repository.add_library(SITE, PUBLIC_LIST, PUBLIC_DRIVE);

        let repository = Arc::new(repository);
        let identities = Arc::new(MemoryIdentityStore::new());
        let counter = Arc::new(MemorySequenceCounter::starting_at(start));
        let publications = Arc::new(MemoryPublicationStore::new());
        let content = Arc::new(MemoryContentStore::new());
        let callbacks = Arc::new(RecordingCallbackSink::new());

        Self {
            ctx: BrokerContext::new(
                settings(),
                Backends {
                    repository: repository.clone(),
                    identities: identities.clone(),
                    counter: counter.clone(),
                    publications: publications.clone(),
                    content: content.clone(),
                    callbacks: callbacks.clone(),
                },
                fixed_clock(now()),
            ),
            repository,
            identities,
            counter,
            publications,
            content,
            callbacks,
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
            subscriptions: Arc::new(MemorySubscriptionStore::new()),
            queue: Arc::new(MemoryNotificationQueue::new()),
            notifier: Arc::new(RecordingNotifier::new()),
        }
    }

    /// A context over the same backends with the clock fixed at `at`.
    pub fn context_at(&self, at: DateTime<Utc>) -> BrokerContext {
        BrokerContext::new(settings(), self.backends(), fixed_clock(at))
    }

    pub fn backends(&self) -> Backends {
        Backends {
            repository: self.repository.clone(),
            identities: self.identities.clone(),
            counter: self.counter.clone(),
            publications: self.publications.clone(),
            content: self.content.clone(),
            callbacks: self.callbacks.clone(),
        }
    }

    pub fn engine(&self) -> DeltaSyncEngine {
        DeltaSyncEngine::new(self.ctx.clone(), self.checkpoints.clone())
    }

    pub fn pipeline(&self) -> WebhookPipeline {
        WebhookPipeline::new(
            self.ctx.clone(),
            self.subscriptions.clone(),
            self.queue.clone(),
            self.notifier.clone(),
        )
    }

    /// A pipeline over another context and subscription store, sharing the harness queue.
    pub fn pipeline_with(
        &self,
        ctx: BrokerContext,
        subscriptions: Arc<dyn SubscriptionStore>,
    ) -> WebhookPipeline {
        WebhookPipeline::new(
            ctx,
            subscriptions,
            self.queue.clone(),
            self.notifier.clone(),
        )
    }

    pub fn registrar(&self) -> DocumentRegistrar {
        DocumentRegistrar::new(self.ctx.clone())
    }
}
