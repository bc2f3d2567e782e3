//! Core traits and types for docbroker.
//!
//! This crate defines the contracts shared between the synchronization engine and its backends:
//! - `RepositoryClient`: the remote document repository (sites, lists, drives, change feeds)
//! - `IdentityStore` / `SequenceCounter`: object identity records and the id sequence
//! - `CheckpointStore` / `SubscriptionStore`: resumption state for feeds and webhooks
//! - `PublicationStore`: deferred-publication entries
//! - `ContentStore`, `CallbackSink`, `AuthorNotifier`: export targets and side channels
//! - `NotificationQueue`: durable buffer between webhook intake and processing

mod checkpoint;
mod content;
mod error;
mod feed;
mod ids;
mod metadata;
mod queue;
mod repository;
mod store;

pub use checkpoint::{CheckpointStore, SyncCheckpoint, TokenMap};
pub use content::{AuthorNotice, AuthorNotifier, CallbackEvent, CallbackSink, ContentStore};
pub use error::{BrokerError, Result};
pub use feed::{ChangeFeedItem, ChangeFeedPage, ChangeType, FeedType, ListChange, ListChangesPage};
pub use ids::{Coordinate, NaturalKey, ObjectIdentifiers, StorageKey};
pub use metadata::{
    DocumentMetadata, FieldDescriptor, FieldKind, FieldMapping, FieldValue, WellKnownField,
};
pub use queue::{ChangeNotification, NotificationBatch, NotificationQueue, QueuedMessage};
pub use repository::{
    CreatedSubscription, DestinationFolder, RepositoryClient, RepositoryCoordinates,
};
pub use store::{
    IdentityStore, InsertOutcome, PublicationQueueEntry, PublicationStore, SequenceCounter,
    SubscriptionStore, WebhookSubscriptionState,
};
