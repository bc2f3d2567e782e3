//! Cloudflare backends for docbroker.
//!
//! - R2 (S3-compatible, ETag CAS): identity table, object-id sequence, publication entries,
//!   exported content and the durable notification queue
//! - KV (REST API v4): feed checkpoints and webhook subscription state

mod content;
mod kv;
mod queue;
mod r2;
mod tables;

pub use content::R2ContentStore;
pub use kv::{KvCheckpointStore, KvClient, KvSubscriptionStore};
pub use queue::R2NotificationQueue;
pub use r2::R2Bucket;
pub use tables::{R2IdentityStore, R2PublicationStore, R2SequenceCounter};
