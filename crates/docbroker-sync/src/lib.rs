//! Synchronization engine for docbroker.
//!
//! Ties the core contracts together into the broker's workflows:
//! - [`IdentityResolver`] and [`ObjectIdMinter`]: coordinate completion and object-id assignment
//! - [`DeltaSyncEngine`]: New/Updated/Deleted passes over the drives' change feeds
//! - [`PublicationQueue`]: exports deferred until their publication date
//! - [`WebhookPipeline`]: push subscriptions, notification intake and list-change processing
//! - [`DocumentRegistrar`]: upstream creation and whole-object deletion
//!
//! [`memory`] provides in-memory implementations of every backend trait.

mod context;
mod delta;
mod export;
pub mod memory;
mod minter;
mod publication;
mod registration;
mod resolver;
mod settings;
mod webhook;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

pub use context::{Backends, BrokerContext};
pub use delta::{classify, DeltaSyncEngine, SyncReport};
pub use export::{ExportKind, Exporter};
pub use minter::{Minted, ObjectIdMinter};
pub use publication::{DrainReport, PublicationQueue};
pub use registration::DocumentRegistrar;
pub use resolver::IdentityResolver;
pub use settings::{BrokerSettings, MonitoredContainer, ReferenceMap, WebhookSettings};
pub use webhook::{collapse_changes, IntakeOutcome, WebhookPipeline, WebhookReport};

/// Source of "now". Injected so scheduling decisions can be tested.
pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub fn system_clock() -> Clock {
    Arc::new(Utc::now)
}

pub fn fixed_clock(at: DateTime<Utc>) -> Clock {
    Arc::new(move || at)
}

/// Result of processing one document.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ItemOutcome {
    Exported,
    /// Export postponed to the publication date.
    Deferred,
    Skipped(String),
}

/// A document that failed to process, with the reason.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedItem {
    pub id: String,
    pub error: String,
}
