use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Blob storage for exported content and side-cars.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Store a blob under `name` in `container`, tagged with the owning object id.
    async fn put(
        &self,
        container: &str,
        name: &str,
        data: &[u8],
        content_type: &str,
        tag: &str,
    ) -> Result<()>;

    /// Delete every blob in `container` tagged with `tag`. Returns the number deleted.
    async fn delete_by_tag(&self, container: &str, tag: &str) -> Result<usize>;
}

/// A change announced to the third-party callback endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackEvent {
    Create {
        object_id: String,
        body: Map<String, Value>,
    },
    Update {
        object_id: String,
        body: Map<String, Value>,
    },
    Delete {
        object_id: String,
    },
}

impl CallbackEvent {
    pub fn object_id(&self) -> &str {
        match self {
            CallbackEvent::Create { object_id, .. }
            | CallbackEvent::Update { object_id, .. }
            | CallbackEvent::Delete { object_id } => object_id,
        }
    }

    /// Path segment of the callback route.
    pub fn action(&self) -> &'static str {
        match self {
            CallbackEvent::Create { .. } => "create",
            CallbackEvent::Update { .. } => "update",
            CallbackEvent::Delete { .. } => "delete",
        }
    }
}

/// Fire-and-forget notification of the third party. Callers log failures and move on.
#[async_trait]
pub trait CallbackSink: Send + Sync {
    async fn send(&self, event: &CallbackEvent) -> Result<()>;
}

/// Outcome message for a document's author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorNotice {
    pub recipient: String,
    pub object_id: String,
    pub document_name: String,
    pub succeeded: bool,
    pub message: String,
}

#[async_trait]
pub trait AuthorNotifier: Send + Sync {
    async fn notify(&self, notice: &AuthorNotice) -> Result<()>;
}
