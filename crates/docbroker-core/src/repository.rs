use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::feed::{ChangeFeedPage, ListChangesPage};
use crate::ids::ObjectIdentifiers;

/// Repository-native coordinates of a drive item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryCoordinates {
    pub site_id: String,
    pub list_id: String,
    pub list_item_id: String,
}

/// Target folder of a classification-driven move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationFolder {
    pub drive_id: String,
    pub folder_id: String,
}

/// A push subscription as created or renewed by the repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSubscription {
    pub subscription_id: String,
    pub expiration_date_time: DateTime<Utc>,
}

/// Access to the remote document repository.
///
/// Not-found conditions are reported as `ContainerMissing` / `ItemMissing` / `NotFound`, never as
/// transport errors, so callers can skip the affected item.
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Drive id backing a document library.
    async fn get_container_id(&self, site_id: &str, list_id: &str) -> Result<String>;

    /// Drive item id of a list item.
    async fn get_item_id(&self, site_id: &str, list_id: &str, list_item_id: &str)
        -> Result<String>;

    /// Repository triple of a drive item, read from its cross-reference metadata.
    async fn get_repository_coordinates(
        &self,
        drive_id: &str,
        drive_item_id: &str,
    ) -> Result<RepositoryCoordinates>;

    /// One page of a drive's change feed. `cursor` is a stored delta token, a next-page cursor
    /// from the previous page, or `None` for a first full enumeration.
    async fn get_change_feed_page(
        &self,
        drive_id: &str,
        cursor: Option<&str>,
    ) -> Result<ChangeFeedPage>;

    /// Item changes of a list since `change_token` (empty means full history).
    ///
    /// Fails with `InvalidToken` when the repository rejects the token as stale, out of range or
    /// malformed.
    async fn get_list_changes(
        &self,
        site_url: &str,
        list_id: &str,
        change_token: &str,
    ) -> Result<ListChangesPage>;

    /// Raw list item fields, keyed by column name.
    async fn get_item_fields(&self, ids: &ObjectIdentifiers) -> Result<Map<String, Value>>;

    /// File name and content of a document.
    async fn download_content(&self, ids: &ObjectIdentifiers) -> Result<(String, Vec<u8>)>;

    async fn update_item_fields(
        &self,
        ids: &ObjectIdentifiers,
        fields: &Map<String, Value>,
    ) -> Result<()>;

    /// Move a document into another folder, returning its (possibly new) storage pair.
    async fn move_item(
        &self,
        ids: &ObjectIdentifiers,
        destination: &DestinationFolder,
    ) -> Result<ObjectIdentifiers>;

    /// Upload a new document into a library and return its coordinates (triple and pair).
    async fn create_document(
        &self,
        site_id: &str,
        list_id: &str,
        file_name: &str,
        content: &[u8],
        fields: &Map<String, Value>,
    ) -> Result<ObjectIdentifiers>;

    async fn delete_document(&self, ids: &ObjectIdentifiers) -> Result<()>;

    async fn create_subscription(
        &self,
        site_url: &str,
        list_id: &str,
        notification_url: &str,
        expiration: DateTime<Utc>,
    ) -> Result<CreatedSubscription>;

    async fn renew_subscription(
        &self,
        site_url: &str,
        list_id: &str,
        subscription_id: &str,
        expiration: DateTime<Utc>,
    ) -> Result<CreatedSubscription>;
}
