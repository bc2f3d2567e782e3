use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use docbroker_core::{
    BrokerError, ChangeFeedItem, ChangeFeedPage, ChangeType, Coordinate, CreatedSubscription,
    DestinationFolder, ListChange, ListChangesPage, ObjectIdentifiers, RepositoryClient,
    RepositoryCoordinates, Result,
};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::Url;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, instrument};

use crate::client::{read_json, sharepoint_scope, transport, GraphClient, GRAPH_SCOPE};

/// Page size of SharePoint change queries.
const CHANGE_ROW_LIMIT: usize = 1000;

const ODATA_NOMETADATA: &str = "application/json;odata=nometadata";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    folder: Option<Value>,
    #[serde(default)]
    deleted: Option<Value>,
    #[serde(default)]
    created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    parent_reference: Option<ParentReference>,
    #[serde(default)]
    sharepoint_ids: Option<SharepointIds>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentReference {
    #[serde(default)]
    drive_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SharepointIds {
    #[serde(default)]
    site_id: Option<String>,
    #[serde(default)]
    web_id: Option<String>,
    #[serde(default)]
    site_url: Option<String>,
    #[serde(default)]
    list_id: Option<String>,
    #[serde(default)]
    list_item_id: Option<String>,
}

impl SharepointIds {
    /// Graph addresses sites by the compound id `{hostname},{siteId},{webId}`.
    fn compound_site_id(&self) -> Option<String> {
        let site_id = self.site_id.as_deref()?;
        let host = self
            .site_url
            .as_deref()
            .and_then(|u| Url::parse(u).ok())
            .and_then(|u| u.host_str().map(str::to_string));
        match (host, self.web_id.as_deref()) {
            (Some(host), Some(web_id)) => Some(format!("{},{},{}", host, site_id, web_id)),
            _ => Some(site_id.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeltaResponse {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink", default)]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink", default)]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpChange {
    #[serde(default)]
    change_token: Option<SpChangeToken>,
    change_type: i64,
    #[serde(default)]
    item_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct SpChangeToken {
    string_value: String,
}

#[derive(Debug, Deserialize)]
struct SpChanges {
    #[serde(default)]
    value: Vec<SpChange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SpSubscription {
    id: String,
    expiration_date_time: DateTime<Utc>,
}

/// Repository adapter over Microsoft Graph (drives, lists) and SharePoint REST (change queries,
/// webhooks).
pub struct GraphRepository {
    client: Arc<GraphClient>,
}

impl GraphRepository {
    pub fn new(client: Arc<GraphClient>) -> Self {
        Self { client }
    }

    fn triple(ids: &ObjectIdentifiers) -> Result<(&str, &str, &str)> {
        for (coordinate, value) in [
            (Coordinate::SiteId, &ids.site_id),
            (Coordinate::ListId, &ids.list_id),
            (Coordinate::ListItemId, &ids.list_item_id),
        ] {
            if value.is_empty() {
                return Err(BrokerError::MissingCoordinate(coordinate));
            }
        }
        Ok((
            ids.site_id.as_str(),
            ids.list_id.as_str(),
            ids.list_item_id.as_str(),
        ))
    }

    fn pair(ids: &ObjectIdentifiers) -> Result<(&str, &str)> {
        if ids.drive_id.is_empty() {
            return Err(BrokerError::MissingCoordinate(Coordinate::DriveId));
        }
        if ids.drive_item_id.is_empty() {
            return Err(BrokerError::MissingCoordinate(Coordinate::DriveItemId));
        }
        Ok((ids.drive_id.as_str(), ids.drive_item_id.as_str()))
    }

    fn fields_url(&self, site_id: &str, list_id: &str, list_item_id: &str) -> String {
        self.client.graph_url(&format!(
            "/sites/{}/lists/{}/items/{}/fields",
            site_id, list_id, list_item_id
        ))
    }

    fn list_url(site_url: &str, list_id: &str) -> String {
        format!(
            "{}/_api/web/lists('{}')",
            site_url.trim_end_matches('/'),
            list_id
        )
    }

    fn delta_url(&self, drive_id: &str, cursor: Option<&str>) -> String {
        match cursor {
            // Full links are accepted as cursors too.
            Some(link) if link.starts_with("http") => link.to_string(),
            Some(token) => self.client.graph_url(&format!(
                "/drives/{}/root/delta?token={}",
                drive_id,
                urlencoding::encode(token)
            )),
            None => self
                .client
                .graph_url(&format!("/drives/{}/root/delta", drive_id)),
        }
    }
}

/// The `token` query parameter of a delta or next link, or the link itself when it has none.
fn cursor_of(link: &str) -> String {
    Url::parse(link)
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
        })
        .unwrap_or_else(|| link.to_string())
}

fn feed_item(drive_id: &str, item: DriveItem) -> ChangeFeedItem {
    let modified_at = item
        .last_modified_date_time
        .or(item.created_date_time)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    ChangeFeedItem {
        container_id: item
            .parent_reference
            .and_then(|p| p.drive_id)
            .unwrap_or_else(|| drive_id.to_string()),
        created_at: item.created_date_time.unwrap_or(modified_at),
        modified_at,
        is_folder: item.folder.is_some(),
        is_deleted: item.deleted.is_some(),
        name: item.name,
        id: item.id,
    }
}

fn change_type(code: i64) -> ChangeType {
    match code {
        1 => ChangeType::Add,
        2 => ChangeType::Update,
        3 => ChangeType::Delete,
        _ => ChangeType::Other,
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl RepositoryClient for GraphRepository {
    #[instrument(skip(self), level = "debug")]
    async fn get_container_id(&self, site_id: &str, list_id: &str) -> Result<String> {
        let url = self
            .client
            .graph_url(&format!("/sites/{}/lists/{}/drive?$select=id", site_id, list_id));
        let drive: Option<IdOnly> = self
            .client
            .send_json(GRAPH_SCOPE, self.client.http().get(&url))
            .await?;
        drive
            .map(|d| d.id)
            .ok_or_else(|| BrokerError::ContainerMissing(format!("{}/{}", site_id, list_id)))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_item_id(
        &self,
        site_id: &str,
        list_id: &str,
        list_item_id: &str,
    ) -> Result<String> {
        let url = self.client.graph_url(&format!(
            "/sites/{}/lists/{}/items/{}/driveItem?$select=id",
            site_id, list_id, list_item_id
        ));
        let item: Option<IdOnly> = self
            .client
            .send_json(GRAPH_SCOPE, self.client.http().get(&url))
            .await?;
        item.map(|i| i.id)
            .ok_or_else(|| BrokerError::ItemMissing(list_item_id.to_string()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_repository_coordinates(
        &self,
        drive_id: &str,
        drive_item_id: &str,
    ) -> Result<RepositoryCoordinates> {
        let url = self.client.graph_url(&format!(
            "/drives/{}/items/{}?$select=id,sharepointIds",
            drive_id, drive_item_id
        ));
        let item: DriveItem = self
            .client
            .send_json(GRAPH_SCOPE, self.client.http().get(&url))
            .await?
            .ok_or_else(|| BrokerError::ItemMissing(drive_item_id.to_string()))?;

        let ids = item.sharepoint_ids.unwrap_or_default();
        let missing = |coordinate| BrokerError::MissingCoordinate(coordinate);
        Ok(RepositoryCoordinates {
            site_id: ids.compound_site_id().ok_or_else(|| missing(Coordinate::SiteId))?,
            list_id: ids.list_id.clone().ok_or_else(|| missing(Coordinate::ListId))?,
            list_item_id: ids
                .list_item_id
                .clone()
                .ok_or_else(|| missing(Coordinate::ListItemId))?,
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_change_feed_page(
        &self,
        drive_id: &str,
        cursor: Option<&str>,
    ) -> Result<ChangeFeedPage> {
        let url = self.delta_url(drive_id, cursor);
        let page: DeltaResponse = self
            .client
            .send_json(GRAPH_SCOPE, self.client.http().get(&url))
            .await?
            .ok_or_else(|| BrokerError::ContainerMissing(drive_id.to_string()))?;

        let items: Vec<ChangeFeedItem> = page
            .value
            .into_iter()
            .map(|item| feed_item(drive_id, item))
            .collect();
        debug!("Delta page of {}: {} item(s)", drive_id, items.len());

        Ok(match (page.next_link, page.delta_link) {
            (Some(next), _) => ChangeFeedPage {
                items,
                cursor: Some(cursor_of(&next)),
                has_more: true,
            },
            (None, delta) => ChangeFeedPage {
                items,
                cursor: delta.as_deref().map(cursor_of),
                has_more: false,
            },
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_list_changes(
        &self,
        site_url: &str,
        list_id: &str,
        change_token: &str,
    ) -> Result<ListChangesPage> {
        let scope = sharepoint_scope(site_url)?;
        let url = format!(
            "{}/_api/web/lists(guid'{}')/GetChanges",
            site_url.trim_end_matches('/'),
            list_id
        );
        let mut query = json!({
            "__metadata": { "type": "SP.ChangeQuery" },
            "Add": true,
            "Update": true,
            "DeleteObject": true,
            "Item": true,
            "RowLimit": CHANGE_ROW_LIMIT,
        });
        if !change_token.is_empty() {
            query["ChangeTokenStart"] = json!({
                "__metadata": { "type": "SP.ChangeToken" },
                "StringValue": change_token,
            });
        }

        let request = self
            .client
            .http()
            .post(&url)
            .header(ACCEPT, ODATA_NOMETADATA)
            .header(CONTENT_TYPE, "application/json;odata=verbose")
            .json(&json!({ "query": query }));
        let changes: SpChanges = self
            .client
            .send_json(&scope, request)
            .await?
            .ok_or_else(|| BrokerError::ContainerMissing(list_id.to_string()))?;

        let has_more = changes.value.len() >= CHANGE_ROW_LIMIT;
        let new_token = changes
            .value
            .iter()
            .rev()
            .find_map(|c| c.change_token.as_ref())
            .map(|t| t.string_value.clone())
            .unwrap_or_else(|| change_token.to_string());
        let changes = changes
            .value
            .into_iter()
            .filter_map(|c| {
                c.item_id.map(|item_id| ListChange {
                    item_id: item_id.to_string(),
                    change_type: change_type(c.change_type),
                })
            })
            .collect();

        Ok(ListChangesPage {
            changes,
            new_token,
            has_more,
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn get_item_fields(&self, ids: &ObjectIdentifiers) -> Result<Map<String, Value>> {
        let (site_id, list_id, list_item_id) = Self::triple(ids)?;
        let url = self.fields_url(site_id, list_id, list_item_id);
        self.client
            .send_json(GRAPH_SCOPE, self.client.http().get(&url))
            .await?
            .ok_or_else(|| BrokerError::ItemMissing(list_item_id.to_string()))
    }

    #[instrument(skip(self), level = "debug")]
    async fn download_content(&self, ids: &ObjectIdentifiers) -> Result<(String, Vec<u8>)> {
        let (drive_id, drive_item_id) = Self::pair(ids)?;
        let missing = || BrokerError::ItemMissing(drive_item_id.to_string());

        let url = self.client.graph_url(&format!(
            "/drives/{}/items/{}?$select=id,name",
            drive_id, drive_item_id
        ));
        let item: DriveItem = self
            .client
            .send_json(GRAPH_SCOPE, self.client.http().get(&url))
            .await?
            .ok_or_else(missing)?;

        let url = self
            .client
            .graph_url(&format!("/drives/{}/items/{}/content", drive_id, drive_item_id));
        let resp = self
            .client
            .send(GRAPH_SCOPE, self.client.http().get(&url))
            .await?
            .ok_or_else(missing)?;
        let bytes = resp.bytes().await.map_err(transport)?;
        debug!("Downloaded {} ({} bytes)", item.name, bytes.len());
        Ok((item.name, bytes.to_vec()))
    }

    #[instrument(skip(self, fields), level = "debug")]
    async fn update_item_fields(
        &self,
        ids: &ObjectIdentifiers,
        fields: &Map<String, Value>,
    ) -> Result<()> {
        let (site_id, list_id, list_item_id) = Self::triple(ids)?;
        let url = self.fields_url(site_id, list_id, list_item_id);
        self.client
            .send(GRAPH_SCOPE, self.client.http().patch(&url).json(fields))
            .await?
            .ok_or_else(|| BrokerError::ItemMissing(list_item_id.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn move_item(
        &self,
        ids: &ObjectIdentifiers,
        destination: &DestinationFolder,
    ) -> Result<ObjectIdentifiers> {
        let (drive_id, drive_item_id) = Self::pair(ids)?;
        let url = self.client.graph_url(&format!(
            "/drives/{}/items/{}?$select=id,parentReference",
            drive_id, drive_item_id
        ));
        let body = json!({
            "parentReference": {
                "driveId": destination.drive_id,
                "id": destination.folder_id,
            }
        });
        let moved: DriveItem = self
            .client
            .send_json(GRAPH_SCOPE, self.client.http().patch(&url).json(&body))
            .await?
            .ok_or_else(|| BrokerError::ItemMissing(drive_item_id.to_string()))?;

        let new_drive = moved
            .parent_reference
            .and_then(|p| p.drive_id)
            .unwrap_or_else(|| destination.drive_id.clone());
        let coordinates = self.get_repository_coordinates(&new_drive, &moved.id).await?;
        Ok(ObjectIdentifiers {
            object_id: ids.object_id.clone(),
            site_id: coordinates.site_id,
            list_id: coordinates.list_id,
            list_item_id: coordinates.list_item_id,
            drive_id: new_drive,
            drive_item_id: moved.id,
            external_reference_list_id: ids.external_reference_list_id.clone(),
            additional_object_id: ids.additional_object_id.clone(),
        })
    }

    #[instrument(skip(self, content, fields), level = "debug")]
    async fn create_document(
        &self,
        site_id: &str,
        list_id: &str,
        file_name: &str,
        content: &[u8],
        fields: &Map<String, Value>,
    ) -> Result<ObjectIdentifiers> {
        let drive_id = self.get_container_id(site_id, list_id).await?;
        let url = self.client.graph_url(&format!(
            "/drives/{}/root:/{}:/content",
            drive_id,
            urlencoding::encode(file_name)
        ));
        let request = self
            .client
            .http()
            .put(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(content.to_vec());
        let created: IdOnly = self
            .client
            .send_json(GRAPH_SCOPE, request)
            .await?
            .ok_or_else(|| BrokerError::ContainerMissing(drive_id.clone()))?;

        let coordinates = self.get_repository_coordinates(&drive_id, &created.id).await?;
        let ids = ObjectIdentifiers {
            site_id: coordinates.site_id,
            list_id: coordinates.list_id,
            list_item_id: coordinates.list_item_id,
            drive_id,
            drive_item_id: created.id,
            ..Default::default()
        };
        if !fields.is_empty() {
            self.update_item_fields(&ids, fields).await?;
        }
        Ok(ids)
    }

    #[instrument(skip(self), level = "debug")]
    async fn delete_document(&self, ids: &ObjectIdentifiers) -> Result<()> {
        let (drive_id, drive_item_id) = Self::pair(ids)?;
        let url = self
            .client
            .graph_url(&format!("/drives/{}/items/{}", drive_id, drive_item_id));
        self.client
            .send(GRAPH_SCOPE, self.client.http().delete(&url))
            .await?
            .ok_or_else(|| BrokerError::ItemMissing(drive_item_id.to_string()))?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn create_subscription(
        &self,
        site_url: &str,
        list_id: &str,
        notification_url: &str,
        expiration: DateTime<Utc>,
    ) -> Result<CreatedSubscription> {
        let scope = sharepoint_scope(site_url)?;
        let resource = Self::list_url(site_url, list_id);
        let mut body = json!({
            "resource": resource,
            "notificationUrl": notification_url,
            "expirationDateTime": timestamp(expiration),
        });
        if let Some(client_state) = &self.client.config().client_state {
            body["clientState"] = json!(client_state);
        }

        let request = self
            .client
            .http()
            .post(format!("{}/subscriptions", resource))
            .header(ACCEPT, ODATA_NOMETADATA)
            .json(&body);
        let resp = self
            .client
            .send(&scope, request)
            .await?
            .ok_or_else(|| BrokerError::ContainerMissing(list_id.to_string()))?;
        let created: SpSubscription = read_json(resp).await?;
        Ok(CreatedSubscription {
            subscription_id: created.id,
            expiration_date_time: created.expiration_date_time,
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn renew_subscription(
        &self,
        site_url: &str,
        list_id: &str,
        subscription_id: &str,
        expiration: DateTime<Utc>,
    ) -> Result<CreatedSubscription> {
        let scope = sharepoint_scope(site_url)?;
        let url = format!(
            "{}/subscriptions('{}')",
            Self::list_url(site_url, list_id),
            subscription_id
        );
        let request = self
            .client
            .http()
            .patch(&url)
            .header(ACCEPT, ODATA_NOMETADATA)
            .json(&json!({ "expirationDateTime": timestamp(expiration) }));
        self.client
            .send(&scope, request)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("subscription {}", subscription_id)))?;
        Ok(CreatedSubscription {
            subscription_id: subscription_id.to_string(),
            expiration_date_time: expiration,
        })
    }
}
