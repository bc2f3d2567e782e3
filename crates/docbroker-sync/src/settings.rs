//! Broker settings loaded from the JSON settings file.

use std::collections::HashMap;
use std::path::Path;

use docbroker_core::{BrokerError, DestinationFolder, FieldMapping, Result};
use serde::{Deserialize, Serialize};

/// A document library the broker watches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredContainer {
    /// Short name used in logs.
    pub key: String,
    pub site_id: String,
    pub list_id: String,
    pub drive_id: String,
    /// Absolute site URL, used for list changes and webhook subscriptions.
    pub site_url: String,
    /// List holding cross-references for documents of this library.
    #[serde(default)]
    pub external_reference_list_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebhookSettings {
    /// Public URL of the intake endpoint registered with the repository.
    pub notification_url: String,
    /// Shared secret echoed back in every notification.
    pub client_state: Option<String>,
    /// Subscriptions expiring within this many days are renewed.
    pub renewal_window_days: i64,
    /// Lifetime requested when creating or renewing a subscription.
    pub subscription_lifetime_days: i64,
    pub processed_status: String,
    pub error_status: String,
    /// Deliveries after which a queued batch that keeps failing is dead-lettered.
    pub max_deliveries: u32,
}

impl Default for WebhookSettings {
    fn default() -> Self {
        Self {
            notification_url: String::new(),
            client_state: None,
            renewal_window_days: 7,
            subscription_lifetime_days: 180,
            processed_status: "processed".to_string(),
            error_status: "error".to_string(),
            max_deliveries: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerSettings {
    pub object_id_prefix: String,
    pub content_container: String,
    pub metadata_container: String,
    pub containers: Vec<MonitoredContainer>,
    pub fields: FieldMapping,
    /// Classification label to the folder documents with that label are moved into.
    #[serde(default)]
    pub classification_destinations: HashMap<String, DestinationFolder>,
    #[serde(default)]
    pub webhook: WebhookSettings,
}

impl BrokerSettings {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Config(format!("Failed to read settings {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let settings: BrokerSettings = serde_json::from_str(raw)
            .map_err(|e| BrokerError::Config(format!("Invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<()> {
        if self.object_id_prefix.is_empty() {
            return Err(BrokerError::Config("objectIdPrefix must not be empty".to_string()));
        }
        if self.webhook.max_deliveries == 0 {
            return Err(BrokerError::Config(
                "webhook.maxDeliveries must be at least 1".to_string(),
            ));
        }
        if self.content_container.is_empty() || self.metadata_container.is_empty() {
            return Err(BrokerError::Config(
                "contentContainer and metadataContainer are required".to_string(),
            ));
        }
        for container in &self.containers {
            if container.drive_id.contains(['=', ';']) {
                return Err(BrokerError::Config(format!(
                    "drive id of container {} cannot be stored in a token map",
                    container.key
                )));
            }
        }
        Ok(())
    }

    /// Static (site, list) to cross-reference list mapping.
    pub fn reference_map(&self) -> ReferenceMap {
        ReferenceMap(
            self.containers
                .iter()
                .filter(|c| !c.external_reference_list_id.is_empty())
                .map(|c| {
                    (
                        ReferenceMap::key(&c.site_id, &c.list_id),
                        c.external_reference_list_id.clone(),
                    )
                })
                .collect(),
        )
    }

    pub fn container_by_list(&self, list_id: &str) -> Option<&MonitoredContainer> {
        self.containers
            .iter()
            .find(|c| c.list_id.eq_ignore_ascii_case(list_id))
    }
}

/// Lookup of the cross-reference list of a (site, list) pair.
#[derive(Debug, Clone, Default)]
pub struct ReferenceMap(HashMap<(String, String), String>);

impl ReferenceMap {
    fn key(site_id: &str, list_id: &str) -> (String, String) {
        (site_id.to_lowercase(), list_id.to_lowercase())
    }

    pub fn with_entry(mut self, site_id: &str, list_id: &str, reference_list_id: &str) -> Self {
        self.0
            .insert(Self::key(site_id, list_id), reference_list_id.to_string());
        self
    }

    pub fn lookup(&self, site_id: &str, list_id: &str) -> Option<&str> {
        self.0.get(&Self::key(site_id, list_id)).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SETTINGS: &str = r#"{
        "objectIdPrefix": "ZLD",
        "contentContainer": "documents",
        "metadataContainer": "metadata",
        "containers": [{
            "key": "records",
            "siteId": "contoso.sharepoint.com,1,2",
            "listId": "LIST-1",
            "driveId": "b!drive1",
            "siteUrl": "https://contoso.sharepoint.com/sites/records",
            "externalReferenceListId": "refs-1"
        }],
        "fields": [
            {"name": "Title", "column": "Title", "kind": "text", "required": true, "public": true}
        ],
        "classificationDestinations": {
            "Public": {"driveId": "b!public", "folderId": "01ABC"}
        }
    }"#;

    #[test]
    fn test_parse_settings() {
        let settings = BrokerSettings::from_json(SETTINGS).unwrap();
        assert_eq!(settings.object_id_prefix, "ZLD");
        assert_eq!(settings.webhook.renewal_window_days, 7);
        assert_eq!(settings.webhook.processed_status, "processed");
        assert_eq!(settings.webhook.max_deliveries, 5);
        assert!(settings.container_by_list("list-1").is_some());
        assert_eq!(
            settings
                .reference_map()
                .lookup("CONTOSO.sharepoint.com,1,2", "list-1"),
            Some("refs-1")
        );
        assert_eq!(settings.classification_destinations["Public"].folder_id, "01ABC");
    }

    #[test]
    fn test_rejects_empty_prefix() {
        let raw = SETTINGS.replace("\"ZLD\"", "\"\"");
        let err = BrokerSettings::from_json(&raw).unwrap_err();
        assert!(err.to_string().contains("objectIdPrefix"));
    }
}
