use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BrokerError, Result};

/// One coordinate of an object's identity, used to name what is missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Coordinate {
    ObjectId,
    SiteId,
    ListId,
    ListItemId,
    DriveId,
    DriveItemId,
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Coordinate::ObjectId => "ObjectId",
            Coordinate::SiteId => "SiteId",
            Coordinate::ListId => "ListId",
            Coordinate::ListItemId => "ListItemId",
            Coordinate::DriveId => "DriveId",
            Coordinate::DriveItemId => "DriveItemId",
        };
        f.write_str(name)
    }
}

/// The record linking a document's coordinate spaces to its public object id.
///
/// Empty strings mean "unknown". Non-empty fields are never overwritten once set; use
/// [`ObjectIdentifiers::merged`] to fill gaps from another snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectIdentifiers {
    pub object_id: String,
    pub site_id: String,
    pub list_id: String,
    pub list_item_id: String,
    pub drive_id: String,
    pub drive_item_id: String,
    pub external_reference_list_id: String,
    pub additional_object_id: String,
}

impl ObjectIdentifiers {
    /// Identifiers known only by their repository triple.
    pub fn from_repository(
        site_id: impl Into<String>,
        list_id: impl Into<String>,
        list_item_id: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            list_id: list_id.into(),
            list_item_id: list_item_id.into(),
            ..Default::default()
        }
    }

    /// Identifiers known only by their storage pair.
    pub fn from_storage(drive_id: impl Into<String>, drive_item_id: impl Into<String>) -> Self {
        Self {
            drive_id: drive_id.into(),
            drive_item_id: drive_item_id.into(),
            ..Default::default()
        }
    }

    /// Identifiers known only by their object id.
    pub fn from_object_id(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            ..Default::default()
        }
    }

    pub fn has_repository_triple(&self) -> bool {
        !self.site_id.is_empty() && !self.list_id.is_empty() && !self.list_item_id.is_empty()
    }

    pub fn has_storage_pair(&self) -> bool {
        !self.drive_id.is_empty() && !self.drive_item_id.is_empty()
    }

    /// Whether any coordinate (triple or pair) is still unknown.
    pub fn has_missing_coordinates(&self) -> bool {
        !self.has_repository_triple() || !self.has_storage_pair()
    }

    /// At least one coordinate space must be usable for the record to mean anything.
    pub fn ensure_addressable(&self) -> Result<()> {
        if self.has_repository_triple() || self.has_storage_pair() || !self.object_id.is_empty() {
            Ok(())
        } else {
            Err(BrokerError::InvalidInput(
                "identifiers carry neither repository nor storage coordinates".to_string(),
            ))
        }
    }

    /// Require both coordinate spaces, naming the first missing field.
    pub fn require_complete(&self) -> Result<()> {
        let checks = [
            (Coordinate::SiteId, &self.site_id),
            (Coordinate::ListId, &self.list_id),
            (Coordinate::ListItemId, &self.list_item_id),
            (Coordinate::DriveId, &self.drive_id),
            (Coordinate::DriveItemId, &self.drive_item_id),
        ];
        match checks.iter().find(|(_, value)| value.is_empty()) {
            Some((coordinate, _)) => Err(BrokerError::MissingCoordinate(*coordinate)),
            None => Ok(()),
        }
    }

    /// Fill every empty field of `self` from `patch`. Populated fields are kept as they are.
    pub fn merged(&self, patch: &ObjectIdentifiers) -> ObjectIdentifiers {
        fn pick(current: &str, candidate: &str) -> String {
            if current.is_empty() {
                candidate.to_string()
            } else {
                current.to_string()
            }
        }

        ObjectIdentifiers {
            object_id: pick(&self.object_id, &patch.object_id),
            site_id: pick(&self.site_id, &patch.site_id),
            list_id: pick(&self.list_id, &patch.list_id),
            list_item_id: pick(&self.list_item_id, &patch.list_item_id),
            drive_id: pick(&self.drive_id, &patch.drive_id),
            drive_item_id: pick(&self.drive_item_id, &patch.drive_item_id),
            external_reference_list_id: pick(
                &self.external_reference_list_id,
                &patch.external_reference_list_id,
            ),
            additional_object_id: pick(&self.additional_object_id, &patch.additional_object_id),
        }
    }

    /// Natural key of the repository triple, if the triple is complete.
    pub fn natural_key(&self) -> Option<NaturalKey> {
        self.has_repository_triple()
            .then(|| NaturalKey::new(&self.site_id, &self.list_id, &self.list_item_id))
    }

    /// Key of the storage pair, if the pair is complete.
    pub fn storage_key(&self) -> Option<StorageKey> {
        self.has_storage_pair()
            .then(|| StorageKey::new(&self.drive_id, &self.drive_item_id))
    }
}

/// Composite key derived from the repository triple.
///
/// Graph site and list ids are case-insensitive GUID compounds, so the key is lowercased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey(String);

impl NaturalKey {
    pub fn new(site_id: &str, list_id: &str, list_item_id: &str) -> Self {
        Self(format!("{}|{}|{}", site_id, list_id, list_item_id).to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite key derived from the storage pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn new(drive_id: &str, drive_item_id: &str) -> Self {
        Self(format!("{}|{}", drive_id, drive_item_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_never_overwrites() {
        let current = ObjectIdentifiers {
            object_id: "ZLD2024-1".into(),
            site_id: "s".into(),
            drive_id: "d-current".into(),
            ..Default::default()
        };
        let patch = ObjectIdentifiers {
            object_id: "ZLD2024-2".into(),
            list_id: "l".into(),
            drive_id: "d-other".into(),
            drive_item_id: "di".into(),
            ..Default::default()
        };

        let merged = current.merged(&patch);
        assert_eq!(merged.object_id, "ZLD2024-1");
        assert_eq!(merged.site_id, "s");
        assert_eq!(merged.list_id, "l");
        assert_eq!(merged.drive_id, "d-current");
        assert_eq!(merged.drive_item_id, "di");
        assert_eq!(merged.merged(&patch), merged);
    }

    #[test]
    fn test_require_complete_names_first_gap() {
        let ids = ObjectIdentifiers {
            drive_id: "d".into(),
            ..ObjectIdentifiers::from_repository("s", "l", "i")
        };
        assert_eq!(
            ids.require_complete(),
            Err(BrokerError::MissingCoordinate(Coordinate::DriveItemId))
        );

        let ids = ObjectIdentifiers::from_storage("d", "di");
        assert_eq!(
            ids.require_complete(),
            Err(BrokerError::MissingCoordinate(Coordinate::SiteId))
        );
    }

    #[test]
    fn test_natural_key_is_case_insensitive() {
        let a = ObjectIdentifiers::from_repository("Site", "LIST", "7");
        let b = ObjectIdentifiers::from_repository("site", "list", "7");
        assert_eq!(a.natural_key(), b.natural_key());
        assert!(ObjectIdentifiers::from_storage("d", "i").natural_key().is_none());
    }

    #[test]
    fn test_ensure_addressable() {
        assert!(ObjectIdentifiers::default().ensure_addressable().is_err());
        assert!(ObjectIdentifiers::from_storage("d", "i")
            .ensure_addressable()
            .is_ok());
    }

    #[test]
    fn test_serde_uses_camel_case() {
        let ids = ObjectIdentifiers::from_repository("s", "l", "i");
        let json = serde_json::to_value(&ids).unwrap();
        assert_eq!(json["listItemId"], "i");
        let back: ObjectIdentifiers = serde_json::from_value(json).unwrap();
        assert_eq!(back, ids);
    }
}
