use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::BrokerError;

/// The three independently triggered change-feed passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedType {
    New,
    Updated,
    Deleted,
}

impl FeedType {
    pub const ALL: [FeedType; 3] = [FeedType::New, FeedType::Updated, FeedType::Deleted];

    pub fn as_str(&self) -> &'static str {
        match self {
            FeedType::New => "new",
            FeedType::Updated => "updated",
            FeedType::Deleted => "deleted",
        }
    }
}

impl fmt::Display for FeedType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedType {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "new" => Ok(FeedType::New),
            "updated" => Ok(FeedType::Updated),
            "deleted" => Ok(FeedType::Deleted),
            other => Err(BrokerError::InvalidInput(format!("unknown feed type: {}", other))),
        }
    }
}

/// One entry of a container's change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFeedItem {
    pub id: String,
    pub container_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_folder: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

/// One page of a container's change feed.
///
/// While `has_more` is set, `cursor` addresses the next page. On the last page `cursor` is the
/// new delta token to store for the next run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeFeedPage {
    pub items: Vec<ChangeFeedItem>,
    pub cursor: Option<String>,
    pub has_more: bool,
}

/// Kind of change reported by the list-change operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Add,
    Update,
    Delete,
    /// Renames, permission changes and other kinds the pipeline does not act on.
    Other,
}

/// A single item-level change from the list-change operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListChange {
    pub item_id: String,
    pub change_type: ChangeType,
}

/// Result of one list-change call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListChangesPage {
    pub changes: Vec<ListChange>,
    /// Token of the last change returned; the start token for the next call.
    pub new_token: String,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feed_type_parse() {
        assert_eq!("New".parse::<FeedType>().unwrap(), FeedType::New);
        assert_eq!("deleted".parse::<FeedType>().unwrap(), FeedType::Deleted);
        assert!("moved".parse::<FeedType>().is_err());
        assert_eq!(FeedType::Updated.to_string(), "updated");
    }
}
