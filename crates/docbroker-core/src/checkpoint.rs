use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::feed::FeedType;

/// Per-container delta tokens, persisted as `key1=val1;key2=val2`.
///
/// Keys are container ids and must not contain `=` or `;`. Values may contain `=` (delta tokens
/// are frequently base64 with padding); only the first `=` of a pair separates key from value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenMap(BTreeMap<String, String>);

impl TokenMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the combined string form. Malformed pairs and empty keys are ignored.
    pub fn parse(encoded: &str) -> Self {
        let map = encoded
            .split(';')
            .filter_map(|pair| pair.split_once('='))
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| (key.trim().to_string(), value.to_string()))
            .collect();
        Self(map)
    }

    pub fn encode(&self) -> String {
        self.0
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn get(&self, container_id: &str) -> Option<&str> {
        self.0
            .get(container_id)
            .map(String::as_str)
            .filter(|token| !token.is_empty())
    }

    pub fn insert(&mut self, container_id: impl Into<String>, token: impl Into<String>) {
        self.0.insert(container_id.into(), token.into());
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for TokenMap {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.encode())
    }
}

impl<'de> Deserialize<'de> for TokenMap {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Ok(TokenMap::parse(&encoded))
    }
}

/// Resumption state of one feed type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    /// Start instant of the last completed run. `None` before the first run.
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tokens: TokenMap,
}

impl SyncCheckpoint {
    /// The instant New/Updated classification compares creation times against.
    pub fn threshold(&self) -> DateTime<Utc> {
        self.last_run.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Persistence of per-feed checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the checkpoint of a feed type; a feed that never ran yields the default checkpoint.
    async fn load(&self, feed: FeedType) -> Result<SyncCheckpoint>;

    async fn save(&self, feed: FeedType, checkpoint: &SyncCheckpoint) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_map_encoding() {
        let mut map = TokenMap::new();
        map.insert("driveB", "tok=2==");
        map.insert("driveA", "abc");
        assert_eq!(map.encode(), "driveA=abc;driveB=tok=2==");

        let parsed = TokenMap::parse("driveA=abc;driveB=tok=2==");
        assert_eq!(parsed, map);
        assert_eq!(parsed.get("driveB"), Some("tok=2=="));
    }

    #[test]
    fn test_token_map_ignores_garbage() {
        let parsed = TokenMap::parse("=x;;novalue;driveA=;driveC=1");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("driveA"), None);
        assert_eq!(parsed.get("driveC"), Some("1"));
        assert!(TokenMap::parse("").is_empty());
    }

    #[test]
    fn test_checkpoint_json_shape() {
        let mut checkpoint = SyncCheckpoint::default();
        checkpoint.tokens.insert("driveA", "t1");
        let json = serde_json::to_value(&checkpoint).unwrap();
        assert_eq!(json["tokens"], "driveA=t1");
        assert!(json["lastRun"].is_null());
        assert_eq!(checkpoint.threshold(), DateTime::<Utc>::MIN_UTC);
    }
}
