use crate::feed::FeedType;
use crate::ids::Coordinate;

/// Result alias used across docbroker crates.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors raised by the engine and its backends.
///
/// Variants follow the failure taxonomy the engine acts on: not-found conditions are skipped at
/// item granularity, transient transport failures are absorbed per item and retried on the next
/// run, invalid tokens force a full resync.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BrokerError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Container not found: {0}")]
    ContainerMissing(String),

    #[error("Item not found: {0}")]
    ItemMissing(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Invalid change token: {0}")]
    InvalidToken(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Missing coordinate: {0}")]
    MissingCoordinate(Coordinate),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Synchronization already running for feed {0}")]
    AlreadyRunning(FeedType),

    #[error("Cancelled")]
    Cancelled,
}

impl BrokerError {
    /// Whether the error means a referenced record or coordinate does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BrokerError::NotFound(_) | BrokerError::ContainerMissing(_) | BrokerError::ItemMissing(_)
        )
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BrokerError::Transport(_) | BrokerError::Conflict(_))
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_classification() {
        assert!(BrokerError::ContainerMissing("l1".into()).is_not_found());
        assert!(BrokerError::ItemMissing("7".into()).is_not_found());
        assert!(!BrokerError::Transport("timeout".into()).is_not_found());
        assert!(BrokerError::Transport("timeout".into()).is_transient());
        assert!(!BrokerError::InvalidToken("stale".into()).is_transient());
    }

    #[test]
    fn test_missing_coordinate_message_names_field() {
        let err = BrokerError::MissingCoordinate(Coordinate::DriveItemId);
        assert_eq!(err.to_string(), "Missing coordinate: DriveItemId");
    }
}
