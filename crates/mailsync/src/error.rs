//! Error taxonomy of the sync subsystem

use crate::models::FolderId;

/// Errors surfaced by a sync request
///
/// Storage backends report failures as `anyhow::Error`; the sync service
/// wraps those as [`SyncError::StorageUnavailable`].
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The cursor string is malformed or cannot be resumed from
    #[error("Invalid sync token {token:?}: {reason}")]
    InvalidToken { token: String, reason: String },

    /// The requested folder does not exist or is not a folder
    #[error("Unknown sync scope: folder {folder}")]
    UnknownScope { folder: FolderId },

    /// The change or tombstone log could not be read
    #[error("Mailbox log unavailable: {0}")]
    StorageUnavailable(#[source] anyhow::Error),

    /// A consistency invariant of the logs was violated
    #[error("Sync invariant violated: {0}")]
    Invariant(String),
}

impl SyncError {
    /// Errors caused by the request itself; retrying unchanged will not help
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidToken { .. } | SyncError::UnknownScope { .. }
        )
    }

    /// Errors that may clear up when the same request is retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::StorageUnavailable(_))
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(e: anyhow::Error) -> Self {
        SyncError::StorageUnavailable(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ItemId;

    #[test]
    fn test_classification() {
        let token = SyncError::InvalidToken {
            token: "x".to_string(),
            reason: "missing delimiter".to_string(),
        };
        assert!(token.is_client_error());
        assert!(!token.is_retryable());

        let scope = SyncError::UnknownScope { folder: ItemId(999) };
        assert!(scope.is_client_error());

        let storage = SyncError::from(anyhow::anyhow!("disk I/O error"));
        assert!(storage.is_retryable());
        assert!(!storage.is_client_error());

        assert!(!SyncError::Invariant("overflow".to_string()).is_retryable());
    }

    #[test]
    fn test_messages() {
        let err = SyncError::UnknownScope { folder: ItemId(42) };
        assert_eq!(err.to_string(), "Unknown sync scope: folder 42");
    }
}
