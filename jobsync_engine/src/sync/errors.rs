use thiserror::Error;

use crate::traits::{KvError, OrderSourceError};

/// Errors surfaced by the synchronization engine to its consumers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// There is no subject token. Not fatal: the caller skips the operation.
    #[error("No subject is signed in.")]
    AuthenticationMissing,
    /// Network failure, timeout or server error. The next scheduled tick retries.
    #[error("The order source is unavailable. {0}")]
    RemoteUnavailable(String),
    /// The source refused the request, e.g. the order was already taken by someone else. Never retried automatically.
    #[error("The order source rejected the request. {0}")]
    RemoteRejected(String),
    /// Persisted state could not be read back. The affected state is reinitialised to defaults.
    #[error("Locally persisted state is corrupt. {0}")]
    LocalStateCorrupt(String),
    #[error("Internal engine error. {0}")]
    Internal(String),
}

impl From<OrderSourceError> for SyncError {
    fn from(e: OrderSourceError) -> Self {
        match e {
            OrderSourceError::Unavailable(_) | OrderSourceError::InvalidResponse(_) => {
                Self::RemoteUnavailable(e.to_string())
            },
            OrderSourceError::Rejected { .. } | OrderSourceError::Unauthorized => Self::RemoteRejected(e.to_string()),
        }
    }
}

impl From<KvError> for SyncError {
    fn from(e: KvError) -> Self {
        Self::Internal(format!("Shared storage error: {e}"))
    }
}
