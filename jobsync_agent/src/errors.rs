use jobsync_engine::{traits::KvError, SyncError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Invalid configuration. {0}")]
    InvalidConfiguration(String),
    #[error("No subject token was supplied. Set JOBSYNC_SUBJECT_TOKEN or pass --token.")]
    MissingToken,
    #[error("Could not use the shared state file. {0}")]
    SharedState(#[from] KvError),
    #[error(transparent)]
    Sync(#[from] SyncError),
}
