use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Identifies one execution context (a browser tab, an agent process) sharing a [`PersistentKv`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextId(pub String);

impl ContextId {
    pub fn random() -> Self {
        Self(format!("ctx-{:016x}", rand::random::<u64>()))
    }
}

impl<S: Into<String>> From<S> for ContextId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

impl Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A write made by another context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvChange {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub origin: ContextId,
}

/// A synchronous key-value store visible to every context of the same origin.
///
/// Writes are last-write-wins. A context never receives change events for its own writes, and writing a value equal
/// to the stored one produces no event.
pub trait PersistentKv: Send + Sync {
    /// The context this handle writes as.
    fn context_id(&self) -> &ContextId;

    fn get(&self, key: &str) -> Option<String>;

    fn set(&self, key: &str, value: &str) -> Result<(), KvError>;

    /// A stream of changes made by other contexts. Slow receivers may observe `RecvError::Lagged` and should re-read
    /// the keys they care about.
    fn subscribe(&self) -> broadcast::Receiver<KvChange>;
}

#[derive(Debug, Clone, Error)]
pub enum KvError {
    #[error("The storage backend is unavailable. {0}")]
    Unavailable(String),
    #[error("The storage backend refused the write. {0}")]
    WriteRefused(String),
}
