//! # Collaborator contracts
//!
//! The engine talks to the outside world through two narrow interfaces:
//!
//! * [`RemoteOrderSource`] is the system of record for orders. It is fetched on a schedule and receives state-changing
//!   requests such as "accept order X".
//! * [`PersistentKv`] is a small key-value store shared by every execution context of the host (browser tabs, agent
//!   processes). It carries the persisted scheduler state and the signals that keep contexts from duplicating work.
//!
//! Hosts supply implementations. The engine ships [`MemoryKvHub`](crate::kv::MemoryKvHub) for single-process use.
mod order_source;
mod persistent_kv;

#[cfg(any(test, feature = "test_utils"))]
pub use order_source::MockRemoteOrderSource;
pub use order_source::{AcceptOutcome, OrderSourceError, RemoteOrderSource};
pub use persistent_kv::{ContextId, KvChange, KvError, PersistentKv};
