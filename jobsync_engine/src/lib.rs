//! Jobsync Engine
//!
//! Keeps a locally cached, observable copy of a subject's service orders in step with a remote order source.
//!
//! The engine is made of a handful of small components, each owning one piece of state:
//! 1. The fetch coordinator ([`mod@sync`]) is the only path to the remote source. Concurrent fetches for the same
//!    subject share one request, and stale completions never overwrite newer data.
//! 2. The order store holds the canonical [`SyncState`]. It diffs every fetch against the cached set, keeps the last
//!    good orders when a fetch fails, and counts new orders until the user dismisses them.
//! 3. The broadcaster delivers state to typed observers, but only when something they can see has changed.
//! 4. The [`mod@scheduler`] polls on a fixed period and persists its countdown, so a reload resumes where it left
//!    off instead of starting over.
//! 5. The cross-context coordinator keeps several contexts sharing one [`PersistentKv`] on a single schedule.
//!
//! Host code normally only needs [`OrderSyncEngine`]. Components also emit events (new orders, accepted orders,
//! failed syncs) through the same small actor framework used for the hooks in [`mod@events`].
pub mod config;
pub mod cross_tab;
pub mod events;
pub mod kv;
pub mod order_types;
pub mod scheduler;
pub mod sync;
mod sync_engine;
pub mod traits;

#[cfg(any(feature = "test_utils", test))]
pub mod test_utils;

pub use config::{EngineConfig, StorageKeys};
pub use cross_tab::CrossTabCoordinator;
pub use scheduler::{SchedulerState, SchedulerStatus, Visibility};
pub use sync::{FnObserver, Subscription, SyncError, SyncState, SyncStateObserver};
pub use sync_engine::OrderSyncEngine;
pub use traits::{PersistentKv, RemoteOrderSource};
