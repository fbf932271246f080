//! Keeps the contexts sharing a [`PersistentKv`] on one schedule.
//!
//! The coordinator turns other contexts' writes into calls on the local [`Scheduler`] and [`SnapshotSink`]:
//!
//! * `<prefix>.scheduler.enabled` stops or follows the local schedule,
//! * `<prefix>.scheduler.countdown` is adopted by the local timer (see [`Scheduler::adopt_remote_countdown`]),
//! * `<prefix>.scheduler.owner` settles which context holds the timer,
//! * `<prefix>.scheduler.last_fetch_at` updates the displayed fetch time,
//! * `<prefix>.orders.snapshot` applies the orders another context fetched.
use std::sync::Arc;

use chrono::{DateTime, Utc};
use log::*;
use tokio::{
    sync::{broadcast, broadcast::error::RecvError},
    task::JoinHandle,
};

use crate::{
    config::StorageKeys,
    scheduler::Scheduler,
    sync::{SharedSnapshot, SnapshotSink, SyncError},
    traits::{ContextId, KvChange, PersistentKv},
};

pub struct CrossTabCoordinator {
    handle: JoinHandle<()>,
}

struct Listener {
    kv: Arc<dyn PersistentKv>,
    keys: StorageKeys,
    scheduler: Arc<Scheduler>,
    sink: Arc<dyn SnapshotSink>,
}

impl CrossTabCoordinator {
    /// Starts listening for changes made by other contexts.
    pub fn spawn(
        kv: Arc<dyn PersistentKv>,
        keys: StorageKeys,
        scheduler: Arc<Scheduler>,
        sink: Arc<dyn SnapshotSink>,
    ) -> Self {
        let changes = kv.subscribe();
        let listener = Listener { kv, keys, scheduler, sink };
        let handle = tokio::spawn(listener.run(changes));
        Self { handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for CrossTabCoordinator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

impl Listener {
    async fn run(self, mut changes: broadcast::Receiver<KvChange>) {
        debug!("🗂️ Listening for changes from other contexts as {}", self.kv.context_id());
        loop {
            match changes.recv().await {
                Ok(change) => self.handle(change).await,
                Err(RecvError::Lagged(missed)) => {
                    warn!("🗂️ Missed {missed} changes from other contexts. Re-reading shared state");
                    self.resync().await;
                },
                Err(RecvError::Closed) => {
                    debug!("🗂️ Shared store closed. No longer following other contexts");
                    break;
                },
            }
        }
    }

    async fn handle(&self, change: KvChange) {
        let KvChange { key, new_value, origin, .. } = change;
        let Some(value) = new_value else {
            trace!("🗂️ {key} was removed by {origin}");
            return;
        };
        if key == self.keys.enabled {
            self.on_enabled(&value);
        } else if key == self.keys.countdown {
            self.on_countdown(&value);
        } else if key == self.keys.owner {
            self.scheduler.apply_remote_owner(&ContextId::from(value));
        } else if key == self.keys.last_fetch_at {
            self.on_last_fetch_at(&value);
        } else if key == self.keys.snapshot {
            trace!("🗂️ Order snapshot shared by {origin}");
            self.on_snapshot(&value).await;
        }
    }

    async fn resync(&self) {
        if let Some(value) = self.kv.get(&self.keys.enabled) {
            self.on_enabled(&value);
        }
        if let Some(value) = self.kv.get(&self.keys.countdown) {
            self.on_countdown(&value);
        }
        match self.kv.get(&self.keys.owner).map(ContextId::from) {
            Some(owner) if &owner != self.kv.context_id() => self.scheduler.apply_remote_owner(&owner),
            _ => {},
        }
        if let Some(value) = self.kv.get(&self.keys.last_fetch_at) {
            self.on_last_fetch_at(&value);
        }
        if let Some(value) = self.kv.get(&self.keys.snapshot) {
            self.on_snapshot(&value).await;
        }
    }

    fn on_enabled(&self, value: &str) {
        match value.trim().parse::<bool>() {
            Ok(enabled) => self.scheduler.apply_remote_enabled(enabled),
            Err(e) => self.corrupt(&self.keys.enabled, value, e),
        }
    }

    fn on_countdown(&self, value: &str) {
        match value.trim().parse::<u64>() {
            Ok(countdown) => self.scheduler.adopt_remote_countdown(countdown),
            Err(e) => self.corrupt(&self.keys.countdown, value, e),
        }
    }

    fn on_last_fetch_at(&self, value: &str) {
        match DateTime::parse_from_rfc3339(value) {
            Ok(at) => self.scheduler.adopt_remote_last_fetch_at(at.with_timezone(&Utc)),
            Err(e) => self.corrupt(&self.keys.last_fetch_at, value, e),
        }
    }

    async fn on_snapshot(&self, value: &str) {
        match serde_json::from_str::<SharedSnapshot>(value) {
            Ok(snapshot) => {
                self.sink.apply_shared_snapshot(snapshot).await;
            },
            Err(e) => self.corrupt(&self.keys.snapshot, "<order snapshot>", e),
        }
    }

    fn corrupt(&self, key: &str, value: &str, e: impl std::fmt::Display) {
        let err = SyncError::LocalStateCorrupt(format!("{key}: '{value}'. {e}"));
        warn!("🗂️ Ignoring a change from another context. {err}");
    }
}
