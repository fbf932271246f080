//! In-memory [`PersistentKv`] shared by any number of contexts in one process.
//!
//! The hub owns the map; each context gets its own [`MemoryKv`] handle. Writes through one handle are delivered as
//! [`KvChange`] events to every other live handle, mirroring how browsers deliver storage events to the other tabs
//! but not to the writer.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use log::*;
use tokio::sync::broadcast;

use crate::traits::{ContextId, KvChange, KvError, PersistentKv};

const DEFAULT_EVENT_BUFFER: usize = 256;

struct Listener {
    slot: u64,
    id: ContextId,
    sender: broadcast::Sender<KvChange>,
}

#[derive(Default)]
struct HubInner {
    values: HashMap<String, String>,
    /// One entry per live handle. Several handles may share a context id.
    listeners: Vec<Listener>,
    next_slot: u64,
}

#[derive(Clone, Default)]
pub struct MemoryKvHub {
    inner: Arc<Mutex<HubInner>>,
}

impl MemoryKvHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a handle for a new context with a random id.
    pub fn open(&self) -> MemoryKv {
        self.open_as(ContextId::random())
    }

    pub fn open_as<C: Into<ContextId>>(&self, id: C) -> MemoryKv {
        let id = id.into();
        let (sender, _) = broadcast::channel(DEFAULT_EVENT_BUFFER);
        let slot = {
            let mut inner = self.lock();
            let slot = inner.next_slot;
            inner.next_slot += 1;
            inner.listeners.push(Listener { slot, id: id.clone(), sender: sender.clone() });
            slot
        };
        debug!("🗂️ Context {id} attached to the in-memory store");
        MemoryKv { hub: self.clone(), slot, id, sender }
    }

    /// The raw stored value, regardless of context.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.lock().values.get(key).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

pub struct MemoryKv {
    hub: MemoryKvHub,
    slot: u64,
    id: ContextId,
    sender: broadcast::Sender<KvChange>,
}

impl PersistentKv for MemoryKv {
    fn context_id(&self) -> &ContextId {
        &self.id
    }

    fn get(&self, key: &str) -> Option<String> {
        self.hub.peek(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut inner = self.hub.lock();
        let old_value = inner.values.insert(key.to_string(), value.to_string());
        if old_value.as_deref() == Some(value) {
            return Ok(());
        }
        let change = KvChange {
            key: key.to_string(),
            old_value,
            new_value: Some(value.to_string()),
            origin: self.id.clone(),
        };
        for listener in inner.listeners.iter().filter(|l| l.id != self.id) {
            // No receivers yet is not an error; the context simply isn't listening
            if listener.sender.send(change.clone()).is_err() {
                trace!("🗂️ Context {} has no active listener for {key}", listener.id);
            }
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<KvChange> {
        self.sender.subscribe()
    }
}

impl Drop for MemoryKv {
    fn drop(&mut self) {
        let mut inner = self.hub.lock();
        inner.listeners.retain(|l| l.slot != self.slot);
        debug!("🗂️ Context {} detached from the in-memory store", self.id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn writes_are_seen_by_other_contexts_only() {
        let hub = MemoryKvHub::new();
        let tab_a = hub.open_as("a");
        let tab_b = hub.open_as("b");
        let mut a_events = tab_a.subscribe();
        let mut b_events = tab_b.subscribe();

        tab_a.set("k", "1").unwrap();
        assert_eq!(tab_b.get("k").as_deref(), Some("1"));
        let change = b_events.recv().await.unwrap();
        assert_eq!(change.key, "k");
        assert_eq!(change.old_value, None);
        assert_eq!(change.new_value.as_deref(), Some("1"));
        assert_eq!(change.origin, ContextId::from("a"));
        assert!(a_events.try_recv().is_err());
    }

    #[tokio::test]
    async fn unchanged_values_produce_no_event() {
        let hub = MemoryKvHub::new();
        let tab_a = hub.open_as("a");
        let tab_b = hub.open_as("b");
        let mut b_events = tab_b.subscribe();
        tab_a.set("k", "1").unwrap();
        tab_a.set("k", "1").unwrap();
        assert!(b_events.recv().await.is_ok());
        assert!(b_events.try_recv().is_err());
    }

    #[test]
    fn dropped_contexts_detach() {
        let hub = MemoryKvHub::new();
        let tab_a = hub.open_as("a");
        {
            let _tab_b = hub.open_as("b");
            assert_eq!(hub.lock().listeners.len(), 2);
        }
        assert_eq!(hub.lock().listeners.len(), 1);
        tab_a.set("k", "v").unwrap();
        assert_eq!(hub.peek("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn dropping_one_of_two_handles_for_a_context_keeps_the_other() {
        let hub = MemoryKvHub::new();
        let writer = hub.open_as("writer");
        let kept = hub.open_as("reader");
        let mut events = kept.subscribe();
        for _ in 0..10 {
            drop(hub.open_as("reader"));
        }
        assert_eq!(hub.lock().listeners.len(), 2);
        writer.set("k", "1").unwrap();
        assert_eq!(events.recv().await.unwrap().new_value.as_deref(), Some("1"));
    }
}
