//! Fan-out of [`SyncState`] changes to registered observers.
//!
//! [`Broadcaster::notify`] is called after every store mutation, but observers only hear about it when the part of
//! the state they can see has actually changed. A fetch that returns the same orders as last time therefore costs
//! subscribers nothing.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use log::*;

use crate::{
    order_types::{OrderSet, SubjectInfo},
    sync::order_store::SyncState,
};

/// A consumer of state changes.
pub trait SyncStateObserver: Send + Sync {
    fn on_change(&self, state: &SyncState);
}

/// Adapts a closure into a [`SyncStateObserver`].
pub struct FnObserver<F>(pub F);

impl<F> SyncStateObserver for FnObserver<F>
where F: Fn(&SyncState) + Send + Sync
{
    fn on_change(&self, state: &SyncState) {
        (self.0)(state)
    }
}

/// The fields of [`SyncState`] that subscribers render. `last_fetch_at` and the failure counter are deliberately
/// absent: they change on every fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
struct VisibleState {
    orders: Arc<OrderSet>,
    total: u64,
    subject: Option<SubjectInfo>,
    has_new_orders: bool,
    new_orders_count: usize,
    error: Option<String>,
    is_loading: bool,
}

impl From<&SyncState> for VisibleState {
    fn from(state: &SyncState) -> Self {
        Self {
            orders: Arc::clone(&state.orders),
            total: state.total,
            subject: state.subject.clone(),
            has_new_orders: state.has_new_orders,
            new_orders_count: state.new_orders_count,
            error: state.error.clone(),
            is_loading: state.is_loading,
        }
    }
}

pub type SubscriberId = u64;

type IdleHook = Arc<dyn Fn() + Send + Sync>;

struct Registration {
    id: SubscriberId,
    observer: Arc<dyn SyncStateObserver>,
    /// Number of live [`Subscription`]s for this observer.
    handles: usize,
}

struct Registry {
    next_id: SubscriberId,
    registrations: Vec<Registration>,
    last_delivered: Option<VisibleState>,
    /// Version of the newest state offered to [`Broadcaster::notify`]. Survives [`Broadcaster::reset`].
    last_version: u64,
    on_idle: Option<IdleHook>,
}

pub struct Broadcaster {
    registry: Arc<Mutex<Registry>>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        let registry = Registry { next_id: 1, registrations: Vec::new(), last_delivered: None, last_version: 0, on_idle: None };
        Self { registry: Arc::new(Mutex::new(registry)) }
    }

    /// Registers `observer`. Registering the same observer (the same `Arc`) again does not add a second delivery; it
    /// only adds another handle, and the observer stays registered until every handle has been released.
    pub fn subscribe(&self, observer: Arc<dyn SyncStateObserver>) -> Subscription {
        let mut registry = lock(&self.registry);
        let existing = registry.registrations.iter_mut().find(|r| same_observer(&r.observer, &observer));
        let id = match existing {
            Some(registration) => {
                registration.handles += 1;
                debug!("📬️ Observer #{} subscribed again ({} handles)", registration.id, registration.handles);
                registration.id
            },
            None => {
                let id = registry.next_id;
                registry.next_id += 1;
                registry.registrations.push(Registration { id, observer, handles: 1 });
                debug!("📬️ Observer #{id} subscribed. {} observers registered", registry.registrations.len());
                id
            },
        };
        Subscription { id, registry: Arc::downgrade(&self.registry), active: true }
    }

    /// Sets a callback that runs whenever the last observer unsubscribes.
    pub fn set_idle_hook<F>(&self, f: F)
    where F: Fn() + Send + Sync + 'static {
        lock(&self.registry).on_idle = Some(Arc::new(f));
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.registry).registrations.len()
    }

    /// Delivers `state` to every observer if its visible projection differs from the last one delivered. States older
    /// than one already offered are dropped, so callers racing each other cannot roll observers back. Returns whether a
    /// delivery took place.
    pub fn notify(&self, state: &SyncState) -> bool {
        let visible = VisibleState::from(state);
        let observers = {
            let mut registry = lock(&self.registry);
            if state.version < registry.last_version {
                trace!("📬️ Dropping state v{}; v{} was already offered", state.version, registry.last_version);
                return false;
            }
            registry.last_version = state.version;
            if registry.last_delivered.as_ref() == Some(&visible) {
                trace!("📬️ State unchanged, skipping notification");
                return false;
            }
            registry.last_delivered = Some(visible);
            registry.registrations.iter().map(|r| (r.id, Arc::clone(&r.observer))).collect::<Vec<_>>()
        };
        trace!("📬️ Notifying {} observers", observers.len());
        for (id, observer) in observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_change(state))).is_err() {
                error!("📬️ Observer #{id} panicked while handling a state change");
            }
        }
        true
    }

    /// Forgets the last delivered state, so that the next notification is delivered unconditionally.
    pub fn reset(&self) {
        lock(&self.registry).last_delivered = None;
    }
}

fn same_observer(a: &Arc<dyn SyncStateObserver>, b: &Arc<dyn SyncStateObserver>) -> bool {
    // Compare data pointers only; vtable pointers for the same type may differ between codegen units
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|p| p.into_inner())
}

/// Handle for a registered observer. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the observer immediately"]
pub struct Subscription {
    id: SubscriberId,
    registry: Weak<Mutex<Registry>>,
    active: bool,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Releases this handle. Returns the number of observers still registered afterwards.
    pub fn unsubscribe(mut self) -> usize {
        self.release()
    }

    fn release(&mut self) -> usize {
        if !self.active {
            return 0;
        }
        self.active = false;
        let Some(registry) = self.registry.upgrade() else {
            return 0;
        };
        let (remaining, idle_hook) = {
            let mut registry = lock(&registry);
            let mut removed = false;
            if let Some(pos) = registry.registrations.iter().position(|r| r.id == self.id) {
                registry.registrations[pos].handles -= 1;
                if registry.registrations[pos].handles == 0 {
                    registry.registrations.remove(pos);
                    removed = true;
                    debug!("📬️ Observer #{} unsubscribed. {} observers remain", self.id, registry.registrations.len());
                }
            }
            let remaining = registry.registrations.len();
            let hook = if removed && remaining == 0 { registry.on_idle.clone() } else { None };
            (remaining, hook)
        };
        if let Some(hook) = idle_hook {
            hook();
        }
        remaining
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}
