use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use log::*;

use crate::{
    order_types::{FetchedOrders, Order, OrderSet, SubjectInfo},
    sync::{
        change_detector::{ChangeDetector, OrderDiff},
        errors::SyncError,
    },
};

/// The canonical view of a subject's orders in this execution context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncState {
    pub orders: Arc<OrderSet>,
    pub subject: Option<SubjectInfo>,
    /// The total number of orders the source reported, which may exceed `orders.len()` if the source pages.
    pub total: u64,
    pub is_loading: bool,
    pub error: Option<String>,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub has_new_orders: bool,
    pub new_orders_count: usize,
    pub consecutive_failures: u32,
    /// Increases with every change to the state, so that observers can tell an older snapshot from a newer one.
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied(OrderDiff),
    /// A newer fetch has already been applied; this result was discarded.
    Stale,
}

#[derive(Default)]
struct StoreInner {
    state: SyncState,
    /// Sequence number handed to the most recently issued fetch.
    issued_seq: u64,
    /// Sequence number of the newest fetch whose completion (success or failure) was applied.
    last_applied_seq: u64,
    version: u64,
}

impl StoreInner {
    fn bump(&mut self) {
        self.version += 1;
        self.state.version = self.version;
    }
}

/// Owns [`SyncState`]. Every mutation goes through one of these methods; consumers only ever see clones.
#[derive(Default)]
pub struct OrderStore {
    inner: Mutex<StoreInner>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the sequence number for a new fetch. Completions are applied only in increasing sequence order.
    pub fn next_sequence(&self) -> u64 {
        let mut inner = self.lock();
        inner.issued_seq += 1;
        inner.issued_seq
    }

    pub fn snapshot(&self) -> SyncState {
        self.lock().state.clone()
    }

    pub fn orders(&self) -> Arc<OrderSet> {
        Arc::clone(&self.lock().state.orders)
    }

    /// Marks the start of a fetch. The loading flag is only raised for the initial load, so that background refreshes
    /// of an already populated view do not disturb subscribers.
    pub fn begin_fetch(&self, seq: u64) {
        let mut inner = self.lock();
        if seq > inner.last_applied_seq && inner.state.last_fetch_at.is_none() && !inner.state.is_loading {
            inner.state.is_loading = true;
            inner.bump();
        }
    }

    /// Applies the result of fetch number `seq`.
    ///
    /// The diff against the cached set is computed under the store lock, so it always describes exactly the
    /// transition being applied. The very first population of the cache sets the baseline and is not counted as new
    /// orders.
    pub fn apply(&self, seq: u64, fetched: FetchedOrders) -> ApplyOutcome {
        let mut inner = self.lock();
        if seq <= inner.last_applied_seq {
            warn!(
                "📦️ Discarding stale fetch #{seq}; fetch #{} has already been applied",
                inner.last_applied_seq
            );
            return ApplyOutcome::Stale;
        }
        inner.last_applied_seq = seq;
        let diff = Self::replace_orders(&mut inner, fetched, Utc::now());
        debug!("📦️ Applied fetch #{seq}: {}", describe(&inner.state, &diff));
        ApplyOutcome::Applied(diff)
    }

    /// Applies orders another context fetched at `fetched_at`. Data no newer than what is cached here is discarded.
    /// Local fetches in flight are unaffected and still apply when they complete.
    pub fn apply_shared(&self, fetched_at: DateTime<Utc>, fetched: FetchedOrders) -> ApplyOutcome {
        let mut inner = self.lock();
        if let Some(last) = inner.state.last_fetch_at.filter(|last| *last >= fetched_at) {
            debug!("📦️ Discarding orders shared from {fetched_at}; the cache holds data from {last}");
            return ApplyOutcome::Stale;
        }
        let diff = Self::replace_orders(&mut inner, fetched, fetched_at);
        debug!("📦️ Applied shared orders from {fetched_at}: {}", describe(&inner.state, &diff));
        ApplyOutcome::Applied(diff)
    }

    fn replace_orders(inner: &mut StoreInner, fetched: FetchedOrders, fetched_at: DateTime<Utc>) -> OrderDiff {
        let diff = ChangeDetector::diff(&inner.state.orders, &fetched.orders);
        let state = &mut inner.state;
        let is_baseline = state.last_fetch_at.is_none() && state.orders.is_empty();
        if !is_baseline && diff.new_count() > 0 {
            state.new_orders_count += diff.new_count();
            state.has_new_orders = true;
        }
        state.orders = Arc::new(fetched.orders);
        state.subject = Some(fetched.subject);
        state.total = fetched.total;
        state.error = None;
        state.consecutive_failures = 0;
        state.is_loading = false;
        state.last_fetch_at = Some(fetched_at);
        inner.bump();
        diff
    }

    /// Records a failed fetch. Cached orders are kept; the error message escalates while failures continue.
    pub fn record_failure(&self, seq: u64, error: &SyncError) -> bool {
        let mut inner = self.lock();
        if seq <= inner.last_applied_seq {
            debug!("📦️ Ignoring failure of stale fetch #{seq}");
            return false;
        }
        inner.last_applied_seq = seq;
        let state = &mut inner.state;
        state.consecutive_failures += 1;
        state.is_loading = false;
        state.error = Some(match state.consecutive_failures {
            1 => format!("Could not refresh orders. {error}"),
            n => format!("Could not refresh orders. {error} (still failing after {n} attempts)"),
        });
        debug!("📦️ Fetch #{seq} failed. Keeping {} cached orders", state.orders.len());
        inner.bump();
        true
    }

    /// Applies the confirmed result of a mutation on a single order.
    pub fn accept_and_apply(&self, order: Order) {
        let mut inner = self.lock();
        let mut orders = OrderSet::clone(&inner.state.orders);
        debug!("📦️ Applying accepted order {} ({})", order.id, order.status);
        orders.upsert(order);
        inner.state.orders = Arc::new(orders);
        inner.bump();
    }

    pub fn dismiss_new_orders_notification(&self) {
        let mut inner = self.lock();
        inner.state.has_new_orders = false;
        inner.state.new_orders_count = 0;
        inner.bump();
    }

    /// Drops completed and cancelled orders created before `now - retention` from the local cache. The remote source
    /// is not touched. Returns the number of orders removed.
    pub fn cleanup_old_orders(&self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = now - retention;
        let mut inner = self.lock();
        let mut orders = OrderSet::clone(&inner.state.orders);
        let before = orders.len();
        orders.retain(|o| !(o.status.is_terminal() && o.created_at < cutoff));
        let removed = before - orders.len();
        if removed > 0 {
            inner.state.orders = Arc::new(orders);
            inner.bump();
            info!("📦️ Removed {removed} finished orders older than {cutoff} from the local cache");
        }
        removed
    }

    /// Forgets everything. Sequence and version tracking are kept so that a fetch still in flight cannot resurrect old
    /// data.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = SyncState::default();
        inner.bump();
        inner.last_applied_seq = inner.last_applied_seq.max(inner.issued_seq);
        debug!("📦️ Order store reset");
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn describe(state: &SyncState, diff: &OrderDiff) -> String {
    format!(
        "{} orders ({} added, {} changed, {} removed), {} unacknowledged new",
        state.orders.len(),
        diff.added.len(),
        diff.changed.len(),
        diff.removed.len(),
        state.new_orders_count
    )
}
