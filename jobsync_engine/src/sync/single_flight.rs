use std::{
    collections::HashMap,
    future::Future,
    hash::Hash,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
        Mutex,
        MutexGuard,
    },
};

use futures_util::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use log::*;

use crate::sync::SyncError;

type SharedResult<T> = Shared<BoxFuture<'static, Result<T, SyncError>>>;

struct Flight<T> {
    ticket: u64,
    result: SharedResult<T>,
}

/// Runs at most one operation per key at a time. Callers arriving while an operation for their key is running join
/// it and receive a clone of its result.
///
/// Operations run as their own tokio task, so they complete even if every caller stops waiting.
pub struct SingleFlight<K, T> {
    flights: Mutex<HashMap<K, Flight<T>>>,
    next_ticket: AtomicU64,
}

impl<K, T> Default for SingleFlight<K, T> {
    fn default() -> Self {
        Self { flights: Mutex::new(HashMap::new()), next_ticket: AtomicU64::new(0) }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the operation running for `key`, or starts `operation` if there is none.
    pub async fn run<F, Fut>(self: &Arc<Self>, key: K, operation: F) -> Result<T, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        self.join_or_start(key, operation).await
    }

    fn join_or_start<F, Fut>(self: &Arc<Self>, key: K, operation: F) -> SharedResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, SyncError>> + Send + 'static,
    {
        let mut flights = self.lock();
        if let Some(flight) = flights.get(&key) {
            trace!("🔄️ Joining operation #{} already in flight", flight.ticket);
            return flight.result.clone();
        }
        let ticket = self.issue_ticket();
        let operation = operation();
        let this = Arc::clone(self);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let result = operation.await;
            this.finish(&task_key, ticket);
            result
        });
        let this = Arc::clone(self);
        let cleanup_key = key.clone();
        let result = async move {
            handle.await.unwrap_or_else(|e| {
                error!("🔄️ Operation #{ticket} crashed. {e}");
                this.finish(&cleanup_key, ticket);
                Err(SyncError::Internal(format!("Background task failed. {e}")))
            })
        }
        .boxed()
        .shared();
        flights.insert(key, Flight { ticket, result: result.clone() });
        result
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.lock().len()
    }

    fn finish(&self, key: &K, ticket: u64) {
        let mut flights = self.lock();
        if flights.get(key).map(|f| f.ticket) == Some(ticket) {
            flights.remove(key);
        }
    }

    fn issue_ticket(&self) -> u64 {
        self.next_ticket.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, Flight<T>>> {
        self.flights.lock().unwrap_or_else(|p| p.into_inner())
    }
}
