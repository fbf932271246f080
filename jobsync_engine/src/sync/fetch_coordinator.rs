//! The only path by which the engine talks to the remote order source.
//!
//! Fetches are coalesced per subject token and order mutations per order id (see [`SingleFlight`]). Every result,
//! whether it came from the remote source or from another context through the shared store, flows through the same
//! pipeline: diff and apply in the [`OrderStore`], notify the [`Broadcaster`], then fire the event hooks.
use std::{
    fmt::Display,
    future::Future,
    sync::{Arc, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::*;
use serde::{Deserialize, Serialize};

use crate::{
    events::{EventProducers, NewOrdersEvent, OrderAcceptedEvent, SyncFailedEvent},
    order_types::{FetchedOrders, Order, OrderId, OrderSet, SubjectToken},
    sync::{
        broadcaster::Broadcaster,
        errors::SyncError,
        order_store::{ApplyOutcome, OrderStore},
        single_flight::SingleFlight,
    },
    traits::{AcceptOutcome, OrderSourceError, PersistentKv, RemoteOrderSource},
};

/// Mutations a subject can perform on a single order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderAction {
    Accept,
}

impl Display for OrderAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderAction::Accept => write!(f, "accept"),
        }
    }
}

/// Order data one context publishes for the others, so that followers stay current without fetching themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedSnapshot {
    /// [`SubjectToken::fingerprint`] of the token the data was fetched with.
    pub subject_fingerprint: String,
    pub fetched_at: DateTime<Utc>,
    pub data: FetchedOrders,
}

impl SharedSnapshot {
    pub fn new(token: &SubjectToken, data: FetchedOrders) -> Self {
        Self { subject_fingerprint: token.fingerprint(), fetched_at: Utc::now(), data }
    }
}

/// Receives order snapshots published by other contexts.
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    /// Returns true if the snapshot was applied.
    async fn apply_shared_snapshot(&self, snapshot: SharedSnapshot) -> bool;
}

struct SnapshotTarget {
    kv: Arc<dyn PersistentKv>,
    key: String,
}

pub struct FetchCoordinator<S> {
    source: Arc<S>,
    store: Arc<OrderStore>,
    broadcaster: Arc<Broadcaster>,
    producers: EventProducers,
    fetch_timeout: Duration,
    snapshots: Option<SnapshotTarget>,
    subject_token: RwLock<Option<SubjectToken>>,
    syncs: Arc<SingleFlight<SubjectToken, Arc<OrderSet>>>,
    mutations: Arc<SingleFlight<OrderId, Order>>,
}

impl<S> FetchCoordinator<S>
where S: RemoteOrderSource + 'static
{
    pub fn new(
        source: Arc<S>,
        store: Arc<OrderStore>,
        broadcaster: Arc<Broadcaster>,
        producers: EventProducers,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            source,
            store,
            broadcaster,
            producers,
            fetch_timeout,
            snapshots: None,
            subject_token: RwLock::new(None),
            syncs: Arc::new(SingleFlight::new()),
            mutations: Arc::new(SingleFlight::new()),
        }
    }

    /// Publishes every successfully fetched order set under `key` in `kv`.
    pub fn with_snapshot_sharing(mut self, kv: Arc<dyn PersistentKv>, key: impl Into<String>) -> Self {
        self.snapshots = Some(SnapshotTarget { kv, key: key.into() });
        self
    }

    pub fn subject_token(&self) -> Option<SubjectToken> {
        self.subject_token.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Replaces the token used by [`Self::sync_current`]. Switching to a different subject discards the cached orders
    /// of the previous one.
    pub fn set_subject_token(&self, token: Option<SubjectToken>) {
        let changed = {
            let mut current = self.subject_token.write().unwrap_or_else(|p| p.into_inner());
            let changed = *current != token;
            *current = token;
            changed
        };
        if changed {
            info!("🔄️ Subject token changed. Clearing cached orders");
            self.store.reset();
            self.broadcaster.notify(&self.store.snapshot());
        }
    }

    pub fn store(&self) -> &Arc<OrderStore> {
        &self.store
    }

    /// Fetches with the current subject token.
    pub async fn sync_current(self: &Arc<Self>) -> Result<Arc<OrderSet>, SyncError> {
        let token = self.subject_token();
        self.sync(token.as_ref()).await
    }

    /// Fetches the subject's orders and applies them. If a fetch for the same token is already running, waits for it
    /// and returns its result instead of starting another one.
    pub async fn sync(self: &Arc<Self>, token: Option<&SubjectToken>) -> Result<Arc<OrderSet>, SyncError> {
        let token = token.ok_or(SyncError::AuthenticationMissing)?.clone();
        let this = Arc::clone(self);
        let task_token = token.clone();
        self.syncs
            .run(token, move || {
                // Issued before the task is spawned, so a token change that lands before it first runs retires it
                let seq = this.store.next_sequence();
                this.run_fetch(task_token, seq)
            })
            .await
    }

    /// Performs `action` on `order_id`. Concurrent requests for the same order share one remote call.
    pub async fn mutate(
        self: &Arc<Self>,
        token: Option<&SubjectToken>,
        order_id: &OrderId,
        action: OrderAction,
    ) -> Result<Order, SyncError> {
        let token = token.ok_or(SyncError::AuthenticationMissing)?.clone();
        let this = Arc::clone(self);
        let task_id = order_id.clone();
        self.mutations.run(order_id.clone(), move || this.run_mutation(token, task_id, action)).await
    }

    /// Asks the source to pull fresh data from its upstream provider, then refreshes the local view if anything
    /// changed.
    pub async fn sync_from_upstream(self: &Arc<Self>) -> Result<Arc<OrderSet>, SyncError> {
        info!("🔄️ Requesting an upstream sync");
        let report = self.with_timeout(self.source.sync_from_upstream()).await?;
        info!("🔄️ Upstream sync finished: {report}");
        if report.has_changes() {
            self.sync_current().await
        } else {
            Ok(self.store.orders())
        }
    }

    async fn run_fetch(self: Arc<Self>, token: SubjectToken, seq: u64) -> Result<Arc<OrderSet>, SyncError> {
        debug!("🔄️ Starting fetch #{seq}");
        self.store.begin_fetch(seq);
        self.broadcaster.notify(&self.store.snapshot());
        match self.with_timeout(self.source.fetch_orders(&token)).await {
            Ok(fetched) => {
                let shared = self.snapshots.as_ref().map(|_| SharedSnapshot::new(&token, fetched.clone()));
                let subject_id = fetched.subject.id.clone();
                let outcome = self.store.apply(seq, fetched);
                let applied = matches!(outcome, ApplyOutcome::Applied(_));
                let orders = self.after_apply(subject_id, outcome).await;
                if let Some(snapshot) = shared.filter(|_| applied) {
                    self.publish_snapshot(&snapshot);
                }
                Ok(orders)
            },
            Err(e) => {
                self.handle_failure(seq, e.clone()).await;
                Err(e)
            },
        }
    }

    async fn run_mutation(
        self: Arc<Self>,
        token: SubjectToken,
        order_id: OrderId,
        action: OrderAction,
    ) -> Result<Order, SyncError> {
        debug!("🔄️ Sending {action} for order {order_id}");
        let outcome = match action {
            OrderAction::Accept => self.with_timeout(self.source.accept_order(&token, &order_id)).await,
        };
        let outcome = outcome.map_err(|e| {
            warn!("🔄️ Could not {action} order {order_id}. {e}");
            e
        })?;
        let already_accepted = matches!(outcome, AcceptOutcome::AlreadyAccepted(_));
        let order = outcome.into_order();
        if already_accepted {
            info!("🔄️ Order {order_id} was already accepted by this subject");
        } else {
            info!("🔄️ Order {order_id} accepted");
        }
        self.store.accept_and_apply(order.clone());
        self.broadcaster.notify(&self.store.snapshot());
        self.producers.publish_order_accepted(OrderAcceptedEvent::new(order.clone(), already_accepted)).await;
        Ok(order)
    }

    async fn after_apply(&self, subject_id: String, outcome: ApplyOutcome) -> Arc<OrderSet> {
        match outcome {
            ApplyOutcome::Stale => self.store.orders(),
            ApplyOutcome::Applied(diff) => {
                let state = self.store.snapshot();
                self.broadcaster.notify(&state);
                // The baseline population leaves `has_new_orders` untouched
                if diff.new_count() > 0 && state.has_new_orders {
                    info!("🔄️ {} new orders for subject {subject_id}", diff.new_count());
                    let event = NewOrdersEvent::new(Some(subject_id), diff.added, state.new_orders_count);
                    self.producers.publish_new_orders(event).await;
                }
                Arc::clone(&state.orders)
            },
        }
    }

    async fn handle_failure(&self, seq: u64, error: SyncError) {
        if !self.store.record_failure(seq, &error) {
            return;
        }
        let state = self.store.snapshot();
        self.broadcaster.notify(&state);
        error!("🔄️ Fetch #{seq} failed ({} in a row). {error}", state.consecutive_failures);
        self.producers.publish_sync_failed(SyncFailedEvent::new(error, state.consecutive_failures)).await;
    }

    fn publish_snapshot(&self, snapshot: &SharedSnapshot) {
        let Some(target) = &self.snapshots else {
            return;
        };
        let payload = match serde_json::to_string(snapshot) {
            Ok(p) => p,
            Err(e) => {
                warn!("🔄️ Could not serialize the order snapshot. {e}");
                return;
            },
        };
        match target.kv.set(&target.key, &payload) {
            Ok(()) => trace!("🔄️ Shared snapshot of {} orders", snapshot.data.orders.len()),
            Err(e) => warn!("🔄️ Could not share the order snapshot with other contexts. {e}"),
        }
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, SyncError>
    where F: Future<Output = Result<T, OrderSourceError>> {
        match tokio::time::timeout(self.fetch_timeout, call).await {
            Ok(result) => result.map_err(SyncError::from),
            Err(_) => Err(SyncError::RemoteUnavailable(format!(
                "No response after {}s",
                self.fetch_timeout.as_secs_f32()
            ))),
        }
    }
}

#[async_trait]
impl<S> SnapshotSink for FetchCoordinator<S>
where S: RemoteOrderSource + 'static
{
    async fn apply_shared_snapshot(&self, snapshot: SharedSnapshot) -> bool {
        let Some(token) = self.subject_token() else {
            debug!("🔄️ Ignoring a shared snapshot. No subject is signed in here");
            return false;
        };
        if token.fingerprint() != snapshot.subject_fingerprint {
            debug!("🔄️ Ignoring a shared snapshot for a different subject");
            return false;
        }
        let subject_id = snapshot.data.subject.id.clone();
        let outcome = self.store.apply_shared(snapshot.fetched_at, snapshot.data);
        let applied = matches!(outcome, ApplyOutcome::Applied(_));
        self.after_apply(subject_id, outcome).await;
        applied
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use jobsync_common::Amount;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        events::EventProducer,
        kv::MemoryKvHub,
        order_types::{OrderStatusType, SubjectInfo, UpstreamSyncReport},
        traits::MockRemoteOrderSource,
    };

    fn order(id: &str, status: OrderStatusType) -> Order {
        Order::new(id, status, Utc::now(), Amount::from_units(45))
    }

    fn fetched(ids: &[&str]) -> FetchedOrders {
        let orders = ids.iter().map(|id| order(id, OrderStatusType::Pending)).collect();
        FetchedOrders::new(orders, SubjectInfo { id: "partner-1".into(), ..Default::default() })
    }

    fn coordinator(source: MockRemoteOrderSource) -> Arc<FetchCoordinator<MockRemoteOrderSource>> {
        coordinator_with(source, EventProducers::default())
    }

    fn coordinator_with(
        source: MockRemoteOrderSource,
        producers: EventProducers,
    ) -> Arc<FetchCoordinator<MockRemoteOrderSource>> {
        let coordinator = FetchCoordinator::new(
            Arc::new(source),
            Arc::new(OrderStore::new()),
            Arc::new(Broadcaster::new()),
            producers,
            Duration::from_secs(5),
        );
        coordinator.set_subject_token(Some(SubjectToken::new("token")));
        Arc::new(coordinator)
    }

    #[tokio::test]
    async fn missing_token_is_not_recorded() {
        let mut source = MockRemoteOrderSource::new();
        source.expect_fetch_orders().never();
        let coordinator = coordinator(source);
        let result = coordinator.sync(None).await;
        assert_eq!(result, Err(SyncError::AuthenticationMissing));
        assert_eq!(coordinator.store().snapshot().error, None);
    }

    #[tokio::test]
    async fn failure_keeps_cached_orders() {
        let mut source = MockRemoteOrderSource::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        source.expect_fetch_orders().returning(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(fetched(&["A", "B"]))
            } else {
                Err(OrderSourceError::Unavailable("connection reset".into()))
            }
        });
        let coordinator = coordinator(source);
        coordinator.sync_current().await.unwrap();
        let err = coordinator.sync_current().await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteUnavailable(_)));
        let state = coordinator.store().snapshot();
        assert_eq!(state.orders.ids(), vec![OrderId::from("A"), OrderId::from("B")]);
        assert!(state.error.is_some());
        assert_eq!(state.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn new_orders_fire_the_hook_after_the_baseline() {
        let _ = env_logger::try_init();
        let mut source = MockRemoteOrderSource::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        source.expect_fetch_orders().returning(move |_| match counter.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(fetched(&["1"])),
            _ => Ok(fetched(&["2", "1"])),
        });
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let producers =
            EventProducers { new_orders_producer: vec![EventProducer::new(tx)], ..Default::default() };
        let coordinator = coordinator_with(source, producers);

        coordinator.sync_current().await.unwrap();
        assert!(rx.try_recv().is_err(), "the first population is not news");
        coordinator.sync_current().await.unwrap();
        let event = rx.recv().await.expect("new orders event");
        assert_eq!(event.orders.len(), 1);
        assert_eq!(event.orders[0].id, OrderId::from("2"));
        assert_eq!(event.unacknowledged, 1);
        assert_eq!(event.subject_id.as_deref(), Some("partner-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_releases_every_joiner() {
        struct Hanging;
        #[async_trait]
        impl RemoteOrderSource for Hanging {
            async fn fetch_orders(&self, _: &SubjectToken) -> Result<FetchedOrders, OrderSourceError> {
                std::future::pending().await
            }

            async fn accept_order(&self, _: &SubjectToken, _: &OrderId) -> Result<AcceptOutcome, OrderSourceError> {
                std::future::pending().await
            }

            async fn sync_from_upstream(&self) -> Result<UpstreamSyncReport, OrderSourceError> {
                std::future::pending().await
            }
        }
        let coordinator = Arc::new(FetchCoordinator::new(
            Arc::new(Hanging),
            Arc::new(OrderStore::new()),
            Arc::new(Broadcaster::new()),
            EventProducers::default(),
            Duration::from_secs(30),
        ));
        let token = SubjectToken::new("token");
        let (a, b) = tokio::join!(coordinator.sync(Some(&token)), coordinator.sync(Some(&token)));
        assert!(matches!(a, Err(SyncError::RemoteUnavailable(_))));
        assert_eq!(a, b);
        assert!(!coordinator.store().snapshot().is_loading);
    }

    #[tokio::test]
    async fn concurrent_accepts_of_one_order_share_a_call() {
        let gate = Arc::new(Notify::new());
        struct Gated {
            gate: Arc<Notify>,
            calls: AtomicUsize,
        }
        #[async_trait]
        impl RemoteOrderSource for Gated {
            async fn fetch_orders(&self, _: &SubjectToken) -> Result<FetchedOrders, OrderSourceError> {
                Ok(fetched(&[]))
            }

            async fn accept_order(&self, _: &SubjectToken, id: &OrderId) -> Result<AcceptOutcome, OrderSourceError> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.gate.notified().await;
                Ok(AcceptOutcome::Accepted(Order::new(
                    id.clone(),
                    OrderStatusType::Assigned,
                    Utc::now(),
                    Amount::from_units(45),
                )))
            }

            async fn sync_from_upstream(&self) -> Result<UpstreamSyncReport, OrderSourceError> {
                Ok(UpstreamSyncReport::default())
            }
        }
        let source = Arc::new(Gated { gate: gate.clone(), calls: AtomicUsize::new(0) });
        let coordinator = Arc::new(FetchCoordinator::new(
            source.clone(),
            Arc::new(OrderStore::new()),
            Arc::new(Broadcaster::new()),
            EventProducers::default(),
            Duration::from_secs(5),
        ));
        let token = SubjectToken::new("token");
        let id = OrderId::from("77");
        let releaser = {
            let gate = gate.clone();
            async move {
                for _ in 0..20 {
                    tokio::task::yield_now().await;
                }
                gate.notify_one();
            }
        };
        let (a, b, _) = tokio::join!(
            coordinator.mutate(Some(&token), &id, OrderAction::Accept),
            coordinator.mutate(Some(&token), &id, OrderAction::Accept),
            releaser
        );
        assert_eq!(a.unwrap().status, OrderStatusType::Assigned);
        assert_eq!(b.unwrap().id, id);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.store().snapshot().orders.ids(), vec![id]);
    }

    #[tokio::test]
    async fn rejected_accept_is_not_stored() {
        let mut source = MockRemoteOrderSource::new();
        source
            .expect_accept_order()
            .returning(|_, _| Err(OrderSourceError::Rejected { status: 409, reason: "taken".into() }));
        let coordinator = coordinator(source);
        let token = coordinator.subject_token();
        let err = coordinator.mutate(token.as_ref(), &OrderId::from("5"), OrderAction::Accept).await.unwrap_err();
        assert!(matches!(err, SyncError::RemoteRejected(_)));
        assert_eq!(coordinator.store().snapshot().error, None);
    }

    #[tokio::test]
    async fn upstream_sync_refreshes_only_on_changes() {
        let mut source = MockRemoteOrderSource::new();
        let reports = Arc::new(AtomicUsize::new(0));
        let counter = reports.clone();
        source.expect_sync_from_upstream().returning(move || {
            let created = if counter.fetch_add(1, Ordering::SeqCst) == 0 { 0 } else { 2 };
            Ok(UpstreamSyncReport { created, ..Default::default() })
        });
        source.expect_fetch_orders().times(1).returning(|_| Ok(fetched(&["1", "2"])));
        let coordinator = coordinator(source);
        assert!(coordinator.sync_from_upstream().await.unwrap().is_empty());
        assert_eq!(coordinator.sync_from_upstream().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn snapshots_are_shared_and_applied_for_the_same_subject() {
        let hub = MemoryKvHub::new();
        let mut source = MockRemoteOrderSource::new();
        source.expect_fetch_orders().returning(|_| Ok(fetched(&["9", "8"])));
        let owner = FetchCoordinator::new(
            Arc::new(source),
            Arc::new(OrderStore::new()),
            Arc::new(Broadcaster::new()),
            EventProducers::default(),
            Duration::from_secs(5),
        )
        .with_snapshot_sharing(Arc::new(hub.open()), "test.orders.snapshot");
        owner.set_subject_token(Some(SubjectToken::new("token")));
        let owner = Arc::new(owner);
        owner.sync_current().await.unwrap();

        let payload = hub.peek("test.orders.snapshot").expect("snapshot was published");
        let snapshot: SharedSnapshot = serde_json::from_str(&payload).unwrap();
        assert!(!payload.contains("\"token\""));

        let mut follower_source = MockRemoteOrderSource::new();
        follower_source.expect_fetch_orders().never();
        let follower = coordinator(follower_source);
        assert!(follower.apply_shared_snapshot(snapshot.clone()).await);
        assert_eq!(follower.store().snapshot().orders.ids(), vec![OrderId::from("9"), OrderId::from("8")]);

        follower.set_subject_token(Some(SubjectToken::new("someone-else")));
        assert!(!follower.apply_shared_snapshot(snapshot).await);
        assert!(follower.store().snapshot().orders.is_empty());
    }

    #[tokio::test]
    async fn late_snapshots_do_not_overwrite_a_newer_fetch() {
        let mut source = MockRemoteOrderSource::new();
        source.expect_fetch_orders().returning(|_| {
            let subject = SubjectInfo { id: "partner-1".into(), ..Default::default() };
            Ok(FetchedOrders::new(vec![order("1", OrderStatusType::Assigned)], subject))
        });
        let coordinator = coordinator(source);
        coordinator.sync_current().await.unwrap();
        let token = coordinator.subject_token().unwrap();

        let mut late = SharedSnapshot::new(&token, fetched(&["1"]));
        late.fetched_at = Utc::now() - chrono::Duration::seconds(10);
        assert!(!coordinator.apply_shared_snapshot(late).await);
        assert_eq!(coordinator.store().snapshot().orders.orders()[0].status, OrderStatusType::Assigned);

        let newer = SharedSnapshot::new(&token, fetched(&["1", "2"]));
        assert!(coordinator.apply_shared_snapshot(newer).await);
        assert_eq!(coordinator.store().snapshot().orders.len(), 2);
    }

    #[tokio::test]
    async fn token_change_before_the_fetch_runs_discards_its_result() {
        let mut source = MockRemoteOrderSource::new();
        source.expect_fetch_orders().times(1).returning(|_| Ok(fetched(&["old-subject"])));
        let coordinator = coordinator(source);
        let mut pending = Box::pin(coordinator.sync_current());
        assert!(futures_util::poll!(pending.as_mut()).is_pending());
        coordinator.set_subject_token(Some(SubjectToken::new("another-token")));
        pending.await.unwrap();
        let state = coordinator.store().snapshot();
        assert!(state.orders.is_empty());
        assert_eq!(state.subject, None);
        assert!(!state.is_loading);
    }
}
