//! `OrderSyncEngine` is the single object host code talks to.
//!
//! It wires the [`FetchCoordinator`], [`OrderStore`], [`Broadcaster`], [`Scheduler`] and, when a shared store is
//! available, the [`CrossTabCoordinator`] together. Construct one per execution context, call [`start`] once a tokio
//! runtime is running, and [`shutdown`] when the context goes away.
//!
//! [`start`]: OrderSyncEngine::start
//! [`shutdown`]: OrderSyncEngine::shutdown
use std::sync::{Arc, Mutex};

use chrono::Utc;
use log::*;

use crate::{
    config::EngineConfig,
    cross_tab::CrossTabCoordinator,
    events::EventProducers,
    order_types::{Order, OrderId, OrderSet, SubjectToken},
    scheduler::{sync_action, Scheduler, SchedulerState, SchedulerStatus, Visibility},
    sync::{
        Broadcaster,
        FetchCoordinator,
        OrderAction,
        OrderStore,
        SnapshotSink,
        Subscription,
        SyncError,
        SyncState,
        SyncStateObserver,
    },
    traits::{PersistentKv, RemoteOrderSource},
};

pub struct OrderSyncEngine<S> {
    config: EngineConfig,
    store: Arc<OrderStore>,
    broadcaster: Arc<Broadcaster>,
    coordinator: Arc<FetchCoordinator<S>>,
    scheduler: Arc<Scheduler>,
    kv: Option<Arc<dyn PersistentKv>>,
    cross_tab: Mutex<Option<CrossTabCoordinator>>,
}

impl<S> OrderSyncEngine<S>
where S: RemoteOrderSource + 'static
{
    pub fn new(
        config: EngineConfig,
        source: S,
        kv: Option<Arc<dyn PersistentKv>>,
        producers: EventProducers,
    ) -> Self {
        let store = Arc::new(OrderStore::new());
        let broadcaster = Arc::new(Broadcaster::new());
        let mut coordinator = FetchCoordinator::new(
            Arc::new(source),
            Arc::clone(&store),
            Arc::clone(&broadcaster),
            producers,
            config.fetch_timeout,
        );
        if let Some(kv) = &kv {
            coordinator = coordinator.with_snapshot_sharing(Arc::clone(kv), config.storage_keys().snapshot);
        }
        let coordinator = Arc::new(coordinator);
        let weak = Arc::downgrade(&coordinator);
        let action = sync_action(move |reason| {
            let coordinator = weak.upgrade();
            async move {
                let Some(coordinator) = coordinator else {
                    return Ok(());
                };
                trace!("🚀️ {reason:?} sync");
                coordinator.sync_current().await.map(|_| ())
            }
        });
        let scheduler = Arc::new(Scheduler::new(&config, kv.clone(), action));
        Self::install_idle_reset(&broadcaster, &store, &scheduler);
        Self { config, store, broadcaster, coordinator, scheduler, kv, cross_tab: Mutex::new(None) }
    }

    /// Drops the cached state when the last observer leaves while the schedule is stopped.
    fn install_idle_reset(broadcaster: &Arc<Broadcaster>, store: &Arc<OrderStore>, scheduler: &Arc<Scheduler>) {
        let store = Arc::clone(store);
        let scheduler = Arc::downgrade(scheduler);
        let weak_broadcaster = Arc::downgrade(broadcaster);
        broadcaster.set_idle_hook(move || {
            let stopped = scheduler.upgrade().map_or(true, |s| s.status() == SchedulerStatus::Stopped);
            if !stopped {
                return;
            }
            debug!("🚀️ Last subscriber left with the schedule stopped. Clearing order state");
            store.reset();
            if let Some(broadcaster) = weak_broadcaster.upgrade() {
                broadcaster.reset();
            }
        });
    }

    /// Resumes the persisted schedule, starts following other contexts and, if a subject is signed in, loads the
    /// orders in the background.
    pub fn start(&self) -> SchedulerState {
        // The listener must be running before restore() claims the timer
        if let Some(kv) = &self.kv {
            let mut cross_tab = self.cross_tab.lock().unwrap_or_else(|p| p.into_inner());
            if cross_tab.as_ref().map_or(true, |c| !c.is_running()) {
                let sink: Arc<dyn SnapshotSink> = self.coordinator.clone();
                *cross_tab = Some(CrossTabCoordinator::spawn(
                    Arc::clone(kv),
                    self.config.storage_keys(),
                    Arc::clone(&self.scheduler),
                    sink,
                ));
            }
        }
        let state = self.scheduler.restore();
        if self.coordinator.subject_token().is_some() {
            let coordinator = Arc::clone(&self.coordinator);
            tokio::spawn(async move {
                if let Err(e) = coordinator.sync_current().await {
                    debug!("🚀️ Initial load failed. {e}");
                }
            });
        }
        info!("🚀️ Order sync engine started. Schedule enabled: {}", state.enabled);
        state
    }

    /// Stops this context's timer and listeners. Fetches already in flight still complete.
    pub fn shutdown(&self) {
        self.scheduler.detach();
        if let Some(cross_tab) = self.cross_tab.lock().unwrap_or_else(|p| p.into_inner()).take() {
            cross_tab.stop();
        }
        info!("🚀️ Order sync engine shut down");
    }

    pub fn set_subject_token(&self, token: Option<SubjectToken>) {
        self.coordinator.set_subject_token(token);
    }

    pub fn subscribe(&self, observer: Arc<dyn SyncStateObserver>) -> Subscription {
        self.broadcaster.subscribe(observer)
    }

    pub fn get_snapshot(&self) -> SyncState {
        self.store.snapshot()
    }

    /// Fetches now, joining a fetch that is already running.
    pub async fn refresh(&self) -> Result<Arc<OrderSet>, SyncError> {
        self.coordinator.sync_current().await
    }

    pub async fn accept_order(&self, order_id: &OrderId) -> Result<Order, SyncError> {
        let token = self.coordinator.subject_token();
        self.coordinator.mutate(token.as_ref(), order_id, OrderAction::Accept).await
    }

    pub fn dismiss_new_orders_notification(&self) {
        self.store.dismiss_new_orders_notification();
        self.broadcaster.notify(&self.store.snapshot());
    }

    /// Drops finished orders older than the configured retention window from the local cache.
    pub fn cleanup_old_orders(&self) -> usize {
        let removed = self.store.cleanup_old_orders(Utc::now(), self.config.retention);
        if removed > 0 {
            self.broadcaster.notify(&self.store.snapshot());
        }
        removed
    }

    pub fn toggle_schedule(&self) -> bool {
        self.scheduler.toggle()
    }

    pub fn trigger_manual_fetch(&self) {
        self.scheduler.trigger_manual_fetch();
    }

    pub fn set_visibility(&self, visibility: Visibility) {
        self.scheduler.set_visibility(visibility);
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.scheduler.state()
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub async fn sync_from_upstream(&self) -> Result<Arc<OrderSet>, SyncError> {
        self.coordinator.sync_from_upstream().await
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<S> Drop for OrderSyncEngine<S> {
    fn drop(&mut self) {
        self.scheduler.detach();
    }
}
