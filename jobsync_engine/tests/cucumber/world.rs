use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use cucumber::World;
use jobsync_engine::{
    events::EventProducers,
    order_types::{OrderSet, OrderStatusType},
    sync::FnObserver,
    test_utils::{prepare_env::random_subject_token, FakeOrderSource},
    EngineConfig,
    OrderSyncEngine,
    Subscription,
    SyncError,
    SyncState,
};
use log::*;
use tokio::task::JoinHandle;

#[derive(Default, Debug, World)]
pub struct SyncWorld {
    pub system: Option<SyncSystem>,
}

pub struct SyncSystem {
    pub source: FakeOrderSource,
    pub engine: Arc<OrderSyncEngine<FakeOrderSource>>,
    pub deliveries: Arc<AtomicUsize>,
    pub subscription: Option<Subscription>,
    pub in_flight: Vec<JoinHandle<Result<Arc<OrderSet>, SyncError>>>,
    pub results: Vec<Result<Arc<OrderSet>, SyncError>>,
    pub last_accept: Option<Result<OrderStatusType, SyncError>>,
}

impl Debug for SyncSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SyncSystem({:?})", self.engine.get_snapshot())
    }
}

impl SyncWorld {
    pub fn system(&mut self) -> &mut SyncSystem {
        self.system.get_or_insert_with(SyncSystem::new)
    }

    pub fn engine(&mut self) -> Arc<OrderSyncEngine<FakeOrderSource>> {
        Arc::clone(&self.system().engine)
    }

    pub fn source(&mut self) -> FakeOrderSource {
        self.system().source.clone()
    }
}

impl SyncSystem {
    pub fn new() -> Self {
        let source = FakeOrderSource::new("partner-42");
        let engine = OrderSyncEngine::new(EngineConfig::default(), source.clone(), None, EventProducers::default());
        engine.set_subject_token(Some(random_subject_token()));
        debug!("🚀️ Created sync engine for scenario");
        Self {
            source,
            engine: Arc::new(engine),
            deliveries: Arc::new(AtomicUsize::new(0)),
            subscription: None,
            in_flight: Vec::new(),
            results: Vec::new(),
            last_accept: None,
        }
    }

    pub fn subscribe(&mut self) {
        let deliveries = Arc::clone(&self.deliveries);
        let observer = Arc::new(FnObserver(move |state: &SyncState| {
            trace!("🚀️ Observer saw {} orders", state.orders.len());
            deliveries.fetch_add(1, Ordering::SeqCst);
        }));
        self.subscription = Some(self.engine.subscribe(observer));
    }

    pub fn deliveries(&self) -> usize {
        self.deliveries.load(Ordering::SeqCst)
    }
}
