//! A scriptable in-memory [`RemoteOrderSource`].
//!
//! Unlike the mockall mock, the fake keeps state: accepting an order changes what the next fetch returns. Fetches
//! can be held at a gate so that tests can pile up concurrent callers before anything resolves.
use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
        Mutex,
    },
};

use async_trait::async_trait;
use log::*;
use tokio::sync::watch;

use crate::{
    order_types::{FetchedOrders, Order, OrderId, OrderStatusType, SubjectInfo, SubjectToken, UpstreamSyncReport},
    traits::{AcceptOutcome, OrderSourceError, RemoteOrderSource},
};

struct FakeState {
    orders: Mutex<Vec<Order>>,
    subject: SubjectInfo,
    failures: Mutex<VecDeque<OrderSourceError>>,
    upstream: Mutex<UpstreamSyncReport>,
    gate: watch::Sender<bool>,
    fetch_calls: AtomicUsize,
    accept_calls: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeOrderSource {
    state: Arc<FakeState>,
}

impl FakeOrderSource {
    pub fn new(subject_id: &str) -> Self {
        let (gate, _) = watch::channel(true);
        let state = FakeState {
            orders: Mutex::new(Vec::new()),
            subject: SubjectInfo { id: subject_id.to_string(), ..Default::default() },
            failures: Mutex::new(VecDeque::new()),
            upstream: Mutex::new(UpstreamSyncReport::default()),
            gate,
            fetch_calls: AtomicUsize::new(0),
            accept_calls: AtomicUsize::new(0),
        };
        Self { state: Arc::new(state) }
    }

    pub fn set_orders(&self, orders: Vec<Order>) {
        *self.state.orders.lock().unwrap() = orders;
    }

    pub fn orders(&self) -> Vec<Order> {
        self.state.orders.lock().unwrap().clone()
    }

    /// The next call (of any kind) fails with `error`. Queued failures are consumed in order.
    pub fn fail_next(&self, error: OrderSourceError) {
        self.state.failures.lock().unwrap().push_back(error);
    }

    pub fn set_upstream_report(&self, report: UpstreamSyncReport) {
        *self.state.upstream.lock().unwrap() = report;
    }

    /// Fetches block until [`Self::release_fetches`] is called.
    pub fn hold_fetches(&self) {
        self.state.gate.send_replace(false);
    }

    pub fn release_fetches(&self) {
        self.state.gate.send_replace(true);
    }

    pub fn fetch_calls(&self) -> usize {
        self.state.fetch_calls.load(Ordering::SeqCst)
    }

    pub fn accept_calls(&self) -> usize {
        self.state.accept_calls.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> Result<(), OrderSourceError> {
        match self.state.failures.lock().unwrap().pop_front() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteOrderSource for FakeOrderSource {
    async fn fetch_orders(&self, _token: &SubjectToken) -> Result<FetchedOrders, OrderSourceError> {
        let call = self.state.fetch_calls.fetch_add(1, Ordering::SeqCst) + 1;
        trace!("🔄️ Fake fetch #{call}");
        let mut gate = self.state.gate.subscribe();
        let opened = gate.wait_for(|open| *open).await.map(|_| ());
        opened.map_err(|e| OrderSourceError::Unavailable(e.to_string()))?;
        self.next_outcome()?;
        Ok(FetchedOrders::new(self.orders(), self.state.subject.clone()))
    }

    async fn accept_order(&self, _token: &SubjectToken, order_id: &OrderId) -> Result<AcceptOutcome, OrderSourceError> {
        self.state.accept_calls.fetch_add(1, Ordering::SeqCst);
        self.next_outcome()?;
        let mut orders = self.state.orders.lock().unwrap();
        let order = orders
            .iter_mut()
            .find(|o| &o.id == order_id)
            .ok_or_else(|| OrderSourceError::Rejected { status: 404, reason: format!("Order {order_id} not found") })?;
        match order.status {
            OrderStatusType::Pending => {
                order.status = OrderStatusType::Assigned;
                Ok(AcceptOutcome::Accepted(order.clone()))
            },
            OrderStatusType::Assigned => Ok(AcceptOutcome::AlreadyAccepted(order.clone())),
            status => Err(OrderSourceError::Rejected {
                status: 409,
                reason: format!("Order {order_id} is {status} and cannot be accepted"),
            }),
        }
    }

    async fn sync_from_upstream(&self) -> Result<UpstreamSyncReport, OrderSourceError> {
        self.next_outcome()?;
        Ok(*self.state.upstream.lock().unwrap())
    }
}
