use std::{future::Future, pin::Pin, sync::Arc};

use crate::events::{EventHandler, EventProducer, Handler, NewOrdersEvent, OrderAcceptedEvent, SyncFailedEvent};

#[derive(Default, Clone)]
pub struct EventProducers {
    pub new_orders_producer: Vec<EventProducer<NewOrdersEvent>>,
    pub order_accepted_producer: Vec<EventProducer<OrderAcceptedEvent>>,
    pub sync_failed_producer: Vec<EventProducer<SyncFailedEvent>>,
}

impl EventProducers {
    pub async fn publish_new_orders(&self, event: NewOrdersEvent) {
        for producer in &self.new_orders_producer {
            producer.publish_event(event.clone()).await;
        }
    }

    pub async fn publish_order_accepted(&self, event: OrderAcceptedEvent) {
        for producer in &self.order_accepted_producer {
            producer.publish_event(event.clone()).await;
        }
    }

    pub async fn publish_sync_failed(&self, event: SyncFailedEvent) {
        for producer in &self.sync_failed_producer {
            producer.publish_event(event.clone()).await;
        }
    }
}

pub struct EventHandlers {
    pub on_new_orders: Option<EventHandler<NewOrdersEvent>>,
    pub on_order_accepted: Option<EventHandler<OrderAcceptedEvent>>,
    pub on_sync_failed: Option<EventHandler<SyncFailedEvent>>,
}

impl EventHandlers {
    pub fn new(buffer_size: usize, hooks: EventHooks) -> Self {
        let on_new_orders = hooks.on_new_orders.map(|f| EventHandler::new("new orders", buffer_size, f));
        let on_order_accepted = hooks.on_order_accepted.map(|f| EventHandler::new("order accepted", buffer_size, f));
        let on_sync_failed = hooks.on_sync_failed.map(|f| EventHandler::new("sync failed", buffer_size, f));
        Self { on_new_orders, on_order_accepted, on_sync_failed }
    }

    pub fn producers(&self) -> EventProducers {
        let mut result = EventProducers::default();
        if let Some(handler) = &self.on_new_orders {
            result.new_orders_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_order_accepted {
            result.order_accepted_producer.push(handler.subscribe());
        }
        if let Some(handler) = &self.on_sync_failed {
            result.sync_failed_producer.push(handler.subscribe());
        }
        result
    }

    /// Spawns every configured handler. Each one shuts down once all of its producers have been dropped.
    pub fn start_handlers(self) {
        if let Some(handler) = self.on_new_orders {
            tokio::spawn(handler.start_handler());
        }
        if let Some(handler) = self.on_order_accepted {
            tokio::spawn(handler.start_handler());
        }
        if let Some(handler) = self.on_sync_failed {
            tokio::spawn(handler.start_handler());
        }
    }
}

#[derive(Default, Clone)]
pub struct EventHooks {
    pub on_new_orders: Option<Handler<NewOrdersEvent>>,
    pub on_order_accepted: Option<Handler<OrderAcceptedEvent>>,
    pub on_sync_failed: Option<Handler<SyncFailedEvent>>,
}

impl EventHooks {
    pub fn on_new_orders<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(NewOrdersEvent) -> Pin<Box<dyn Future<Output = ()> + Send>>) + Send + Sync + 'static {
        self.on_new_orders = Some(Arc::new(f));
        self
    }

    pub fn on_order_accepted<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(OrderAcceptedEvent) -> Pin<Box<dyn Future<Output = ()> + Send>>) + Send + Sync + 'static {
        self.on_order_accepted = Some(Arc::new(f));
        self
    }

    pub fn on_sync_failed<F>(&mut self, f: F) -> &mut Self
    where F: (Fn(SyncFailedEvent) -> Pin<Box<dyn Future<Output = ()> + Send>>) + Send + Sync + 'static {
        self.on_sync_failed = Some(Arc::new(f));
        self
    }
}
