//! Bounded channels between the sync pipeline and host-supplied async hooks.
//!
//! The fetch coordinator publishes events (new orders arrived, an order was accepted, a sync failed) through an
//! [`EventProducer`]; each [`EventHandler`] runs the host's hook for every event in its own task. Hooks only ever see
//! the event, never the engine's state.
use std::{future::Future, pin::Pin, sync::Arc};

use log::*;
use tokio::{
    sync::mpsc,
    task::{JoinError, JoinSet},
};

pub type Handler<E> = Arc<dyn Fn(E) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

pub struct EventHandler<E: Send + Sync + 'static> {
    name: &'static str,
    listener: mpsc::Receiver<E>,
    sender: mpsc::Sender<E>,
    handler: Handler<E>,
}

impl<E: Send + Sync + 'static> EventHandler<E> {
    pub fn new(name: &'static str, buffer_size: usize, handler: Handler<E>) -> Self {
        let (sender, listener) = mpsc::channel(buffer_size.max(1));
        Self { name, listener, sender, handler }
    }

    pub fn subscribe(&self) -> EventProducer<E> {
        EventProducer { name: self.name, sender: self.sender.clone() }
    }

    /// Runs hooks until every producer has been dropped, then waits for the hooks still running.
    pub async fn start_handler(mut self) {
        let name = self.name;
        debug!("📬️ Starting the {name} hook");
        drop(self.sender);
        let mut jobs = JoinSet::new();
        loop {
            tokio::select! {
                ev = self.listener.recv() => match ev {
                    Some(ev) => {
                        trace!("📬️ Running the {name} hook");
                        jobs.spawn((self.handler)(ev));
                    },
                    None => break,
                },
                Some(done) = jobs.join_next(), if !jobs.is_empty() => report(name, done),
            }
        }
        if !jobs.is_empty() {
            debug!("📬️ Waiting for {} {name} hooks to complete", jobs.len());
        }
        while let Some(done) = jobs.join_next().await {
            report(name, done);
        }
        debug!("📬️ The {name} hook has shut down");
    }
}

fn report(name: &str, done: Result<(), JoinError>) {
    if let Err(e) = done {
        error!("📬️ A {name} hook did not complete. {e}");
    }
}

#[derive(Clone)]
pub struct EventProducer<E: Send + Sync> {
    name: &'static str,
    sender: mpsc::Sender<E>,
}

impl<E: Send + Sync> EventProducer<E> {
    #[cfg(test)]
    pub(crate) fn new(sender: mpsc::Sender<E>) -> Self {
        Self { name: "test", sender }
    }

    /// Waits for room in the channel. Events published after the handler has shut down are dropped.
    pub async fn publish_event(&self, event: E) {
        if self.sender.send(event).await.is_err() {
            warn!("📬️ The {} hook is no longer running. Event dropped", self.name);
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    };

    use super::*;
    use crate::order_types::OrderId;

    fn recording_handler(seen: Arc<Mutex<Vec<OrderId>>>) -> Handler<OrderId> {
        Arc::new(move |id: OrderId| {
            let seen = seen.clone();
            Box::pin(async move {
                tokio::time::sleep(tokio::time::Duration::from_millis(5)).await;
                seen.lock().unwrap().push(id);
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        })
    }

    #[tokio::test]
    async fn every_event_reaches_the_hook() {
        let _ = env_logger::try_init();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = EventHandler::new("order accepted", 1, recording_handler(seen.clone()));
        let coordinator = handler.subscribe();
        let host = handler.subscribe();
        tokio::spawn(async move {
            for i in 0..5 {
                coordinator.publish_event(OrderId::from(format!("c{i}"))).await;
            }
        });
        tokio::spawn(async move {
            for i in 0..5 {
                host.publish_event(OrderId::from(format!("h{i}"))).await;
            }
        });
        handler.start_handler().await;
        let mut seen = seen.lock().unwrap().iter().map(|id| id.as_str().to_string()).collect::<Vec<_>>();
        seen.sort();
        assert_eq!(seen, vec!["c0", "c1", "c2", "c3", "c4", "h0", "h1", "h2", "h3", "h4"]);
    }

    #[tokio::test]
    async fn a_panicking_hook_does_not_stop_the_others() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler: Handler<u32> = Arc::new(move |n: u32| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_ne!(n, 2, "hook failure");
            }) as Pin<Box<dyn Future<Output = ()> + Send>>
        });
        let handler = EventHandler::new("sync failed", 4, handler);
        let producer = handler.subscribe();
        let running = tokio::spawn(handler.start_handler());
        for n in 1..=4 {
            producer.publish_event(n).await;
        }
        drop(producer);
        running.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
