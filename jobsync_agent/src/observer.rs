use std::sync::Mutex;

use jobsync_engine::{SyncState, SyncStateObserver};
use log::*;

use crate::formatting::{format_orders, format_summary};

/// Prints every state change. The order table is reprinted whenever the number of unacknowledged new orders grows.
#[derive(Default)]
pub struct ConsoleObserver {
    new_orders_seen: Mutex<usize>,
}

impl ConsoleObserver {
    /// Returns true if the order table should be printed for this state.
    fn new_orders_grew(&self, state: &SyncState) -> bool {
        let mut seen = self.new_orders_seen.lock().unwrap_or_else(|p| p.into_inner());
        let grew = state.new_orders_count > *seen;
        *seen = state.new_orders_count;
        grew
    }
}

impl SyncStateObserver for ConsoleObserver {
    fn on_change(&self, state: &SyncState) {
        let summary = format_summary(state);
        info!("📬️ {summary}");
        println!("{summary}");
        if self.new_orders_grew(state) {
            println!("{}", format_orders(state.orders.orders()));
        }
    }
}
