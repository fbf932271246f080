use chrono::{DateTime, Utc};

use crate::{order_types::Order, sync::SyncError};

/// Orders that were not in the cached set appeared in a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrdersEvent {
    pub subject_id: Option<String>,
    pub orders: Vec<Order>,
    /// The number of new orders not yet acknowledged by the consumer, including these.
    pub unacknowledged: usize,
    pub detected_at: DateTime<Utc>,
}

impl NewOrdersEvent {
    pub fn new(subject_id: Option<String>, orders: Vec<Order>, unacknowledged: usize) -> Self {
        Self { subject_id, orders, unacknowledged, detected_at: Utc::now() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderAcceptedEvent {
    pub order: Order,
    /// True if the source reported that this subject had already accepted the order.
    pub already_accepted: bool,
}

impl OrderAcceptedEvent {
    pub fn new(order: Order, already_accepted: bool) -> Self {
        Self { order, already_accepted }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncFailedEvent {
    pub error: SyncError,
    pub consecutive_failures: u32,
}

impl SyncFailedEvent {
    pub fn new(error: SyncError, consecutive_failures: u32) -> Self {
        Self { error, consecutive_failures }
    }
}
