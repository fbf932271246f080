use chrono::{DateTime, Duration, Utc};
use jobsync_common::Amount;
use log::*;

use crate::order_types::{Order, OrderStatusType, SubjectToken};

pub fn prepare_test_env() {
    dotenvy::from_filename(".env.test").ok();
    let _ = env_logger::try_init();
    debug!("🚀️ Logging initialised");
}

pub fn random_subject_token() -> SubjectToken {
    SubjectToken::new(format!("test-token-{:016x}", rand::random::<u64>()))
}

/// An order with the given id and status, created `age_hours` ago.
pub fn order_aged(id: &str, status: OrderStatusType, age_hours: i64) -> Order {
    let created_at: DateTime<Utc> = Utc::now() - Duration::hours(age_hours);
    Order::new(id, status, created_at, Amount::from_units(100))
}

pub fn pending(id: &str) -> Order {
    order_aged(id, OrderStatusType::Pending, 1)
}
