//! Fetching, diffing, storing and broadcasting order data.
mod broadcaster;
mod change_detector;
mod errors;
mod fetch_coordinator;
mod order_store;
mod single_flight;

pub use broadcaster::{Broadcaster, FnObserver, SubscriberId, Subscription, SyncStateObserver};
pub use change_detector::{ChangeDetector, OrderDiff};
pub use errors::SyncError;
pub use fetch_coordinator::{FetchCoordinator, OrderAction, SharedSnapshot, SnapshotSink};
pub use order_store::{ApplyOutcome, OrderStore, SyncState};
pub use single_flight::SingleFlight;
