mod state;
mod timer;

pub use state::{SchedulerState, SchedulerStatus, Visibility};
pub use timer::{sync_action, Scheduler, SyncAction, SyncFuture, SyncReason, TimerRole};
