//! Engine configuration.
//!
//! Every value has a default and can be overridden from the environment:
//!
//! | Variable                         | Meaning                                                  | Default   |
//! |----------------------------------|----------------------------------------------------------|-----------|
//! | `JOBSYNC_SYNC_PERIOD`            | Seconds between scheduled fetches                        | 300       |
//! | `JOBSYNC_FETCH_TIMEOUT`          | Seconds before a remote call is abandoned                | 30        |
//! | `JOBSYNC_RETENTION_HOURS`        | Age after which finished orders are trimmed locally      | 168       |
//! | `JOBSYNC_SKIP_FETCH_WHEN_HIDDEN` | Skip scheduled fetches while the host is hidden          | false     |
//! | `JOBSYNC_OWNER_STALE_AFTER`      | Seconds without owner heartbeat before a follower takes over | 3     |
//! | `JOBSYNC_STORAGE_PREFIX`         | Prefix for every key written to the shared store         | `jobsync` |
use std::{env, time::Duration};

use chrono::Duration as ChronoDuration;
use jobsync_common::helpers::{env_or_default, parse_boolean_flag};
use log::*;

pub const DEFAULT_SYNC_PERIOD_SECS: u64 = 300;
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_RETENTION_HOURS: i64 = 24 * 7;
pub const DEFAULT_OWNER_STALE_AFTER_SECS: u64 = 3;
pub const DEFAULT_STORAGE_PREFIX: &str = "jobsync";
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 25;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// The scheduler's countdown period, in whole seconds. Never zero.
    pub sync_period_secs: u64,
    /// Caller-visible timeout for every remote call.
    pub fetch_timeout: Duration,
    /// Completed and cancelled orders older than this are dropped from the local cache by `cleanup_old_orders`.
    pub retention: ChronoDuration,
    /// When true, scheduled fetches are skipped while the host reports itself hidden. Manual fetches always run.
    pub skip_fetch_when_hidden: bool,
    /// A follower that has not seen the owner's countdown for this long takes over the timer.
    pub owner_stale_after: Duration,
    /// Prefix for the keys the engine writes to the shared store.
    pub storage_prefix: String,
    /// Channel capacity for event hook handlers.
    pub event_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync_period_secs: DEFAULT_SYNC_PERIOD_SECS,
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECS),
            retention: ChronoDuration::hours(DEFAULT_RETENTION_HOURS),
            skip_fetch_when_hidden: false,
            owner_stale_after: Duration::from_secs(DEFAULT_OWNER_STALE_AFTER_SECS),
            storage_prefix: DEFAULT_STORAGE_PREFIX.to_string(),
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn from_env_or_default() -> Self {
        let mut sync_period_secs = env_or_default("JOBSYNC_SYNC_PERIOD", DEFAULT_SYNC_PERIOD_SECS);
        if sync_period_secs == 0 {
            warn!("🪛️ JOBSYNC_SYNC_PERIOD cannot be zero. Using the default, {DEFAULT_SYNC_PERIOD_SECS}s, instead.");
            sync_period_secs = DEFAULT_SYNC_PERIOD_SECS;
        }
        let fetch_timeout = Duration::from_secs(env_or_default("JOBSYNC_FETCH_TIMEOUT", DEFAULT_FETCH_TIMEOUT_SECS));
        let retention = ChronoDuration::hours(env_or_default("JOBSYNC_RETENTION_HOURS", DEFAULT_RETENTION_HOURS));
        let skip_fetch_when_hidden = parse_boolean_flag(env::var("JOBSYNC_SKIP_FETCH_WHEN_HIDDEN").ok(), false);
        let owner_stale_after =
            Duration::from_secs(env_or_default("JOBSYNC_OWNER_STALE_AFTER", DEFAULT_OWNER_STALE_AFTER_SECS));
        let storage_prefix = env::var("JOBSYNC_STORAGE_PREFIX").ok().filter(|s| !s.trim().is_empty()).unwrap_or_else(|| {
            debug!("🪛️ JOBSYNC_STORAGE_PREFIX is not set. Using '{DEFAULT_STORAGE_PREFIX}'.");
            DEFAULT_STORAGE_PREFIX.to_string()
        });
        info!(
            "🪛️ Sync period {sync_period_secs}s, fetch timeout {}s, retention {}h, skip when hidden: \
             {skip_fetch_when_hidden}",
            fetch_timeout.as_secs(),
            retention.num_hours()
        );
        Self {
            sync_period_secs,
            fetch_timeout,
            retention,
            skip_fetch_when_hidden,
            owner_stale_after,
            storage_prefix,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
        }
    }

    pub fn with_sync_period(mut self, secs: u64) -> Self {
        self.sync_period_secs = secs.max(1);
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn with_storage_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.storage_prefix = prefix.into();
        self
    }

    pub fn with_skip_fetch_when_hidden(mut self, skip: bool) -> Self {
        self.skip_fetch_when_hidden = skip;
        self
    }

    pub fn storage_keys(&self) -> StorageKeys {
        StorageKeys::new(&self.storage_prefix)
    }
}

/// The keys the engine reads and writes in the shared store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageKeys {
    pub enabled: String,
    pub countdown: String,
    pub last_fetch_at: String,
    /// Context id of the context currently holding the shared timer.
    pub owner: String,
    pub snapshot: String,
}

impl StorageKeys {
    pub fn new(prefix: &str) -> Self {
        Self {
            enabled: format!("{prefix}.scheduler.enabled"),
            countdown: format!("{prefix}.scheduler.countdown"),
            last_fetch_at: format!("{prefix}.scheduler.last_fetch_at"),
            owner: format!("{prefix}.scheduler.owner"),
            snapshot: format!("{prefix}.orders.snapshot"),
        }
    }
}
