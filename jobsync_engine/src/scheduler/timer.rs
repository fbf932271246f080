//! The polling countdown.
//!
//! A scheduler ticks once per second while enabled. When the countdown reaches zero it resets to the full period
//! and spawns the sync action as its own task, so a slow or failing fetch never delays the next tick.
//!
//! Several contexts may share one schedule through a [`PersistentKv`]. Only the context holding the
//! [`TimerRole::Owner`] role decrements, persists and fetches; followers display the countdown the owner writes.
//! A context claims ownership by writing its id to `<prefix>.scheduler.owner`. If two contexts both act as owner,
//! the one with the larger context id yields as soon as it sees the other's claim, and a paused owner yields to any
//! claim. A follower that has not seen a countdown write for `owner_stale_after` takes over.
use std::{
    future::Future,
    pin::Pin,
    sync::{Arc, Mutex, MutexGuard, Weak},
    time::Duration,
};

use chrono::{DateTime, Utc};
use log::*;
use tokio::{
    task::JoinHandle,
    time::{self, Instant},
};

use crate::{
    config::{EngineConfig, StorageKeys},
    scheduler::state::{SchedulerState, SchedulerStatus, Visibility},
    sync::SyncError,
    traits::{ContextId, PersistentKv},
};

const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Scheduled,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRole {
    Owner,
    Follower,
}

pub type SyncFuture = Pin<Box<dyn Future<Output = Result<(), SyncError>> + Send>>;

pub type SyncAction = Arc<dyn Fn(SyncReason) -> SyncFuture + Send + Sync>;

/// Wraps an async closure as a [`SyncAction`].
pub fn sync_action<F, Fut>(f: F) -> SyncAction
where
    F: Fn(SyncReason) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), SyncError>> + Send + 'static,
{
    Arc::new(move |reason| -> SyncFuture { Box::pin(f(reason)) })
}

struct TimerInner {
    status: SchedulerStatus,
    role: TimerRole,
    countdown: u64,
    last_fetch_at: Option<DateTime<Utc>>,
    visibility: Visibility,
    last_heartbeat: Instant,
    ticker: Option<JoinHandle<()>>,
}

/// What a tick decided, carried out once the lock is released.
#[derive(Default)]
struct TickEffects {
    persist_countdown: Option<u64>,
    fire: bool,
    claim: bool,
}

pub struct Scheduler {
    inner: Mutex<TimerInner>,
    period: u64,
    skip_when_hidden: bool,
    owner_stale_after: Duration,
    kv: Option<Arc<dyn PersistentKv>>,
    keys: StorageKeys,
    action: SyncAction,
}

impl Scheduler {
    pub fn new(config: &EngineConfig, kv: Option<Arc<dyn PersistentKv>>, action: SyncAction) -> Self {
        let period = config.sync_period_secs.max(1);
        let inner = TimerInner {
            status: SchedulerStatus::Stopped,
            role: TimerRole::Owner,
            countdown: period,
            last_fetch_at: None,
            visibility: Visibility::Visible,
            last_heartbeat: Instant::now(),
            ticker: None,
        };
        Self {
            inner: Mutex::new(inner),
            period,
            skip_when_hidden: config.skip_fetch_when_hidden,
            owner_stale_after: config.owner_stale_after,
            kv,
            keys: config.storage_keys(),
            action,
        }
    }

    pub fn period(&self) -> u64 {
        self.period
    }

    pub fn status(&self) -> SchedulerStatus {
        self.lock().status
    }

    pub fn role(&self) -> TimerRole {
        self.lock().role
    }

    pub fn state(&self) -> SchedulerState {
        let inner = self.lock();
        SchedulerState {
            enabled: inner.status.is_enabled(),
            countdown_seconds: inner.countdown,
            last_fetch_at: inner.last_fetch_at,
        }
    }

    pub fn context_id(&self) -> Option<&ContextId> {
        self.kv.as_ref().map(|kv| kv.context_id())
    }

    /// Starts the schedule with a full countdown and takes the owner role. Does nothing if already running. A paused
    /// schedule restarts its countdown but stays paused until the host is visible again.
    pub fn start(self: &Arc<Self>) {
        let state = {
            let mut inner = self.lock();
            if inner.status == SchedulerStatus::Running {
                trace!("🕰️ Scheduler already {}", inner.status);
                return;
            }
            inner.status = running_status(inner.visibility);
            inner.role = TimerRole::Owner;
            inner.countdown = self.period;
            self.ensure_ticker(&mut inner);
            info!("🕰️ Scheduler started. Next fetch in {}s", inner.countdown);
            snapshot(&inner)
        };
        self.persist(&state);
        self.claim_ownership();
    }

    /// Stops the schedule and records that in the shared store. A fetch already in flight still completes.
    pub fn stop(&self) {
        if self.halt() {
            let state = self.state();
            self.persist(&state);
        }
    }

    /// Stops ticking in this context only. The shared enabled flag is left as it is, so other contexts keep their
    /// schedule.
    pub fn detach(&self) {
        self.halt();
    }

    /// Flips between running and stopped. Returns whether the schedule is now enabled.
    pub fn toggle(self: &Arc<Self>) -> bool {
        if self.status().is_enabled() {
            self.stop();
            false
        } else {
            self.start();
            true
        }
    }

    /// Fetches now and restarts the countdown. The enabled state is unchanged. A follower that is asked to fetch
    /// becomes the owner.
    pub fn trigger_manual_fetch(self: &Arc<Self>) {
        let (persist, claim) = {
            let mut inner = self.lock();
            inner.countdown = self.period;
            let claim = inner.status.is_enabled() && inner.role == TimerRole::Follower;
            if claim {
                info!("🕰️ Manual fetch requested. Taking over the shared timer");
                inner.role = TimerRole::Owner;
            }
            ((inner.status != SchedulerStatus::Paused).then_some(inner.countdown), claim)
        };
        if claim {
            self.claim_ownership();
        }
        if let Some(countdown) = persist {
            self.persist_countdown(countdown);
        }
        info!("🕰️ Manual fetch triggered");
        self.fire(SyncReason::Manual);
    }

    /// Hidden pauses persistence of the countdown; becoming visible resumes it immediately.
    pub fn set_visibility(&self, visibility: Visibility) {
        let persist = {
            let mut inner = self.lock();
            inner.visibility = visibility;
            match (inner.status, visibility) {
                (SchedulerStatus::Running, Visibility::Hidden) => {
                    debug!("🕰️ Host hidden. Pausing countdown persistence");
                    inner.status = SchedulerStatus::Paused;
                    None
                },
                (SchedulerStatus::Paused, Visibility::Visible) => {
                    debug!("🕰️ Host visible again. Resuming");
                    inner.status = SchedulerStatus::Running;
                    (inner.role == TimerRole::Owner).then_some(inner.countdown)
                },
                _ => None,
            }
        };
        if let Some(countdown) = persist {
            self.persist_countdown(countdown);
        }
    }

    /// Resumes from the state persisted in the shared store, as after a reload. The countdown continues from the
    /// persisted value instead of starting over.
    pub fn restore(self: &Arc<Self>) -> SchedulerState {
        let Some(kv) = &self.kv else {
            return self.state();
        };
        let persisted = SchedulerState::load_or_default(kv.as_ref(), &self.keys, self.period);
        let (state, resumed) = {
            let mut inner = self.lock();
            inner.countdown = persisted.countdown_seconds;
            inner.last_fetch_at = persisted.last_fetch_at;
            let resumed = persisted.enabled && !inner.status.is_enabled();
            if resumed {
                inner.status = running_status(inner.visibility);
                inner.role = TimerRole::Owner;
                self.ensure_ticker(&mut inner);
                info!("🕰️ Scheduler restored. Next fetch in {}s", inner.countdown);
            }
            (snapshot(&inner), resumed)
        };
        if resumed {
            self.claim_ownership();
        }
        state
    }

    /// Another context changed the enabled flag.
    pub fn apply_remote_enabled(self: &Arc<Self>, enabled: bool) {
        if !enabled {
            if self.halt() {
                info!("🕰️ Schedule stopped by another context");
            }
            return;
        }
        let mut inner = self.lock();
        if inner.status.is_enabled() {
            return;
        }
        inner.status = running_status(inner.visibility);
        inner.role = TimerRole::Follower;
        inner.last_heartbeat = Instant::now();
        self.ensure_ticker(&mut inner);
        info!("🕰️ Schedule started by another context. Following its countdown");
    }

    /// Another context wrote the countdown. Followers display it and count it as a sign of life from the owner.
    pub fn adopt_remote_countdown(&self, countdown: u64) {
        let countdown = countdown.clamp(1, self.period);
        let mut inner = self.lock();
        if inner.status.is_enabled() && inner.role == TimerRole::Owner {
            trace!("🕰️ Holding the timer. Ignoring a countdown written elsewhere");
            return;
        }
        inner.countdown = countdown;
        inner.last_heartbeat = Instant::now();
    }

    /// Another context claimed the timer. An owner that keeps the role writes its claim again, so that the claimant
    /// sees it and yields.
    pub fn apply_remote_owner(&self, owner: &ContextId) {
        let keeps = {
            let mut inner = self.lock();
            if !inner.status.is_enabled() {
                return;
            }
            inner.last_heartbeat = Instant::now();
            if inner.role == TimerRole::Follower {
                return;
            }
            let yields = inner.status == SchedulerStatus::Paused || self.context_id().is_some_and(|me| me > owner);
            if yields {
                info!("🕰️ Yielding the shared timer to {owner}");
                inner.role = TimerRole::Follower;
            } else {
                debug!("🕰️ Keeping the shared timer. Asking {owner} to yield");
            }
            !yields
        };
        if keeps {
            self.claim_ownership();
        }
    }

    pub fn adopt_remote_last_fetch_at(&self, at: DateTime<Utc>) {
        let mut inner = self.lock();
        if inner.last_fetch_at.map_or(true, |current| current < at) {
            inner.last_fetch_at = Some(at);
        }
    }

    /// Stops the ticker without writing to the shared store. Returns false if already stopped.
    fn halt(&self) -> bool {
        let mut inner = self.lock();
        if !inner.status.is_enabled() {
            return false;
        }
        inner.status = SchedulerStatus::Stopped;
        inner.role = TimerRole::Owner;
        if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
        }
        info!("🕰️ Scheduler stopped");
        true
    }

    fn tick(self: &Arc<Self>) {
        let effects = {
            let mut inner = self.lock();
            self.advance(&mut inner)
        };
        if effects.claim {
            self.claim_ownership();
        }
        if let Some(countdown) = effects.persist_countdown {
            self.persist_countdown(countdown);
        }
        if effects.fire {
            self.fire(SyncReason::Scheduled);
        }
    }

    fn advance(&self, inner: &mut TimerInner) -> TickEffects {
        let mut effects = TickEffects::default();
        if !inner.status.is_enabled() {
            return effects;
        }
        if inner.role == TimerRole::Follower {
            if inner.last_heartbeat.elapsed() < self.owner_stale_after {
                return effects;
            }
            warn!("🕰️ No countdown from the owning context for {:?}. Taking over", self.owner_stale_after);
            inner.role = TimerRole::Owner;
            effects.claim = true;
        }
        inner.countdown = inner.countdown.saturating_sub(1);
        if inner.countdown == 0 {
            inner.countdown = self.period;
            effects.fire = !(self.skip_when_hidden && inner.visibility == Visibility::Hidden);
            if !effects.fire {
                debug!("🕰️ Host hidden. Skipping the scheduled fetch");
            }
        }
        if inner.status == SchedulerStatus::Running {
            effects.persist_countdown = Some(inner.countdown);
        }
        effects
    }

    fn fire(self: &Arc<Self>, reason: SyncReason) {
        let weak = Arc::downgrade(self);
        let sync = (self.action)(reason);
        tokio::spawn(async move {
            let result = sync.await;
            let Some(scheduler) = weak.upgrade() else {
                return;
            };
            match result {
                Ok(()) => scheduler.record_fetch(Utc::now()),
                Err(SyncError::AuthenticationMissing) => debug!("🕰️ No subject signed in. Skipped {reason:?} fetch"),
                Err(e) => debug!("🕰️ {reason:?} fetch failed. Retrying on the next cycle. {e}"),
            }
        });
    }

    fn record_fetch(&self, at: DateTime<Utc>) {
        self.lock().last_fetch_at = Some(at);
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.set(&self.keys.last_fetch_at, &at.to_rfc3339()) {
                warn!("🕰️ Could not persist the last fetch time. {e}");
            }
        }
    }

    fn ensure_ticker(self: &Arc<Self>, inner: &mut TimerInner) {
        if inner.ticker.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        inner.ticker = Some(tokio::spawn(async move {
            let mut interval = time::interval_at(Instant::now() + TICK, TICK);
            loop {
                interval.tick().await;
                let Some(scheduler) = weak.upgrade() else {
                    break;
                };
                scheduler.tick();
            }
        }));
    }

    fn persist(&self, state: &SchedulerState) {
        if let Some(kv) = &self.kv {
            if let Err(e) = state.persist(kv.as_ref(), &self.keys) {
                warn!("🕰️ Could not persist the scheduler state. {e}");
            }
        }
    }

    fn claim_ownership(&self) {
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.set(&self.keys.owner, &kv.context_id().to_string()) {
                warn!("🕰️ Could not claim the shared timer. {e}");
            }
        }
    }

    fn persist_countdown(&self, countdown: u64) {
        if let Some(kv) = &self.kv {
            if let Err(e) = kv.set(&self.keys.countdown, &countdown.to_string()) {
                warn!("🕰️ Could not persist the countdown. {e}");
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, TimerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(ticker) = inner.ticker.take() {
            ticker.abort();
        }
    }
}

fn running_status(visibility: Visibility) -> SchedulerStatus {
    match visibility {
        Visibility::Visible => SchedulerStatus::Running,
        Visibility::Hidden => SchedulerStatus::Paused,
    }
}

fn snapshot(inner: &TimerInner) -> SchedulerState {
    SchedulerState {
        enabled: inner.status.is_enabled(),
        countdown_seconds: inner.countdown,
        last_fetch_at: inner.last_fetch_at,
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::kv::MemoryKvHub;

    fn counting_action(calls: Arc<AtomicUsize>, fail: bool) -> SyncAction {
        sync_action(move |_reason| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if fail {
                    Err(SyncError::RemoteUnavailable("down".into()))
                } else {
                    Ok(())
                }
            }
        })
    }

    fn scheduler(
        period: u64,
        kv: Option<Arc<dyn PersistentKv>>,
        calls: Arc<AtomicUsize>,
        fail: bool,
    ) -> Arc<Scheduler> {
        let config = EngineConfig::default().with_sync_period(period).with_storage_prefix("test");
        Arc::new(Scheduler::new(&config, kv, counting_action(calls, fail)))
    }

    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn countdown_survives_a_reload() {
        let hub = MemoryKvHub::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let first = scheduler(300, Some(Arc::new(hub.open())), calls.clone(), false);
        first.start();
        time::sleep(Duration::from_millis(10_500)).await;
        drop(first);

        let keys = StorageKeys::new("test");
        let persisted = SchedulerState::load(&hub.open(), &keys, 300).unwrap();
        assert!(persisted.enabled);
        assert!((289..=291).contains(&persisted.countdown_seconds), "got {}", persisted.countdown_seconds);

        let reloaded = scheduler(300, Some(Arc::new(hub.open())), calls.clone(), false);
        let state = reloaded.restore();
        assert_eq!(state.countdown_seconds, persisted.countdown_seconds);
        assert_eq!(reloaded.status(), SchedulerStatus::Running);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_do_not_change_the_cadence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(5, None, calls.clone(), true);
        scheduler.start();
        time::sleep(Duration::from_millis(15_500)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.status(), SchedulerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_further_fetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(2, None, calls.clone(), false);
        assert!(scheduler.toggle());
        time::sleep(Duration::from_millis(2_500)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!scheduler.toggle());
        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.status(), SchedulerStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_fetch_resets_the_countdown_without_starting() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(60, None, calls.clone(), false);
        scheduler.trigger_manual_fetch();
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.status(), SchedulerStatus::Stopped);
        assert!(scheduler.state().last_fetch_at.is_some());

        scheduler.start();
        time::sleep(Duration::from_millis(20_500)).await;
        scheduler.trigger_manual_fetch();
        settle().await;
        assert_eq!(scheduler.state().countdown_seconds, 60);
        assert_eq!(scheduler.status(), SchedulerStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_host_keeps_ticking_but_stops_persisting() {
        let hub = MemoryKvHub::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(4, Some(Arc::new(hub.open())), calls.clone(), false);
        scheduler.start();
        time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(hub.peek("test.scheduler.countdown").as_deref(), Some("3"));

        scheduler.set_visibility(Visibility::Hidden);
        assert_eq!(scheduler.status(), SchedulerStatus::Paused);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hub.peek("test.scheduler.countdown").as_deref(), Some("3"));
        assert_eq!(scheduler.state().countdown_seconds, 1);

        time::sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1, "fetches continue while hidden by default");

        scheduler.set_visibility(Visibility::Visible);
        assert_eq!(scheduler.status(), SchedulerStatus::Running);
        assert_eq!(hub.peek("test.scheduler.countdown").as_deref(), Some("4"));
    }

    #[tokio::test(start_paused = true)]
    async fn hidden_host_can_skip_fetches() {
        let calls = Arc::new(AtomicUsize::new(0));
        let config = EngineConfig::default().with_sync_period(2).with_skip_fetch_when_hidden(true);
        let scheduler = Arc::new(Scheduler::new(&config, None, counting_action(calls.clone(), false)));
        scheduler.set_visibility(Visibility::Hidden);
        scheduler.start();
        assert_eq!(scheduler.status(), SchedulerStatus::Paused);
        time::sleep(Duration::from_millis(4_500)).await;
        settle().await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn larger_context_id_yields_the_timer() {
        let hub = MemoryKvHub::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let a = scheduler(30, Some(Arc::new(hub.open_as("ctx-a"))), calls.clone(), false);
        let b = scheduler(30, Some(Arc::new(hub.open_as("ctx-b"))), calls.clone(), false);
        a.start();
        b.start();
        assert_eq!(hub.peek("test.scheduler.owner").as_deref(), Some("ctx-b"));
        a.apply_remote_owner(&ContextId::from("ctx-b"));
        assert_eq!(hub.peek("test.scheduler.owner").as_deref(), Some("ctx-a"), "the keeper claims again");
        b.apply_remote_owner(&ContextId::from("ctx-a"));
        assert_eq!(a.role(), TimerRole::Owner);
        assert_eq!(b.role(), TimerRole::Follower);

        a.adopt_remote_countdown(12);
        b.adopt_remote_countdown(29);
        assert_eq!(a.state().countdown_seconds, 30);
        assert_eq!(b.state().countdown_seconds, 29);
    }

    #[tokio::test(start_paused = true)]
    async fn follower_takes_over_from_a_silent_owner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(30, None, calls.clone(), false);
        scheduler.apply_remote_enabled(true);
        assert_eq!(scheduler.role(), TimerRole::Follower);
        time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(scheduler.role(), TimerRole::Follower);
        assert_eq!(scheduler.state().countdown_seconds, 30);
        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(scheduler.role(), TimerRole::Owner);
        assert!(scheduler.state().countdown_seconds < 30);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_stop_does_not_rewrite_the_flag() {
        let hub = MemoryKvHub::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(30, Some(Arc::new(hub.open())), calls, false);
        scheduler.start();
        let other = hub.open();
        other.set("test.scheduler.enabled", "false").unwrap();
        let mut changes = other.subscribe();
        scheduler.apply_remote_enabled(false);
        scheduler.apply_remote_enabled(false);
        assert_eq!(scheduler.status(), SchedulerStatus::Stopped);
        assert!(changes.try_recv().is_err(), "a remote stop is not echoed back");
    }

    #[tokio::test(start_paused = true)]
    async fn starting_a_paused_schedule_restarts_the_countdown() {
        let hub = MemoryKvHub::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let scheduler = scheduler(60, Some(Arc::new(hub.open_as("ctx-a"))), calls, false);
        scheduler.start();
        time::sleep(Duration::from_millis(20_500)).await;
        scheduler.set_visibility(Visibility::Hidden);
        assert_eq!(scheduler.state().countdown_seconds, 40);

        scheduler.start();
        assert_eq!(scheduler.status(), SchedulerStatus::Paused);
        assert_eq!(scheduler.state().countdown_seconds, 60);
        assert_eq!(hub.peek("test.scheduler.countdown").as_deref(), Some("60"));
        assert_eq!(hub.peek("test.scheduler.owner").as_deref(), Some("ctx-a"));

        scheduler.set_visibility(Visibility::Visible);
        assert_eq!(scheduler.status(), SchedulerStatus::Running);
    }
}
