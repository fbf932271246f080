use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use log::*;
use serde::{Deserialize, Serialize};

use crate::{
    config::StorageKeys,
    sync::SyncError,
    traits::{KvError, PersistentKv},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulerStatus {
    Stopped,
    Running,
    /// Running while the host is hidden. Ticks continue but the countdown is not persisted.
    Paused,
}

impl SchedulerStatus {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

impl Display for SchedulerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "Stopped"),
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Paused"),
        }
    }
}

/// Whether the host is currently shown to the user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    Visible,
    Hidden,
}

/// The persisted part of the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub enabled: bool,
    pub countdown_seconds: u64,
    pub last_fetch_at: Option<DateTime<Utc>>,
}

impl SchedulerState {
    pub fn initial(period_secs: u64) -> Self {
        Self { enabled: false, countdown_seconds: period_secs, last_fetch_at: None }
    }

    /// Reads the state written under `keys`. Absent keys take their initial values; a countdown outside
    /// `1..=period_secs` is clamped into it.
    pub fn load(kv: &dyn PersistentKv, keys: &StorageKeys, period_secs: u64) -> Result<Self, SyncError> {
        let mut state = Self::initial(period_secs);
        if let Some(enabled) = read_parsed::<bool>(kv, &keys.enabled)? {
            state.enabled = enabled;
        }
        if let Some(countdown) = read_parsed::<u64>(kv, &keys.countdown)? {
            state.countdown_seconds = countdown.clamp(1, period_secs.max(1));
        }
        if let Some(at) = kv.get(&keys.last_fetch_at) {
            let at = DateTime::parse_from_rfc3339(&at).map_err(|e| {
                SyncError::LocalStateCorrupt(format!("{}: '{at}' is not a timestamp. {e}", keys.last_fetch_at))
            })?;
            state.last_fetch_at = Some(at.with_timezone(&Utc));
        }
        Ok(state)
    }

    /// Like [`Self::load`], but corrupt state is treated as absent.
    pub fn load_or_default(kv: &dyn PersistentKv, keys: &StorageKeys, period_secs: u64) -> Self {
        Self::load(kv, keys, period_secs).unwrap_or_else(|e| {
            warn!("🕰️ {e} Starting from the default schedule.");
            Self::initial(period_secs)
        })
    }

    pub fn persist(&self, kv: &dyn PersistentKv, keys: &StorageKeys) -> Result<(), KvError> {
        kv.set(&keys.enabled, &self.enabled.to_string())?;
        kv.set(&keys.countdown, &self.countdown_seconds.to_string())?;
        if let Some(at) = self.last_fetch_at {
            kv.set(&keys.last_fetch_at, &at.to_rfc3339())?;
        }
        Ok(())
    }
}

fn read_parsed<T>(kv: &dyn PersistentKv, key: &str) -> Result<Option<T>, SyncError>
where
    T: FromStr,
    T::Err: Display,
{
    kv.get(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|e| SyncError::LocalStateCorrupt(format!("{key}: '{value}'. {e}")))
        })
        .transpose()
}
