//! A [`PersistentKv`] kept in a JSON file, so that agent processes on one machine share a schedule.
//!
//! Each entry records the context that wrote it. A background task re-reads the file every `poll_interval` and turns
//! writes by other contexts into [`KvChange`] events. Writes replace the file atomically while holding an advisory
//! lock on a `.lock` file next to it, so concurrent writers are last-write-wins per key.
use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use fd_lock::RwLock;
use jobsync_engine::{
    traits::{ContextId, KvChange, KvError},
    PersistentKv,
};
use log::*;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::{sync::broadcast, task::JoinHandle};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    value: String,
    writer: ContextId,
}

type Entries = BTreeMap<String, Entry>;

struct Shared {
    path: PathBuf,
    lock_path: PathBuf,
    id: ContextId,
    sender: broadcast::Sender<KvChange>,
    /// The file contents as last seen by this handle. Changes are reported relative to it.
    seen: Mutex<Entries>,
}

pub struct FileKv {
    shared: Arc<Shared>,
    poller: JoinHandle<()>,
}

impl FileKv {
    /// Opens (or prepares to create) the shared file. Must be called from within a tokio runtime.
    pub fn open<P: Into<PathBuf>>(path: P, id: ContextId, poll_interval: Duration) -> Result<Self, KvError> {
        let path = path.into();
        let entries = read_entries(&path)?;
        debug!("🗂️ Context {id} opened {} ({} entries)", path.display(), entries.len());
        let (sender, _) = broadcast::channel(EVENT_BUFFER);
        let lock_path = lock_path_for(&path);
        let shared = Arc::new(Shared { path, lock_path, id, sender, seen: Mutex::new(entries) });
        let poller = tokio::spawn(poll(Arc::clone(&shared), poll_interval));
        Ok(Self { shared, poller })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }
}

impl Drop for FileKv {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

impl PersistentKv for FileKv {
    fn context_id(&self) -> &ContextId {
        &self.shared.id
    }

    fn get(&self, key: &str) -> Option<String> {
        match read_entries(&self.shared.path) {
            Ok(entries) => entries.get(key).map(|e| e.value.clone()),
            Err(e) => {
                warn!("🗂️ Could not read {}. Using the last known value of {key}. {e}", self.shared.path.display());
                self.shared.lock().get(key).map(|e| e.value.clone())
            },
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), KvError> {
        let mut seen = self.shared.lock();
        let mut file_lock = open_lock_file(&self.shared.lock_path)?;
        let _guard = file_lock
            .write()
            .map_err(|e| KvError::Unavailable(format!("Could not lock {}. {e}", self.shared.lock_path.display())))?;
        let mut current = read_entries(&self.shared.path)?;
        // Report what others wrote since the last poll before this write hides it
        self.shared.emit_changes(&seen, &current);
        if current.get(key).map(|e| e.value.as_str()) == Some(value) {
            *seen = current;
            return Ok(());
        }
        current.insert(key.to_string(), Entry { value: value.to_string(), writer: self.shared.id.clone() });
        write_entries(&self.shared.path, &current)?;
        trace!("🗂️ {} wrote {key}", self.shared.id);
        *seen = current;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<KvChange> {
        self.shared.sender.subscribe()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.seen.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn emit_changes(&self, before: &Entries, after: &Entries) {
        for change in diff_entries(before, after).into_iter().filter(|c| c.origin != self.id) {
            if self.sender.send(change).is_err() {
                trace!("🗂️ Nobody is listening for shared state changes in {}", self.id);
            }
        }
    }
}

async fn poll(shared: Arc<Shared>, poll_interval: Duration) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let current = match read_entries(&shared.path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("🗂️ Could not poll {}. {e}", shared.path.display());
                continue;
            },
        };
        let mut seen = shared.lock();
        if *seen != current {
            shared.emit_changes(&seen, &current);
            *seen = current;
        }
    }
}

fn diff_entries(before: &Entries, after: &Entries) -> Vec<KvChange> {
    let mut changes = Vec::new();
    for (key, entry) in after {
        let old_value = before.get(key).map(|e| e.value.clone());
        if old_value.as_deref() != Some(entry.value.as_str()) {
            changes.push(KvChange {
                key: key.clone(),
                old_value,
                new_value: Some(entry.value.clone()),
                origin: entry.writer.clone(),
            });
        }
    }
    for (key, entry) in before.iter().filter(|(k, _)| !after.contains_key(*k)) {
        changes.push(KvChange {
            key: key.clone(),
            old_value: Some(entry.value.clone()),
            new_value: None,
            origin: entry.writer.clone(),
        });
    }
    changes
}

fn read_entries(path: &Path) -> Result<Entries, KvError> {
    match fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(Entries::new()),
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| KvError::Unavailable(format!("{} is not a shared state file. {e}", path.display()))),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(Entries::new()),
        Err(e) => Err(KvError::Unavailable(format!("{}: {e}", path.display()))),
    }
}

fn lock_path_for(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".lock");
    PathBuf::from(name)
}

fn open_lock_file(path: &Path) -> Result<RwLock<File>, KvError> {
    OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map(RwLock::new)
        .map_err(|e| KvError::Unavailable(format!("{}: {e}", path.display())))
}

fn write_entries(path: &Path, entries: &Entries) -> Result<(), KvError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let refused = |e: String| KvError::WriteRefused(format!("{}: {e}", path.display()));
    let mut file = NamedTempFile::new_in(dir).map_err(|e| refused(e.to_string()))?;
    let json = serde_json::to_vec_pretty(entries).map_err(|e| refused(e.to_string()))?;
    file.write_all(&json).map_err(|e| refused(e.to_string()))?;
    file.persist(path).map_err(|e| refused(e.to_string()))?;
    Ok(())
}
