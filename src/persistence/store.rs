//! Locked read-modify-write access to the scheduler document.
//!
//! Every mutation goes through [`StateStore::update`], which re-reads the
//! latest document while holding an exclusive lock, applies the transform and
//! writes the result atomically if it changed anything. Callers must never modify a copy obtained
//! from an earlier `read()` and write it back; that copy may be stale by the
//! time the lock is taken.
//!
//! # File Layout
//!
//! ```text
//! <state_dir>/
//!   state.json        # the document
//!   state.json.tmp    # in-flight write (renamed over state.json)
//!   state.lock        # advisory flock, held for the duration of an update
//! ```

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use fs2::FileExt;
use thiserror::Error;

use super::document::SchedulerState;
use super::fsync::write_atomic;
use crate::types::IssueNumber;

/// Errors that can occur reading or writing the document.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("state document is not a JSON object")]
    NotAnObject,

    #[error("state document version {found} is newer than supported version {supported}")]
    UnsupportedVersion { supported: u32, found: u64 },

    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Access to the shared scheduler document.
pub trait StateStore {
    /// Returns the current document. A store with no document yet reads as
    /// the default empty document.
    fn read(&self) -> StoreResult<SchedulerState>;

    /// Applies `transform` to the latest document under an exclusive lock and
    /// persists the result. Nothing is written if reading fails.
    fn update<T, F>(&self, transform: F) -> StoreResult<T>
    where
        F: FnOnce(&mut SchedulerState) -> T;

    /// Creates the default document if none exists. Returns whether it did.
    fn initialize(&self) -> StoreResult<bool>;

    fn active_count(&self) -> StoreResult<usize> {
        Ok(self.read()?.active_count())
    }

    /// True iff the issue is active or queued, judged from one snapshot.
    fn is_inflight(&self, issue: IssueNumber) -> StoreResult<bool> {
        Ok(self.read()?.is_inflight(issue))
    }
}

/// The document on disk, shared between daemon invocations via `flock`.
#[derive(Debug, Clone)]
pub struct FileStateStore {
    path: PathBuf,
    lock_path: PathBuf,
}

impl FileStateStore {
    pub fn new(state_dir: impl AsRef<Path>) -> Self {
        let dir = state_dir.as_ref();
        FileStateStore {
            path: dir.join("state.json"),
            lock_path: dir.join("state.lock"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> StoreResult<File> {
        if let Some(parent) = self.lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)?;
        file.lock_exclusive().map_err(|source| StoreError::Lock {
            path: self.lock_path.clone(),
            source,
        })?;
        Ok(file)
    }

    fn load(&self) -> StoreResult<Option<SchedulerState>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => SchedulerState::from_json(&bytes).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save_atomic(&self, state: &SchedulerState) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &bytes)?;
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn read(&self) -> StoreResult<SchedulerState> {
        // Renames are atomic, so an unlocked read sees a whole document.
        Ok(self.load()?.unwrap_or_default())
    }

    fn update<T, F>(&self, transform: F) -> StoreResult<T>
    where
        F: FnOnce(&mut SchedulerState) -> T,
    {
        let lock = self.lock()?;
        let loaded = self.load()?;
        let existed = loaded.is_some();
        let mut state = loaded.unwrap_or_default();
        let before = state.clone();
        let out = transform(&mut state);
        if !existed || state != before {
            self.save_atomic(&state)?;
        }
        let _ = FileExt::unlock(&lock);
        Ok(out)
    }

    fn initialize(&self) -> StoreResult<bool> {
        let lock = self.lock()?;
        let created = if self.path.exists() {
            false
        } else {
            self.save_atomic(&SchedulerState::default())?;
            true
        };
        let _ = FileExt::unlock(&lock);
        Ok(created)
    }
}

/// In-process store for tests and embedding. Cloning shares the document.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    state: Arc<Mutex<Option<SchedulerState>>>,
    writes: Arc<AtomicUsize>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SchedulerState) -> Self {
        MemoryStateStore {
            state: Arc::new(Mutex::new(Some(state))),
            writes: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Number of `update`/`initialize` calls that created or changed the
    /// document.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl StateStore for MemoryStateStore {
    fn read(&self) -> StoreResult<SchedulerState> {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(guard.clone().unwrap_or_default())
    }

    fn update<T, F>(&self, transform: F) -> StoreResult<T>
    where
        F: FnOnce(&mut SchedulerState) -> T,
    {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let before = guard.clone();
        let state = guard.get_or_insert_with(SchedulerState::default);
        let out = transform(state);
        if before.as_ref() != Some(&*state) {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(out)
    }

    fn initialize(&self) -> StoreResult<bool> {
        let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Ok(false);
        }
        *guard = Some(SchedulerState::default());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Job, QueueEntry};
    use chrono::Utc;
    use tempfile::tempdir;

    fn job(issue: u64) -> Job {
        Job::new(IssueNumber(issue), 1000 + issue as u32, "/w", "", None, Utc::now())
    }

    #[test]
    fn read_before_initialize_is_default() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert_eq!(store.read().unwrap(), SchedulerState::default());
        assert!(!store.path().exists(), "read must not create the document");
    }

    #[test]
    fn initialize_is_idempotent_and_never_clobbers() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        assert!(store.initialize().unwrap());
        store
            .update(|s| s.queued.push(QueueEntry::new(IssueNumber(7))))
            .unwrap();

        assert!(!store.initialize().unwrap());
        assert_eq!(store.read().unwrap().queued.len(), 1);
    }

    #[test]
    fn update_persists_and_returns_transform_output() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        let count = store
            .update(|s| {
                s.active_jobs.push(job(1).into());
                s.active_jobs.push(job(2).into());
                s.active_jobs.len()
            })
            .unwrap();
        assert_eq!(count, 2);

        let reopened = FileStateStore::new(dir.path());
        assert_eq!(reopened.active_count().unwrap(), 2);
    }

    #[test]
    fn active_count_tracks_latest_update() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.update(|s| s.active_jobs.push(job(1).into())).unwrap();
        assert_eq!(store.active_count().unwrap(), 1);
        store.update(|s| s.active_jobs.clear()).unwrap();
        assert_eq!(store.active_count().unwrap(), 0);
    }

    #[test]
    fn temp_file_is_cleaned_up() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.update(|_| ()).unwrap();
        assert!(store.path().exists());
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn corrupt_document_is_an_error_and_not_overwritten() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        std::fs::write(store.path(), "{ not json").unwrap();

        assert!(matches!(store.read(), Err(StoreError::Json(_))));
        assert!(store.update(|s| s.paused = true).is_err());
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), "{ not json");
    }

    #[test]
    fn concurrent_updates_are_serialized() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.initialize().unwrap();

        let handles: Vec<_> = (0..8u64)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..10u64 {
                        store
                            .update(|s| s.queued.push(QueueEntry::new(IssueNumber(t * 100 + i))))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.read().unwrap().queued.len(), 80);
    }

    #[test]
    fn is_inflight_reflects_document() {
        let store = MemoryStateStore::new();
        store
            .update(|s| {
                s.active_jobs.push(job(1).into());
                s.queued.push(QueueEntry::new(IssueNumber(2)));
            })
            .unwrap();
        assert!(store.is_inflight(IssueNumber(1)).unwrap());
        assert!(store.is_inflight(IssueNumber(2)).unwrap());
        assert!(!store.is_inflight(IssueNumber(3)).unwrap());
    }

    #[test]
    fn memory_store_counts_writes() {
        let store = MemoryStateStore::new();
        assert_eq!(store.write_count(), 0);
        store.read().unwrap();
        assert_eq!(store.write_count(), 0);
        assert!(store.initialize().unwrap());
        assert!(!store.initialize().unwrap());
        store.update(|s| s.paused = true).unwrap();
        assert_eq!(store.write_count(), 2);
        store.update(|s| s.paused = true).unwrap();
        store.update(|s| s.queued.len()).unwrap();
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn unchanged_document_is_not_rewritten() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        let compact = serde_json::to_string(&SchedulerState::default()).unwrap();
        std::fs::write(store.path(), &compact).unwrap();

        let queued = store.update(|s| s.queued.len()).unwrap();
        assert_eq!(queued, 0);
        store.update(|s| s.paused = false).unwrap();
        assert_eq!(std::fs::read_to_string(store.path()).unwrap(), compact);

        store.update(|s| s.paused = true).unwrap();
        assert_ne!(std::fs::read_to_string(store.path()).unwrap(), compact);
        assert!(store.read().unwrap().paused);
    }
}
