//! Per-path process-local cache (spec §4.6).
//!
//! Each path gets one [`CacheEntry`]: a cached snapshot (or "absent"), a
//! version counter used to detect invalidations racing a pending update,
//! and the two local mutexes the lock manager serialises on — a binary
//! write mutex, and a binary "read lock" that is held by the local holder
//! of a global read lock until that global lock is released (not just for
//! the duration of one call), hence `Arc<tokio::sync::Mutex<()>>` so an
//! owned guard can be handed back to the caller and dropped later.

use ensemble_core::Path;
use ensemble_storage::StoredEntry;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One path's local cache state.
pub struct CacheEntry {
    snapshot: RwLock<Option<StoredEntry>>,
    version: AtomicU64,
    write_mutex: Arc<Mutex<()>>,
    read_mutex: Arc<Mutex<()>>,
}

impl Default for CacheEntry {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(None),
            version: AtomicU64::new(0),
            write_mutex: Arc::new(Mutex::new(())),
            read_mutex: Arc::new(Mutex::new(())),
        }
    }
}

impl CacheEntry {
    pub fn cached(&self) -> Option<StoredEntry> {
        self.snapshot.read().clone()
    }

    fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Acquires the local write mutex. Returns the guard plus whether it
    /// was acquired without contention — the lock manager re-reads from
    /// storage instead of trusting the cache when acquisition contended,
    /// since the cache may be stale relative to whoever held the mutex.
    pub async fn acquire_write_mutex(&self) -> (OwnedMutexGuard<()>, bool) {
        match Arc::clone(&self.write_mutex).try_lock_owned() {
            Ok(guard) => (guard, true),
            Err(_) => (Arc::clone(&self.write_mutex).lock_owned().await, false),
        }
    }

    pub async fn acquire_read_mutex(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.read_mutex).lock_owned().await
    }
}

/// A version marker captured before a mutating operation, so a later
/// `update`/`invalidate` can detect whether a newer invalidation raced
/// ahead of it and, if so, refuse to stomp on it.
#[derive(Debug, Clone)]
pub struct CacheSnapshot {
    path: Path,
    version: u64,
}

/// Process-local cache of [`StoredEntry`] snapshots, one [`CacheEntry`]
/// per path, lazily created on first access.
#[derive(Default)]
pub struct Cache {
    entries: dashmap::DashMap<Path, Arc<CacheEntry>>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns (creating if absent) the per-path cache entry.
    pub fn get_entry(&self, path: &Path) -> Arc<CacheEntry> {
        self.entries
            .entry(path.clone())
            .or_insert_with(|| Arc::new(CacheEntry::default()))
            .clone()
    }

    /// Captures the current version for `path`, for a later gated
    /// `update`/`invalidate`.
    pub fn snapshot(&self, path: &Path) -> CacheSnapshot {
        CacheSnapshot {
            path: path.clone(),
            version: self.get_entry(path).version(),
        }
    }

    pub fn cached_value(&self, path: &Path) -> Option<StoredEntry> {
        self.get_entry(path).cached()
    }

    /// Updates the cached snapshot only if the cache version hasn't
    /// advanced past `snapshot`'s — i.e. nothing invalidated or updated
    /// this entry since `snapshot` was captured.
    pub fn update(&self, snapshot: &CacheSnapshot, new_entry: StoredEntry) {
        let entry = self.get_entry(&snapshot.path);
        if entry.version() != snapshot.version {
            return;
        }
        *entry.snapshot.write() = Some(new_entry);
        entry.version.fetch_add(1, Ordering::SeqCst);
    }

    /// Drops the cached snapshot for `path` unconditionally. The local
    /// mutexes on the `CacheEntry` persist.
    pub fn invalidate_path(&self, path: &Path) {
        if let Some(entry) = self.entries.get(path) {
            *entry.snapshot.write() = None;
            entry.version.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Drops the cached snapshot named by a previously-captured
    /// [`CacheSnapshot`].
    pub fn invalidate(&self, snapshot: &CacheSnapshot) {
        self.invalidate_path(&snapshot.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::Timestamp;

    fn entry(path: &Path) -> StoredEntry {
        StoredEntry::new(path.clone(), vec![], Timestamp::ZERO, None)
    }

    #[test]
    fn update_is_noop_after_concurrent_invalidation() {
        let cache = Cache::new();
        let path = Path::from_parts(["a"]);
        let snapshot = cache.snapshot(&path);

        // Someone else invalidates concurrently, advancing the version.
        cache.invalidate_path(&path);

        // Our update was captured against the old version; it must not
        // resurrect a value over the newer invalidation.
        cache.update(&snapshot, entry(&path));
        assert_eq!(cache.cached_value(&path), None);
    }

    #[test]
    fn update_applies_when_version_unchanged() {
        let cache = Cache::new();
        let path = Path::from_parts(["a"]);
        let snapshot = cache.snapshot(&path);
        cache.update(&snapshot, entry(&path));
        assert_eq!(cache.cached_value(&path), Some(entry(&path)));
    }

    #[tokio::test]
    async fn write_mutex_reports_contention() {
        let cache = Cache::new();
        let path = Path::from_parts(["a"]);
        let cache_entry = cache.get_entry(&path);

        let (guard, fresh) = cache_entry.acquire_write_mutex().await;
        assert!(fresh);

        let cache_entry2 = cache.get_entry(&path);
        let contended = tokio::spawn(async move { cache_entry2.acquire_write_mutex().await.1 });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        drop(guard);
        assert!(!contended.await.unwrap());
    }
}
