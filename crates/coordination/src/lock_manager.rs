//! Two-level lock manager (spec §4.5) — local per-process mutexes guarding
//! CAS-loop acquisition of global write/read locks recorded in storage.

use crate::cache::Cache;
use crate::exchange::{ExchangeManager, NotificationTransport};
use crate::session::SessionManager;
use crate::wait_manager::WaitManager;
use dashmap::DashMap;
use ensemble_core::{CancellationToken, Path, Result, SessionId};
use ensemble_storage::{CasExpect, CasOutcome, Database, StoredEntry, StoredSession};
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{instrument, warn};

pub struct LockManager<DE, DS, T>
where
    DE: Database<StoredEntry>,
    DS: Database<StoredSession>,
    T: NotificationTransport,
{
    entries: Arc<DE>,
    sessions: Arc<SessionManager<DS>>,
    cache: Arc<Cache>,
    wait_manager: Arc<WaitManager<DE, DS>>,
    exchange: Arc<ExchangeManager<T>>,
    local_write_guards: DashMap<Path, OwnedMutexGuard<()>>,
    local_read_guards: DashMap<Path, OwnedMutexGuard<()>>,
}

impl<DE, DS, T> LockManager<DE, DS, T>
where
    DE: Database<StoredEntry> + 'static,
    DS: Database<StoredSession> + 'static,
    T: NotificationTransport + 'static,
{
    pub fn new(
        entries: Arc<DE>,
        sessions: Arc<SessionManager<DS>>,
        cache: Arc<Cache>,
        wait_manager: Arc<WaitManager<DE, DS>>,
        exchange: Arc<ExchangeManager<T>>,
    ) -> Self {
        Self {
            entries,
            sessions,
            cache,
            wait_manager,
            exchange,
            local_write_guards: DashMap::new(),
            local_read_guards: DashMap::new(),
        }
    }

    /// Binary local write mutex. Returns whether it was acquired without
    /// contention (the caller may then trust its cached entry as a seed).
    pub async fn acquire_local_write_lock(&self, path: &Path) -> bool {
        let cache_entry = self.cache.get_entry(path);
        let (guard, fresh) = cache_entry.acquire_write_mutex().await;
        self.local_write_guards.insert(path.clone(), guard);
        fresh
    }

    pub fn release_local_write_lock(&self, path: &Path) {
        self.local_write_guards.remove(path);
    }

    pub async fn acquire_local_read_lock(&self, path: &Path) {
        let cache_entry = self.cache.get_entry(path);
        let guard = cache_entry.acquire_read_mutex().await;
        self.local_read_guards.insert(path.clone(), guard);
    }

    pub fn release_local_read_lock(&self, path: &Path) {
        self.local_read_guards.remove(path);
    }

    async fn seed_entry(&self, path: &Path, fresh: bool) -> Result<Option<StoredEntry>> {
        if fresh {
            if let Some(cached) = self.cache.cached_value(path) {
                return Ok(Some(cached));
            }
        }
        self.entries.get(path).await
    }

    /// Acquires the global write lock on `path` for `session`. Returns
    /// `None` if the entry was concurrently deleted. Holds the local write
    /// mutex for `path` from entry to the matching `release_write_lock`.
    #[instrument(skip(self, cancellation))]
    pub async fn acquire_write_lock(
        &self,
        path: &Path,
        session: &SessionId,
        cancellation: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        let fresh = self.acquire_local_write_lock(path).await;
        let result = self.acquire_write_lock_locked(path, session, fresh, cancellation).await;

        match &result {
            Ok(Some(_)) => {}
            _ => self.release_local_write_lock(path),
        }
        result
    }

    async fn acquire_write_lock_locked(
        &self,
        path: &Path,
        session: &SessionId,
        fresh: bool,
        cancellation: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        let mut seed = self.seed_entry(path, fresh).await?;
        let held = loop {
            let Some(resolved) = self
                .wait_manager
                .wait_for_write_lock_release(path, session, false, seed.take(), cancellation)
                .await?
            else {
                return Ok(None);
            };
            let mut desired = resolved.bump();
            desired.write_lock = Some(session.clone());
            match self
                .entries
                .cas_update(desired, CasExpect::Matches(resolved))
                .await?
            {
                CasOutcome::Applied(applied) => break applied,
                CasOutcome::Conflict(_) => continue,
            }
        };

        self.sessions.add_entry(session, path.clone()).await?;

        match self
            .wait_manager
            .wait_for_read_locks_release(path, session, Some(held), cancellation)
            .await
        {
            Ok(drained) => Ok(drained),
            Err(err) => {
                warn!(%path, error = %err, "draining readers failed; releasing write lock");
                let _ = self.release_write_lock(path, session).await;
                Err(err)
            }
        }
    }

    /// Releases the global write lock, then the local write mutex. Never
    /// fails on plain user error; propagates backend/session errors.
    #[instrument(skip(self))]
    pub async fn release_write_lock(&self, path: &Path, session: &SessionId) -> Result<Option<StoredEntry>> {
        let result = self.release_write_lock_inner(path, session).await;
        self.release_local_write_lock(path);
        result
    }

    async fn release_write_lock_inner(&self, path: &Path, session: &SessionId) -> Result<Option<StoredEntry>> {
        let mut current = self.entries.get(path).await?;
        loop {
            let Some(start) = current.clone() else {
                self.exchange.notify_write_lock_released(path.clone()).await;
                self.cache.invalidate_path(path);
                self.sessions.remove_entry(session, path).await?;
                return Ok(None);
            };
            if start.write_lock.as_ref() != Some(session) {
                return Ok(Some(start)); // idempotent: already released, e.g. by cleanup
            }

            let cache_snapshot = self.cache.snapshot(path);
            let mut desired = start.bump();
            desired.write_lock = None;
            match self
                .entries
                .cas_update(desired, CasExpect::Matches(start))
                .await?
            {
                CasOutcome::Applied(applied) => {
                    if applied.read_locks.contains(session) {
                        self.cache.update(&cache_snapshot, applied.clone());
                    } else {
                        self.cache.invalidate(&cache_snapshot);
                    }
                    self.exchange.notify_write_lock_released(path.clone()).await;
                    if !applied.references(session) {
                        self.sessions.remove_entry(session, path).await?;
                    }
                    return Ok(Some(applied));
                }
                CasOutcome::Conflict(_) => {
                    current = self.entries.get(path).await?;
                    continue;
                }
            }
        }
    }

    /// Acquires the global read lock on `path` for `session`. Takes the
    /// local write mutex briefly to perform the CAS, then retains the
    /// local read mutex (acquired up front, held until `release_read_lock`)
    /// while releasing the local write mutex.
    #[instrument(skip(self, cancellation))]
    pub async fn acquire_read_lock(
        &self,
        path: &Path,
        session: &SessionId,
        cancellation: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        let cache_entry = self.cache.get_entry(path);
        let read_guard = cache_entry.acquire_read_mutex().await;

        let fresh = self.acquire_local_write_lock(path).await;
        let result = self.acquire_read_lock_locked(path, session, fresh, cancellation).await;
        self.release_local_write_lock(path);

        match result {
            Ok(Some(entry)) => {
                self.local_read_guards.insert(path.clone(), read_guard);
                Ok(Some(entry))
            }
            other => {
                drop(read_guard);
                other
            }
        }
    }

    async fn acquire_read_lock_locked(
        &self,
        path: &Path,
        session: &SessionId,
        fresh: bool,
        cancellation: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        let mut seed = self.seed_entry(path, fresh).await?;
        loop {
            let Some(resolved) = self
                .wait_manager
                .wait_for_write_lock_release(path, session, true, seed.take(), cancellation)
                .await?
            else {
                return Ok(None);
            };

            if resolved.read_locks.contains(session) {
                self.sessions.add_entry(session, path.clone()).await?;
                return Ok(Some(resolved)); // already held, reentrant no-op
            }

            let mut desired = resolved.bump();
            desired.read_locks.insert(session.clone());
            match self
                .entries
                .cas_update(desired, CasExpect::Matches(resolved))
                .await?
            {
                CasOutcome::Applied(applied) => {
                    self.sessions.add_entry(session, path.clone()).await?;
                    return Ok(Some(applied));
                }
                CasOutcome::Conflict(_) => continue,
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn release_read_lock(&self, path: &Path, session: &SessionId) -> Result<Option<StoredEntry>> {
        self.acquire_local_write_lock(path).await;
        let result = self.release_read_lock_inner(path, session).await;
        self.release_local_write_lock(path);
        self.release_local_read_lock(path);
        result
    }

    async fn release_read_lock_inner(&self, path: &Path, session: &SessionId) -> Result<Option<StoredEntry>> {
        let mut current = self.entries.get(path).await?;
        loop {
            let Some(start) = current.clone() else {
                self.exchange.notify_read_lock_released(path.clone()).await;
                self.cache.invalidate_path(path);
                self.sessions.remove_entry(session, path).await?;
                return Ok(None);
            };
            if !start.read_locks.contains(session) {
                return Ok(Some(start)); // idempotent
            }

            let cache_snapshot = self.cache.snapshot(path);
            let mut desired = start.bump();
            desired.read_locks.remove(session);
            match self
                .entries
                .cas_update(desired, CasExpect::Matches(start))
                .await?
            {
                CasOutcome::Applied(applied) => {
                    self.cache.update(&cache_snapshot, applied.clone());
                    self.exchange.notify_read_lock_released(path.clone()).await;
                    if !applied.references(session) {
                        self.sessions.remove_entry(session, path).await?;
                    }
                    return Ok(Some(applied));
                }
                CasOutcome::Conflict(_) => {
                    current = self.entries.get(path).await?;
                    continue;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::LocalTransport;
    use crate::wait_directory::LockWaitDirectory;
    use ensemble_core::{Clock, CoordConfig, ManualClock, Timestamp};
    use ensemble_storage::MemoryDatabase;
    use std::time::Duration;

    type Entries = MemoryDatabase<StoredEntry>;
    type Sessions = MemoryDatabase<StoredSession>;

    fn sid(b: u8) -> SessionId {
        SessionId::from_bytes(vec![b])
    }

    fn build() -> (
        Arc<LockManager<Entries, Sessions, LocalTransport>>,
        Arc<Entries>,
        Arc<ManualClock>,
        Arc<SessionManager<Sessions>>,
    ) {
        let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
        let entries = Arc::new(MemoryDatabase::new());
        let sessions_db = Arc::new(MemoryDatabase::new());
        let sessions = Arc::new(SessionManager::new(
            sessions_db,
            clock.clone() as Arc<dyn Clock>,
            CoordConfig::default(),
        ));
        let cache = Arc::new(Cache::new());
        let wait_directory = Arc::new(LockWaitDirectory::new());
        let wait_manager = Arc::new(WaitManager::new(
            entries.clone(),
            sessions.clone(),
            wait_directory.clone(),
            CoordConfig::default(),
        ));
        let transport = Arc::new(LocalTransport::new());
        let exchange = Arc::new(ExchangeManager::new(transport, cache.clone(), wait_directory));
        let _receiver = exchange.clone().spawn_receiver();
        let lock_manager = Arc::new(LockManager::new(
            entries.clone(),
            sessions.clone(),
            cache,
            wait_manager,
            exchange,
        ));
        (lock_manager, entries, clock, sessions)
    }

    #[tokio::test]
    async fn acquire_on_missing_path_returns_none() {
        let (manager, _entries, _clock, sessions) = build();
        sessions.try_begin(sid(1), Timestamp::from_millis(60_000)).await.unwrap();
        let token = CancellationToken::new();
        let result = manager
            .acquire_write_lock(&Path::from_parts(["a"]), &sid(1), &token)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn acquire_then_release_round_trips() {
        let (manager, entries, _clock, sessions) = build();
        let path = Path::from_parts(["a"]);
        entries
            .cas_update(
                StoredEntry::new(path.clone(), vec![], Timestamp::ZERO, None),
                CasExpect::Absent,
            )
            .await
            .unwrap();

        let session = sid(1);
        sessions.try_begin(session.clone(), Timestamp::from_millis(60_000)).await.unwrap();
        let token = CancellationToken::new();
        let held = manager
            .acquire_write_lock(&path, &session, &token)
            .await
            .unwrap()
            .expect("entry exists");
        assert_eq!(held.write_lock, Some(session.clone()));
        assert!(sessions.get_entries(&session).await.unwrap().contains(&path));

        let released = manager
            .release_write_lock(&path, &session)
            .await
            .unwrap()
            .expect("entry exists");
        assert_eq!(released.write_lock, None);
        assert!(released.read_locks.is_empty());
        assert!(!sessions.get_entries(&session).await.unwrap().contains(&path));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn write_after_write_is_serialised() {
        let (manager, entries, _clock, sessions) = build();
        let path = Path::from_parts(["x"]);
        entries
            .cas_update(
                StoredEntry::new(path.clone(), vec![], Timestamp::ZERO, None),
                CasExpect::Absent,
            )
            .await
            .unwrap();

        let s1 = sid(1);
        let s2 = sid(2);
        sessions.try_begin(s1.clone(), Timestamp::from_millis(60_000)).await.unwrap();
        sessions.try_begin(s2.clone(), Timestamp::from_millis(60_000)).await.unwrap();
        let token = CancellationToken::new();

        let held1 = manager
            .acquire_write_lock(&path, &s1, &token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(held1.storage_version, 2);

        let manager2 = manager.clone();
        let path2 = path.clone();
        let token2 = token.clone();
        let s2c = s2.clone();
        let waiter = tokio::spawn(async move { manager2.acquire_write_lock(&path2, &s2c, &token2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.release_write_lock(&path, &s1).await.unwrap();

        let held2 = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .expect("entry still exists");
        assert_eq!(held2.write_lock, Some(s2));
        assert_eq!(held2.storage_version, 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reader_writer_draining() {
        let (manager, entries, _clock, sessions) = build();
        let path = Path::from_parts(["y"]);
        entries
            .cas_update(
                StoredEntry::new(path.clone(), vec![], Timestamp::ZERO, None),
                CasExpect::Absent,
            )
            .await
            .unwrap();

        let s1 = sid(1);
        let s2 = sid(2);
        let s3 = sid(3);
        sessions.try_begin(s1.clone(), Timestamp::from_millis(60_000)).await.unwrap();
        sessions.try_begin(s2.clone(), Timestamp::from_millis(60_000)).await.unwrap();
        sessions.try_begin(s3.clone(), Timestamp::from_millis(60_000)).await.unwrap();
        let token = CancellationToken::new();

        manager.acquire_read_lock(&path, &s1, &token).await.unwrap().unwrap();

        let manager2 = manager.clone();
        let path2 = path.clone();
        let token2 = token.clone();
        let s2c = s2.clone();
        let writer = tokio::spawn(async move { manager2.acquire_write_lock(&path2, &s2c, &token2).await });

        tokio::time::sleep(Duration::from_millis(20)).await;

        let read_by_s3 = manager.acquire_read_lock(&path, &s3, &token).await.unwrap().unwrap();
        assert!(read_by_s3.write_lock.is_none());

        manager.release_read_lock(&path, &s1).await.unwrap();
        manager.release_read_lock(&path, &s3).await.unwrap();

        let held = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .unwrap()
            .unwrap()
            .unwrap()
            .expect("entry still exists");
        assert_eq!(held.write_lock, Some(s2));
        assert!(held.read_locks.is_empty());
    }
}
