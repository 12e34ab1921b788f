//! Coordination manager — the public facade over sessions, locks, and
//! storage (spec §6.4).

use crate::exchange::NotificationTransport;
use crate::lock_manager::LockManager;
use crate::session::SessionManager;
use ensemble_core::{CancellationToken, Clock, CoordError, Path, Result, Segment, SessionId};
use ensemble_storage::{CasExpect, CasOutcome, Database, StoredEntry, StoredSession};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::instrument;

pub struct CoordinationManager<DE, DS, T>
where
    DE: Database<StoredEntry>,
    DS: Database<StoredSession>,
    T: NotificationTransport,
{
    entries: Arc<DE>,
    sessions: Arc<SessionManager<DS>>,
    locks: Arc<LockManager<DE, DS, T>>,
    clock: Arc<dyn Clock>,
}

impl<DE, DS, T> CoordinationManager<DE, DS, T>
where
    DE: Database<StoredEntry> + 'static,
    DS: Database<StoredSession> + 'static,
    T: NotificationTransport + 'static,
{
    pub fn new(
        entries: Arc<DE>,
        sessions: Arc<SessionManager<DS>>,
        locks: Arc<LockManager<DE, DS, T>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            entries,
            sessions,
            locks,
            clock,
        }
    }

    fn not_found(path: &Path) -> CoordError {
        CoordError::EntryNotFound {
            path: path.escaped_form(),
        }
    }

    /// A direct, non-locking read of the current entry. Callers that need
    /// a consistent view across a following mutation should go through
    /// the lock manager instead.
    #[instrument(skip(self))]
    pub async fn get_entry(&self, path: &Path) -> Result<StoredEntry> {
        self.entries
            .get(path)
            .await?
            .ok_or_else(|| Self::not_found(path))
    }

    pub async fn get_children(&self, path: &Path) -> Result<BTreeSet<Segment>> {
        Ok(self.get_entry(path).await?.children)
    }

    /// Acquires an explicit, caller-held write lock on `path`, independent
    /// of any operation that would otherwise take and release it itself.
    /// Exposed for callers (e.g. the CLI's `lock`/`unlock` commands) that
    /// want to hold a lock across several subsequent operations.
    pub async fn acquire_write_lock(
        &self,
        session: &SessionId,
        path: &Path,
        cancellation: &CancellationToken,
    ) -> Result<StoredEntry> {
        self.locks
            .acquire_write_lock(path, session, cancellation)
            .await?
            .ok_or_else(|| Self::not_found(path))
    }

    /// Releases a write lock previously taken with
    /// [`Self::acquire_write_lock`].
    pub async fn release_write_lock(&self, session: &SessionId, path: &Path) -> Result<()> {
        self.locks.release_write_lock(path, session).await?;
        Ok(())
    }

    /// Acquires an explicit, caller-held read lock on `path`.
    pub async fn acquire_read_lock(
        &self,
        session: &SessionId,
        path: &Path,
        cancellation: &CancellationToken,
    ) -> Result<StoredEntry> {
        self.locks
            .acquire_read_lock(path, session, cancellation)
            .await?
            .ok_or_else(|| Self::not_found(path))
    }

    /// Releases a read lock previously taken with
    /// [`Self::acquire_read_lock`].
    pub async fn release_read_lock(&self, session: &SessionId, path: &Path) -> Result<()> {
        self.locks.release_read_lock(path, session).await?;
        Ok(())
    }

    /// Creates a new entry at `path` under its parent's write lock,
    /// registering `path` in the parent's `children` set and, if
    /// `ephemeral`, in the creating session's `entry_paths`.
    #[instrument(skip(self, value, cancellation))]
    pub async fn create_entry(
        &self,
        session: &SessionId,
        path: &Path,
        value: Vec<u8>,
        ephemeral: bool,
        cancellation: &CancellationToken,
    ) -> Result<StoredEntry> {
        if !self.sessions.is_alive(session).await? {
            return Err(CoordError::SessionTerminated {
                session: session.to_hex(),
            });
        }

        let Some(parent_path) = path.parent() else {
            return Err(CoordError::Invariant {
                message: "cannot create an entry at the root path".into(),
            });
        };
        let segment = path
            .name()
            .cloned()
            .ok_or_else(|| CoordError::Invariant {
                message: "path has no final segment".into(),
            })?;

        let Some(parent) = self.locks.acquire_write_lock(&parent_path, session, cancellation).await? else {
            return Err(Self::not_found(&parent_path));
        };

        let result = self
            .create_entry_locked(session, path, &segment, value, ephemeral, &parent)
            .await;
        self.locks.release_write_lock(&parent_path, session).await?;
        result
    }

    async fn create_entry_locked(
        &self,
        session: &SessionId,
        path: &Path,
        segment: &Segment,
        value: Vec<u8>,
        ephemeral: bool,
        parent: &StoredEntry,
    ) -> Result<StoredEntry> {
        if self.entries.get(path).await?.is_some() {
            return Err(CoordError::DuplicateEntry {
                path: path.escaped_form(),
            });
        }

        let now = self.clock.now();
        let ephemeral_owner = ephemeral.then(|| session.clone());
        let new_entry = StoredEntry::new(path.clone(), value, now, ephemeral_owner);
        match self.entries.cas_update(new_entry.clone(), CasExpect::Absent).await? {
            CasOutcome::Applied(applied) => {
                let mut desired_parent = parent.bump();
                desired_parent.children.insert(segment.clone());
                self.entries
                    .cas_update(desired_parent, CasExpect::Matches(parent.clone()))
                    .await?;

                if ephemeral {
                    self.sessions.add_entry(session, path.clone()).await?;
                }
                Ok(applied)
            }
            CasOutcome::Conflict(_) => Err(CoordError::DuplicateEntry {
                path: path.escaped_form(),
            }),
        }
    }

    /// Replaces `path`'s value under its own write lock.
    #[instrument(skip(self, value, cancellation))]
    pub async fn set_value(
        &self,
        session: &SessionId,
        path: &Path,
        value: Vec<u8>,
        cancellation: &CancellationToken,
    ) -> Result<StoredEntry> {
        let Some(current) = self.locks.acquire_write_lock(path, session, cancellation).await? else {
            return Err(Self::not_found(path));
        };

        let result = async {
            let mut desired = current.bump();
            desired.value = value;
            desired.last_write_time = self.clock.now();
            match self
                .entries
                .cas_update(desired, CasExpect::Matches(current))
                .await?
            {
                CasOutcome::Applied(applied) => Ok(applied),
                CasOutcome::Conflict(_) => Err(CoordError::Invariant {
                    message: "set_value lost a CAS race while holding the write lock".into(),
                }),
            }
        }
        .await;

        self.locks.release_write_lock(path, session).await?;
        result
    }

    /// Deletes `path` under its own write lock. With `recursive = false`,
    /// fails (as an `Invariant` violation surfaced to the caller) if
    /// `path` has children.
    #[instrument(skip(self, cancellation))]
    pub async fn delete_entry(
        &self,
        session: &SessionId,
        path: &Path,
        recursive: bool,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let Some(current) = self.locks.acquire_write_lock(path, session, cancellation).await? else {
            return Ok(()); // already gone
        };

        let result = self
            .delete_subtree_locked(session, path, recursive, &current, cancellation, true)
            .await;
        self.locks.release_write_lock(path, session).await?;
        result
    }

    /// Deletes `path` (already write-locked by the caller) and, if
    /// `recursive`, everything beneath it. `update_parent` is true only for
    /// the outermost call: a recursive child's own parent is `path` itself,
    /// still held by the caller further up this same call stack, so fixing
    /// up its `children` set here would re-acquire a lock this call already
    /// holds. It's unneeded anyway — `path` is about to be deleted too.
    fn delete_subtree_locked<'a>(
        &'a self,
        session: &'a SessionId,
        path: &'a Path,
        recursive: bool,
        current: &'a StoredEntry,
        cancellation: &'a CancellationToken,
        update_parent: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            if !current.children.is_empty() && !recursive {
                return Err(CoordError::Invariant {
                    message: format!("{} has children; delete with recursive=true", path.escaped_form()),
                });
            }

            for child_segment in current.children.clone() {
                let Some(child_path) = path.child(child_segment.as_str()) else {
                    continue;
                };
                self.delete_subtree(session, &child_path, cancellation).await?;
            }

            self.entries.delete(path, current.clone()).await?;

            if let Some(owner) = &current.ephemeral_owner {
                self.sessions.remove_entry(owner, path).await?;
            }

            if update_parent {
                if let Some(parent_path) = path.parent() {
                    if let Some(segment) = path.name() {
                        self.remove_child_from_parent(session, &parent_path, segment, cancellation)
                            .await?;
                    }
                }
            }

            Ok(())
        })
    }

    /// Deletes a descendant reached through recursion: acquires its own
    /// write lock (its parent's lock, still held by an ancestor frame on
    /// this call stack, is never re-entered) and always recurses further
    /// down, never fixing up a parent's `children` set.
    fn delete_subtree<'a>(
        &'a self,
        session: &'a SessionId,
        path: &'a Path,
        cancellation: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let Some(current) = self.locks.acquire_write_lock(path, session, cancellation).await? else {
                return Ok(()); // already gone
            };
            let result = self
                .delete_subtree_locked(session, path, true, &current, cancellation, false)
                .await;
            self.locks.release_write_lock(path, session).await?;
            result
        })
    }

    async fn remove_child_from_parent(
        &self,
        session: &SessionId,
        parent_path: &Path,
        segment: &Segment,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let Some(parent) = self.locks.acquire_write_lock(parent_path, session, cancellation).await? else {
            return Ok(()); // parent already gone too
        };
        let result = async {
            if !parent.children.contains(segment) {
                return Ok(());
            }
            let mut desired = parent.bump();
            desired.children.remove(segment);
            self.entries
                .cas_update(desired, CasExpect::Matches(parent.clone()))
                .await?;
            Ok(())
        }
        .await;
        self.locks.release_write_lock(parent_path, session).await?;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::exchange::{ExchangeManager, LocalTransport};
    use crate::wait_directory::LockWaitDirectory;
    use crate::wait_manager::WaitManager;
    use ensemble_core::{CoordConfig, ManualClock, Timestamp};
    use ensemble_storage::MemoryDatabase;

    type Entries = MemoryDatabase<StoredEntry>;
    type Sessions = MemoryDatabase<StoredSession>;

    fn build() -> (
        CoordinationManager<Entries, Sessions, LocalTransport>,
        Arc<ManualClock>,
        SessionId,
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
        let locks = Arc::new(LockManager::new(
            entries.clone(),
            sessions.clone(),
            cache,
            wait_manager,
            exchange,
        ));

        let manager = CoordinationManager::new(entries, sessions.clone(), locks, clock.clone());
        let session = SessionId::from_bytes(vec![1]);
        (manager, clock, session)
    }

    #[tokio::test]
    async fn root_entry_preexists_for_create_under_it() {
        let (manager, _clock, session) = build();
        manager
            .entries
            .cas_update(
                StoredEntry::new(Path::root(), vec![], Timestamp::ZERO, None),
                CasExpect::Absent,
            )
            .await
            .unwrap();
        manager.sessions.try_begin(session.clone(), Timestamp::from_millis(60_000)).await.unwrap();

        let token = CancellationToken::new();
        let created = manager
            .create_entry(&session, &Path::from_parts(["a"]), b"v1".to_vec(), false, &token)
            .await
            .unwrap();
        assert_eq!(created.value, b"v1");

        let fetched = manager.get_entry(&Path::from_parts(["a"])).await.unwrap();
        assert_eq!(fetched.value, b"v1");

        let root = manager.get_entry(&Path::root()).await.unwrap();
        assert!(root.children.iter().any(|s| s.as_str() == "a"));
    }

    #[tokio::test]
    async fn create_read_delete_round_trip() {
        let (manager, _clock, session) = build();
        manager
            .entries
            .cas_update(
                StoredEntry::new(Path::root(), vec![], Timestamp::ZERO, None),
                CasExpect::Absent,
            )
            .await
            .unwrap();
        manager.sessions.try_begin(session.clone(), Timestamp::from_millis(60_000)).await.unwrap();
        let token = CancellationToken::new();

        let path = Path::from_parts(["a"]);
        manager.create_entry(&session, &path, b"v1".to_vec(), false, &token).await.unwrap();
        let fetched = manager.get_entry(&path).await.unwrap();
        assert_eq!(fetched.value, b"v1");

        manager.delete_entry(&session, &path, false, &token).await.unwrap();
        let err = manager.get_entry(&path).await.unwrap_err();
        assert!(matches!(err, CoordError::EntryNotFound { .. }));
    }

    #[tokio::test]
    async fn ephemeral_entry_registers_with_session() {
        let (manager, _clock, session) = build();
        manager
            .entries
            .cas_update(
                StoredEntry::new(Path::root(), vec![], Timestamp::ZERO, None),
                CasExpect::Absent,
            )
            .await
            .unwrap();
        manager.sessions.try_begin(session.clone(), Timestamp::from_millis(60_000)).await.unwrap();
        let token = CancellationToken::new();

        let path = Path::from_parts(["e"]);
        manager.create_entry(&session, &path, vec![], true, &token).await.unwrap();
        let owned = manager.sessions.get_entries(&session).await.unwrap();
        assert!(owned.contains(&path));
    }

    #[tokio::test]
    async fn recursive_delete_of_a_subtree_does_not_deadlock() {
        let (manager, _clock, session) = build();
        manager
            .entries
            .cas_update(
                StoredEntry::new(Path::root(), vec![], Timestamp::ZERO, None),
                CasExpect::Absent,
            )
            .await
            .unwrap();
        manager.sessions.try_begin(session.clone(), Timestamp::from_millis(60_000)).await.unwrap();
        let token = CancellationToken::new();

        let parent = Path::from_parts(["p"]);
        let child = Path::from_parts(["p", "c"]);
        let grandchild = Path::from_parts(["p", "c", "gc"]);
        manager.create_entry(&session, &parent, vec![], false, &token).await.unwrap();
        manager.create_entry(&session, &child, vec![], false, &token).await.unwrap();
        manager.create_entry(&session, &grandchild, vec![], false, &token).await.unwrap();

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            manager.delete_entry(&session, &parent, true, &token),
        )
        .await
        .expect("recursive delete must not deadlock");
        result.unwrap();

        assert!(matches!(
            manager.get_entry(&parent).await.unwrap_err(),
            CoordError::EntryNotFound { .. }
        ));
        assert!(matches!(
            manager.get_entry(&child).await.unwrap_err(),
            CoordError::EntryNotFound { .. }
        ));
        assert!(matches!(
            manager.get_entry(&grandchild).await.unwrap_err(),
            CoordError::EntryNotFound { .. }
        ));

        let root = manager.get_entry(&Path::root()).await.unwrap();
        assert!(!root.children.iter().any(|s| s.as_str() == "p"));
    }
}
