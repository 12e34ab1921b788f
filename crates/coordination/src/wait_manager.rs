//! "Wait until lock free" primitives used by lock acquisition (spec §4.4).

use crate::session::SessionManager;
use crate::wait_directory::{LockKind, LockWaitDirectory};
use ensemble_core::{CancellationToken, CoordConfig, Path, Result, SessionId};
use ensemble_storage::{CasExpect, Database, StoredEntry, StoredSession};
use futures::future::select_all;
use std::collections::BTreeSet;
use std::pin::Pin;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub struct WaitManager<DE: Database<StoredEntry>, DS: Database<StoredSession>> {
    entries: Arc<DE>,
    sessions: Arc<SessionManager<DS>>,
    wait_directory: Arc<LockWaitDirectory>,
    config: CoordConfig,
}

impl<DE, DS> WaitManager<DE, DS>
where
    DE: Database<StoredEntry> + 'static,
    DS: Database<StoredSession> + 'static,
{
    pub fn new(
        entries: Arc<DE>,
        sessions: Arc<SessionManager<DS>>,
        wait_directory: Arc<LockWaitDirectory>,
        config: CoordConfig,
    ) -> Self {
        Self {
            entries,
            sessions,
            wait_directory,
            config,
        }
    }

    /// Loops until `path`'s write lock is free (or held by `session` itself
    /// when `allow_write_lock` is true), or the entry no longer exists.
    /// `seed`, if given, is used as the first iteration's entry instead of
    /// a storage read — the caller passes its cached snapshot when the
    /// local write mutex was acquired without contention.
    pub async fn wait_for_write_lock_release(
        &self,
        path: &Path,
        session: &SessionId,
        allow_write_lock: bool,
        seed: Option<StoredEntry>,
        cancellation: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        let mut next = seed;
        loop {
            let current = match next.take() {
                Some(entry) => Some(entry),
                None => self.entries.get(path).await?,
            };
            let Some(current) = current else {
                return Ok(None);
            };

            if current.write_lock_free_for(session, allow_write_lock) {
                return Ok(Some(current));
            }

            let holder = current.write_lock.clone().expect("write_lock_free_for is false");
            if !self.sessions.is_alive(&holder).await? {
                self.clean_write_lock(path, &current, &holder).await?;
                continue;
            }

            self.wait_for_holder(LockKind::Write, path, &holder, cancellation).await?;
        }
    }

    /// Loops until `read_locks \ {session}` is empty for `path`.
    pub async fn wait_for_read_locks_release(
        &self,
        path: &Path,
        session: &SessionId,
        seed: Option<StoredEntry>,
        cancellation: &CancellationToken,
    ) -> Result<Option<StoredEntry>> {
        let mut next = seed;
        loop {
            let current = match next.take() {
                Some(entry) => Some(entry),
                None => self.entries.get(path).await?,
            };
            let Some(current) = current else {
                return Ok(None);
            };

            let blocking = current.blocking_readers(session);
            if blocking.is_empty() {
                return Ok(Some(current));
            }

            let mut live_blockers = BTreeSet::new();
            for holder in &blocking {
                if !self.sessions.is_alive(holder).await? {
                    self.clean_read_lock(path, &current, holder).await?;
                } else {
                    live_blockers.insert(holder.clone());
                }
            }
            if live_blockers.is_empty() {
                continue;
            }

            self.wait_for_any_holder(LockKind::Read, path, &live_blockers, cancellation)
                .await?;
        }
    }

    async fn wait_for_holder(
        &self,
        kind: LockKind,
        path: &Path,
        holder: &SessionId,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ensemble_core::CoordError::Cancelled),
            res = self.wait_directory.wait(kind, path, holder, cancellation) => res,
            res = self.sessions.wait_for_termination(holder, cancellation) => res,
            _ = tokio::time::sleep(self.config.lock_wait_poll) => Ok(()),
        }
    }

    async fn wait_for_any_holder(
        &self,
        kind: LockKind,
        path: &Path,
        holders: &BTreeSet<SessionId>,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let mut futs: Vec<Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>> = Vec::new();
        for holder in holders {
            let path = path.clone();
            let holder = holder.clone();
            futs.push(Box::pin(async move {
                tokio::select! {
                    res = self.wait_directory.wait(kind, &path, &holder, cancellation) => res,
                    res = self.sessions.wait_for_termination(&holder, cancellation) => res,
                }
            }));
        }

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(ensemble_core::CoordError::Cancelled),
            (res, _, _) = select_all(futs) => res,
            _ = tokio::time::sleep(self.config.lock_wait_poll) => Ok(()),
        }
    }

    /// Idempotent: removes `holder` from `write_lock` if it still names it.
    /// Lost CAS races mean another observer already did the cleanup.
    async fn clean_write_lock(&self, path: &Path, current: &StoredEntry, holder: &SessionId) -> Result<()> {
        if current.write_lock.as_ref() != Some(holder) {
            return Ok(());
        }
        let mut desired = current.bump();
        desired.write_lock = None;
        debug!(%path, holder = %holder, "cleaning stale write lock");
        let _ = self
            .entries
            .cas_update(desired, CasExpect::Matches(current.clone()))
            .await?;
        Ok(())
    }

    async fn clean_read_lock(&self, path: &Path, current: &StoredEntry, holder: &SessionId) -> Result<()> {
        if !current.read_locks.contains(holder) {
            return Ok(());
        }
        let mut desired = current.bump();
        desired.read_locks.remove(holder);
        debug!(%path, holder = %holder, "cleaning stale read lock");
        let _ = self
            .entries
            .cas_update(desired, CasExpect::Matches(current.clone()))
            .await?;
        Ok(())
    }
}
