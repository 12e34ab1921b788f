//! Session manager — the authoritative record of which sessions are
//! alive and which paths they own (spec §4.1).

use ensemble_core::{CancellationToken, Clock, CoordConfig, CoordError, Path, Result, SessionId, Timestamp};
use ensemble_storage::{CasExpect, CasOutcome, Database, StoredSession};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, instrument, warn};

/// Authoritative session liveness and ownership tracking.
///
/// Generic over the backing `Database<StoredSession>` so the same manager
/// works against the in-memory or `sled` backend without duplicated logic.
pub struct SessionManager<D: Database<StoredSession>> {
    db: Arc<D>,
    clock: Arc<dyn Clock>,
    config: CoordConfig,
    /// Fires a session id whenever `end` observes (or causes) that
    /// session to stop being alive, so in-process waiters don't have to
    /// wait out a full poll interval for terminations this process itself
    /// drove.
    termination: broadcast::Sender<SessionId>,
}

impl<D: Database<StoredSession> + 'static> SessionManager<D> {
    pub fn new(db: Arc<D>, clock: Arc<dyn Clock>, config: CoordConfig) -> Self {
        let (termination, _) = broadcast::channel(1024);
        Self {
            db,
            clock,
            config,
            termination,
        }
    }

    /// Succeeds only if no record exists for `id` yet.
    #[instrument(skip(self))]
    pub async fn try_begin(&self, id: SessionId, lease_end: Timestamp) -> Result<bool> {
        let record = StoredSession::new(id, lease_end);
        let outcome = self.db.cas_update(record, CasExpect::Absent).await?;
        Ok(outcome.is_applied())
    }

    /// Renews the lease. `lease_end` must not move backwards. Fails with
    /// `SessionTerminated` if the session is already ended or expired.
    #[instrument(skip(self))]
    pub async fn update(&self, id: &SessionId, lease_end: Timestamp) -> Result<()> {
        loop {
            let Some(current) = self.db.get(id).await? else {
                return Err(session_terminated(id));
            };
            if !current.is_alive(self.clock.now()) {
                return Err(session_terminated(id));
            }
            let mut desired = current.bump();
            desired.lease_end = lease_end.max(current.lease_end);
            match self
                .db
                .cas_update(desired, CasExpect::Matches(current))
                .await?
            {
                CasOutcome::Applied(_) => return Ok(()),
                CasOutcome::Conflict(_) => continue,
            }
        }
    }

    /// Marks the session ended. Deletes the record immediately if it owns
    /// no entries; otherwise leaves a tombstone for the ephemeral-entry
    /// sweep and lock cleanup to drain, per the asynchronous-cleanup
    /// decision in DESIGN.md.
    #[instrument(skip(self))]
    pub async fn end(&self, id: &SessionId) -> Result<()> {
        loop {
            let Some(current) = self.db.get(id).await? else {
                return Ok(()); // idempotent: already gone
            };
            if current.is_ended && current.entry_paths.is_empty() {
                let _ = self.db.delete(id, current).await?;
                let _ = self.termination.send(id.clone());
                return Ok(());
            }

            let mut desired = current.bump();
            desired.is_ended = true;
            match self
                .db
                .cas_update(desired.clone(), CasExpect::Matches(current))
                .await?
            {
                CasOutcome::Applied(applied) => {
                    let _ = self.termination.send(id.clone());
                    if applied.entry_paths.is_empty() {
                        let _ = self.db.delete(id, applied).await?;
                    }
                    return Ok(());
                }
                CasOutcome::Conflict(_) => continue,
            }
        }
    }

    pub async fn is_alive(&self, id: &SessionId) -> Result<bool> {
        Ok(self
            .db
            .get(id)
            .await?
            .map(|s| s.is_alive(self.clock.now()))
            .unwrap_or(false))
    }

    /// Adds `path` to the session's owned-entries set. Fails with
    /// `SessionTerminated` if the session is not alive.
    #[instrument(skip(self))]
    pub async fn add_entry(&self, id: &SessionId, path: Path) -> Result<()> {
        loop {
            let Some(current) = self.db.get(id).await? else {
                return Err(session_terminated(id));
            };
            if !current.is_alive(self.clock.now()) {
                return Err(session_terminated(id));
            }
            if current.entry_paths.contains(&path) {
                return Ok(());
            }
            let mut desired = current.bump();
            desired.entry_paths.insert(path.clone());
            match self
                .db
                .cas_update(desired, CasExpect::Matches(current))
                .await?
            {
                CasOutcome::Applied(_) => return Ok(()),
                CasOutcome::Conflict(_) => continue,
            }
        }
    }

    /// Removes `path` from the session's owned-entries set. If this was
    /// the last owned path of an ended session, deletes the session
    /// record (completing a deferred `end`).
    #[instrument(skip(self))]
    pub async fn remove_entry(&self, id: &SessionId, path: &Path) -> Result<()> {
        loop {
            let Some(current) = self.db.get(id).await? else {
                return Ok(());
            };
            if !current.entry_paths.contains(path) {
                return Ok(());
            }
            let mut desired = current.bump();
            desired.entry_paths.remove(path);
            match self
                .db
                .cas_update(desired.clone(), CasExpect::Matches(current))
                .await?
            {
                CasOutcome::Applied(applied) => {
                    if applied.is_ended && applied.entry_paths.is_empty() {
                        let _ = self.db.delete(id, applied).await?;
                    }
                    return Ok(());
                }
                CasOutcome::Conflict(_) => continue,
            }
        }
    }

    pub async fn get_entries(&self, id: &SessionId) -> Result<BTreeSet<Path>> {
        Ok(self
            .db
            .get(id)
            .await?
            .map(|s| s.entry_paths)
            .unwrap_or_default())
    }

    /// All currently-alive session ids.
    pub async fn list_sessions(&self) -> Result<Vec<SessionId>> {
        let now = self.clock.now();
        let mut stream = self.db.scan(None).await?;
        let mut ids = Vec::new();
        while let Some(session) = stream.next().await {
            if session.is_alive(now) {
                ids.push(session.session_id);
            }
        }
        Ok(ids)
    }

    /// Ids of sessions marked ended but still owning at least one entry —
    /// the backlog an ephemeral-entry sweep needs to drain. Used as the
    /// sweeper's recovery path after a missed or lagged termination
    /// broadcast, since a full scan is the only way to recover state that
    /// was never observed live.
    pub async fn list_ended_with_entries(&self) -> Result<Vec<SessionId>> {
        let mut stream = self.db.scan(None).await?;
        let mut ids = Vec::new();
        while let Some(session) = stream.next().await {
            if session.is_ended && !session.entry_paths.is_empty() {
                ids.push(session.session_id);
            }
        }
        Ok(ids)
    }

    /// Subscribes to this manager's session-termination broadcast, used by
    /// the ephemeral-entry sweeper to react to terminations as they happen
    /// rather than polling.
    pub fn subscribe_terminations(&self) -> broadcast::Receiver<SessionId> {
        self.termination.subscribe()
    }

    /// Completes when `id` becomes not-alive (ended or lease-expired).
    /// Completes immediately if `id` is already not-alive or doesn't
    /// exist.
    #[instrument(skip(self, cancellation))]
    pub async fn wait_for_termination(
        &self,
        id: &SessionId,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let mut terminations = self.termination.subscribe();
        loop {
            let Some(session) = self.db.get(id).await? else {
                return Ok(());
            };
            let now = self.clock.now();
            if !session.is_alive(now) {
                return Ok(());
            }

            let remaining = Duration::from_millis(
                session
                    .lease_end
                    .as_millis()
                    .saturating_sub(now.as_millis())
                    .max(1),
            );
            let wait = remaining.min(self.config.lease_poll_interval);

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(CoordError::Cancelled),
                signal = terminations.recv() => {
                    match signal {
                        Ok(terminated) if &terminated == id => return Ok(()),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {}
                    }
                }
                _ = tokio::time::sleep(wait) => continue,
            }
        }
    }

    /// Completes when any currently-known session becomes not-alive,
    /// yielding that session's id.
    #[instrument(skip(self, cancellation))]
    pub async fn wait_for_any_termination(
        &self,
        cancellation: &CancellationToken,
    ) -> Result<SessionId> {
        let sampled: BTreeSet<SessionId> = self.list_sessions().await?.into_iter().collect();
        if sampled.is_empty() {
            // Nothing known yet; wait for any future termination signal
            // or a sampled session to appear and then die.
        }

        let mut terminations = self.termination.subscribe();
        loop {
            for id in &sampled {
                if !self.is_alive(id).await? {
                    return Ok(id.clone());
                }
            }

            tokio::select! {
                biased;
                _ = cancellation.cancelled() => return Err(CoordError::Cancelled),
                signal = terminations.recv() => {
                    match signal {
                        Ok(terminated) if sampled.contains(&terminated) => return Ok(terminated),
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("termination channel closed while waiting");
                        }
                    }
                }
                _ = tokio::time::sleep(self.config.lease_poll_interval) => continue,
            }
        }
    }
}

fn session_terminated(id: &SessionId) -> CoordError {
    warn!(session = %id, "operation rejected: session not alive");
    CoordError::SessionTerminated {
        session: id.to_hex(),
    }
}
