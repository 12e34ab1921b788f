//! Ephemeral-entry cleanup sweep (spec §4.1 / §8 scenario 5).
//!
//! Per the asynchronous-cleanup decision recorded in DESIGN.md, a session's
//! ephemeral entries are not deleted inline inside `SessionManager::end` —
//! they're drained here, in the background, once the session is observed to
//! have ended. `SessionManager::end`/`remove_entry` already delete the
//! session record itself once its owned-entry set empties out, so this
//! sweeper's only job is to delete the entries and let that bookkeeping run.

use crate::exchange::NotificationTransport;
use crate::manager::CoordinationManager;
use crate::session::SessionManager;
use ensemble_core::{CancellationToken, SessionId};
use ensemble_storage::{Database, StoredEntry, StoredSession};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

/// Background worker that deletes ephemeral entries left behind by ended
/// sessions. Tolerates bounded delay: spec.md §8 requires the cleanup to
/// eventually happen, not synchronously with session end.
pub struct EphemeralSweeper<DE, DS, T>
where
    DE: Database<StoredEntry>,
    DS: Database<StoredSession>,
    T: NotificationTransport,
{
    manager: Arc<CoordinationManager<DE, DS, T>>,
    sessions: Arc<SessionManager<DS>>,
    recovery_interval: Duration,
}

impl<DE, DS, T> EphemeralSweeper<DE, DS, T>
where
    DE: Database<StoredEntry> + 'static,
    DS: Database<StoredSession> + 'static,
    T: NotificationTransport + 'static,
{
    pub fn new(
        manager: Arc<CoordinationManager<DE, DS, T>>,
        sessions: Arc<SessionManager<DS>>,
        recovery_interval: Duration,
    ) -> Self {
        Self {
            manager,
            sessions,
            recovery_interval,
        }
    }

    /// Spawns the sweep loop. Reacts to terminations as they're broadcast,
    /// and independently re-scans for ended-but-not-yet-drained sessions on
    /// `recovery_interval` to recover from a dropped broadcast (a lagged or
    /// closed receiver, or a sweep that started after a termination it
    /// never saw live).
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut terminations = self.sessions.subscribe_terminations();
            let mut recovery = tokio::time::interval(self.recovery_interval);
            loop {
                tokio::select! {
                    signal = terminations.recv() => {
                        match signal {
                            Ok(id) => self.sweep_session(&id).await,
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "ephemeral sweeper lagged behind termination broadcast; falling back to scan");
                                self.sweep_backlog().await;
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                    }
                    _ = recovery.tick() => self.sweep_backlog().await,
                }
            }
        })
    }

    /// `entry_paths` (spec §3.1) covers both ephemeral ownership and bare
    /// lock holding (invariant 6), so not every listed path is this
    /// sweeper's to delete — a path the session only ever locked must keep
    /// existing; only the bookkeeping entry in `entry_paths` is stale and
    /// gets dropped directly. Dead-holder lock cleanup itself is the wait
    /// manager's job, not this sweeper's.
    #[instrument(skip(self))]
    async fn sweep_session(&self, id: &SessionId) {
        let paths = match self.sessions.get_entries(id).await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(session = %id, error = %err, "ephemeral sweep could not list owned entries");
                return;
            }
        };
        for path in paths {
            let owns_ephemeral = match self.manager.get_entry(&path).await {
                Ok(entry) => entry.ephemeral_owner.as_ref() == Some(id),
                Err(_) => false, // already gone; just clear the stale bookkeeping below
            };

            if owns_ephemeral {
                let token = CancellationToken::new();
                if let Err(err) = self.manager.delete_entry(id, &path, false, &token).await {
                    debug!(
                        session = %id,
                        path = %path.escaped_form(),
                        error = %err,
                        "ephemeral sweep deferred deleting entry"
                    );
                }
            } else if let Err(err) = self.sessions.remove_entry(id, &path).await {
                debug!(
                    session = %id,
                    path = %path.escaped_form(),
                    error = %err,
                    "ephemeral sweep could not clear stale lock bookkeeping"
                );
            }
        }
    }

    async fn sweep_backlog(&self) {
        let pending = match self.sessions.list_ended_with_entries().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "ephemeral sweep backlog scan failed");
                return;
            }
        };
        for id in pending {
            self.sweep_session(&id).await;
        }
    }
}
