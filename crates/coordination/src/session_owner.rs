//! Per-process holder of the current session (spec §4.7), built on the
//! session identifier allocator (spec §4.8).

use crate::session::SessionManager;
use ensemble_core::{Clock, CoordConfig, Result, SessionId, SessionProvider, Timestamp};
use ensemble_storage::{Database, StoredSession};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Lazily creates and owns one session for the lifetime of this value,
/// renewing its lease in the background at half the lease interval, and
/// ending it on [`SessionOwner::close`].
pub struct SessionOwner<D: Database<StoredSession>> {
    sessions: Arc<SessionManager<D>>,
    provider: Arc<SessionProvider>,
    clock: Arc<dyn Clock>,
    config: CoordConfig,
    session: OnceCell<SessionId>,
    renewal: Mutex<Option<JoinHandle<()>>>,
}

impl<D: Database<StoredSession> + 'static> SessionOwner<D> {
    pub fn new(
        sessions: Arc<SessionManager<D>>,
        provider: Arc<SessionProvider>,
        clock: Arc<dyn Clock>,
        config: CoordConfig,
    ) -> Self {
        Self {
            sessions,
            provider,
            clock,
            config,
            session: OnceCell::new(),
            renewal: Mutex::new(None),
        }
    }

    /// Returns this process's session id, creating it (and starting the
    /// renewal task) on first call. Subsequent calls return the same id
    /// until [`Self::close`] runs.
    pub async fn get_session(&self) -> Result<SessionId> {
        let id = self
            .session
            .get_or_try_init(|| async {
                let id = self.provider.create();
                let lease_end = self.clock.now().plus(self.config.default_lease);
                self.sessions.try_begin(id.clone(), lease_end).await?;
                debug!(session = %id, "session owner began new session");
                Ok(id)
            })
            .await?
            .clone();
        let mut renewal = self.renewal.lock().await;
        if renewal.is_none() {
            *renewal = Some(self.spawn_renewal(id.clone()));
        }
        Ok(id)
    }

    fn spawn_renewal(&self, id: SessionId) -> JoinHandle<()> {
        let sessions = self.sessions.clone();
        let clock = self.clock.clone();
        let interval = self.config.renewal_interval();
        let lease = self.config.default_lease;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let lease_end = clock.now().plus(lease);
                if let Err(err) = sessions.update(&id, lease_end).await {
                    warn!(session = %id, error = %err, "session lease renewal failed; stopping renewal loop");
                    return;
                }
            }
        })
    }

    /// Ends the owned session, if one was ever created, and stops the
    /// renewal task.
    pub async fn close(&self) -> Result<()> {
        if let Some(handle) = self.renewal.lock().await.take() {
            handle.abort();
        }
        if let Some(id) = self.session.get() {
            self.sessions.end(id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::ManualClock;
    use ensemble_storage::MemoryDatabase;
    use std::time::Duration;

    fn owner() -> (SessionOwner<MemoryDatabase<StoredSession>>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
        let db = Arc::new(MemoryDatabase::new());
        let sessions = Arc::new(SessionManager::new(db, clock.clone() as Arc<dyn Clock>, CoordConfig::default()));
        let provider = Arc::new(SessionProvider::new(vec![1, 2, 3, 4]));
        let owner = SessionOwner::new(sessions, provider, clock.clone() as Arc<dyn Clock>, CoordConfig::default());
        (owner, clock)
    }

    #[tokio::test]
    async fn get_session_is_stable_across_calls() {
        let (owner, _clock) = owner();
        let first = owner.get_session().await.unwrap();
        let second = owner.get_session().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_keeps_session_alive_past_first_lease() {
        let (owner, clock) = owner();
        let id = owner.get_session().await.unwrap();

        clock.advance(Duration::from_millis(20_000));
        tokio::time::advance(Duration::from_millis(20_000)).await;
        tokio::task::yield_now().await;

        assert!(owner.sessions.is_alive(&id).await.unwrap());
    }

    #[tokio::test]
    async fn close_ends_the_session() {
        let (owner, _clock) = owner();
        let id = owner.get_session().await.unwrap();
        owner.close().await.unwrap();
        assert!(!owner.sessions.is_alive(&id).await.unwrap());
    }
}
