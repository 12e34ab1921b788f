//! Shared harness for the end-to-end scenario tests in
//! `tests/scenarios.rs` (spec.md §8).

use ensemble_core::{Clock, CoordConfig, ManualClock, Path, SessionId, Timestamp};
use ensemble_coordination::{
    Cache, CoordinationManager, EphemeralSweeper, ExchangeManager, LocalTransport, LockManager,
    LockWaitDirectory, SessionManager, WaitManager,
};
use ensemble_storage::{CasExpect, MemoryDatabase, StoredEntry, StoredSession};
use std::sync::Arc;
use std::time::Duration;

pub type Entries = MemoryDatabase<StoredEntry>;
pub type Sessions = MemoryDatabase<StoredSession>;
pub type Manager = CoordinationManager<Entries, Sessions, LocalTransport>;

pub struct Harness {
    pub manager: Arc<Manager>,
    pub sessions: Arc<SessionManager<Sessions>>,
    pub clock: Arc<ManualClock>,
    pub sweeper: Arc<EphemeralSweeper<Entries, Sessions, LocalTransport>>,
    pub cache: Arc<Cache>,
    pub entries: Arc<Entries>,
}

impl Harness {
    pub async fn build() -> Self {
        let clock = Arc::new(ManualClock::new(Timestamp::ZERO));
        let dyn_clock: Arc<dyn Clock> = clock.clone() as Arc<dyn Clock>;
        let config = CoordConfig::default();

        let entries = Arc::new(MemoryDatabase::new());
        let sessions_db = Arc::new(MemoryDatabase::new());
        let sessions = Arc::new(SessionManager::new(sessions_db, dyn_clock.clone(), config.clone()));

        let cache = Arc::new(Cache::new());
        let wait_directory = Arc::new(LockWaitDirectory::new());
        let wait_manager = Arc::new(WaitManager::new(
            entries.clone(),
            sessions.clone(),
            wait_directory.clone(),
            config.clone(),
        ));
        let transport = Arc::new(LocalTransport::new());
        let exchange = Arc::new(ExchangeManager::new(transport, cache.clone(), wait_directory));
        let _receiver = exchange.clone().spawn_receiver();
        let locks = Arc::new(LockManager::new(
            entries.clone(),
            sessions.clone(),
            cache.clone(),
            wait_manager,
            exchange,
        ));

        entries
            .cas_update(
                StoredEntry::new(Path::root(), vec![], Timestamp::ZERO, None),
                CasExpect::Absent,
            )
            .await
            .unwrap();

        let manager = Arc::new(CoordinationManager::new(
            entries.clone(),
            sessions.clone(),
            locks,
            dyn_clock,
        ));

        let sweeper = Arc::new(EphemeralSweeper::new(
            manager.clone(),
            sessions.clone(),
            Duration::from_millis(50),
        ));

        Self {
            manager,
            sessions,
            clock,
            sweeper,
            cache,
            entries,
        }
    }

    pub async fn begin_session(&self, byte: u8) -> SessionId {
        let id = SessionId::from_bytes(vec![byte]);
        self.sessions
            .try_begin(id.clone(), Timestamp::from_millis(60_000))
            .await
            .unwrap();
        id
    }
}
