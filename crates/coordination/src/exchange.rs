//! Exchange manager — propagates lock-release notifications across
//! process boundaries and folds them back into the local cache and wait
//! directory (spec §4.3, §6.3).
//!
//! The transport is abstracted behind [`NotificationTransport`] so a
//! single-process deployment can use [`LocalTransport`] (an in-memory
//! broadcast channel) while a multi-process deployment would implement
//! the trait over a message bus. This mirrors the teacher's `akka`
//! event-stream abstraction, generalised from a single process to a
//! pluggable transport boundary.

use crate::cache::Cache;
use crate::wait_directory::{LockKind, LockWaitDirectory};
use async_trait::async_trait;
use ensemble_core::Path;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseKind {
    Write,
    Read,
}

impl From<ReleaseKind> for LockKind {
    fn from(kind: ReleaseKind) -> Self {
        match kind {
            ReleaseKind::Write => LockKind::Write,
            ReleaseKind::Read => LockKind::Read,
        }
    }
}

/// A transport capable of fanning a lock-release event out to every
/// process sharing the underlying storage.
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    async fn send_release(&self, kind: ReleaseKind, path: Path);
    fn subscribe(&self) -> broadcast::Receiver<(ReleaseKind, Path)>;
}

/// A transport scoped to one process — every subscriber sees every
/// publish, with no cross-process fan-out. Adequate for a single-node
/// deployment or for tests; a networked deployment supplies its own
/// `NotificationTransport`.
pub struct LocalTransport {
    sender: broadcast::Sender<(ReleaseKind, Path)>,
}

impl LocalTransport {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(4096);
        Self { sender }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationTransport for LocalTransport {
    async fn send_release(&self, kind: ReleaseKind, path: Path) {
        let _ = self.sender.send((kind, path));
    }

    fn subscribe(&self) -> broadcast::Receiver<(ReleaseKind, Path)> {
        self.sender.subscribe()
    }
}

/// Bridges the transport to the process-local cache and wait directory:
/// publishes releases this process causes, and on receipt of any release
/// (its own or another process's) invalidates the path's cache entry and
/// wakes every local waiter on that path.
pub struct ExchangeManager<T: NotificationTransport> {
    transport: Arc<T>,
    cache: Arc<Cache>,
    wait_directory: Arc<LockWaitDirectory>,
}

impl<T: NotificationTransport + 'static> ExchangeManager<T> {
    pub fn new(transport: Arc<T>, cache: Arc<Cache>, wait_directory: Arc<LockWaitDirectory>) -> Self {
        Self {
            transport,
            cache,
            wait_directory,
        }
    }

    pub async fn notify_write_lock_released(&self, path: Path) {
        debug!(%path, "publishing write lock release");
        self.transport.send_release(ReleaseKind::Write, path).await;
    }

    pub async fn notify_read_lock_released(&self, path: Path) {
        debug!(%path, "publishing read lock release");
        self.transport.send_release(ReleaseKind::Read, path).await;
    }

    /// Spawns the background task that folds every published release
    /// (including this process's own) back into the cache and wait
    /// directory. The returned handle's task runs until the transport's
    /// channel closes.
    pub fn spawn_receiver(self: Arc<Self>) -> JoinHandle<()> {
        let mut receiver = self.transport.subscribe();
        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok((kind, path)) => {
                        self.cache.invalidate_path(&path);
                        self.wait_directory.notify_path(kind.into(), &path);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "exchange receiver lagged; cache entries may be stale until next access");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn release_invalidates_cache_and_wakes_waiters() {
        let transport = Arc::new(LocalTransport::new());
        let cache = Arc::new(Cache::new());
        let wait_directory = Arc::new(LockWaitDirectory::new());
        let manager = Arc::new(ExchangeManager::new(
            transport,
            cache.clone(),
            wait_directory.clone(),
        ));
        let _receiver = manager.clone().spawn_receiver();

        let path = Path::from_parts(["a"]);
        let session = ensemble_core::SessionId::from_bytes(vec![1]);
        let token = ensemble_core::CancellationToken::new();

        let snapshot = cache.snapshot(&path);
        cache.update(
            &snapshot,
            ensemble_storage::StoredEntry::new(path.clone(), vec![], ensemble_core::Timestamp::ZERO, None),
        );
        assert!(cache.cached_value(&path).is_some());

        let waiter_directory = wait_directory.clone();
        let waiter_path = path.clone();
        let waiter_session = session.clone();
        let waiter_token = token.clone();
        let waiter = tokio::spawn(async move {
            waiter_directory
                .wait(LockKind::Write, &waiter_path, &waiter_session, &waiter_token)
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.notify_write_lock_released(path.clone()).await;

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(cache.cached_value(&path).is_none());
    }
}
