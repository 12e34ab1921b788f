//! In-process wait/notify registries for lock release (spec §4.2).
//!
//! Grounded on the teacher's Akka-inspired event stream (`crates/akka`'s
//! `event_stream.rs`, since deleted in the final trimming pass): a registry
//! keyed by subscription key holding a list of one-shot subscribers,
//! drained and discarded on publish. Here the key is `(path, session)` —
//! "waiting on this particular holder to let go of this particular path"
//! — plus a path-wide variant for notifications that arrive without a
//! specific session attached (e.g. a cross-process release broadcast).

use dashmap::DashMap;
use ensemble_core::{CancellationToken, CoordError, Path, Result, SessionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

type WaiterKey = (Path, SessionId);
type WaiterMap = DashMap<WaiterKey, HashMap<u64, oneshot::Sender<()>>>;

/// Registries of parked waiters, one per lock kind.
#[derive(Default)]
pub struct LockWaitDirectory {
    write: WaiterMap,
    read: WaiterMap,
    next_id: AtomicU64,
}

impl LockWaitDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: LockKind) -> &WaiterMap {
        match kind {
            LockKind::Write => &self.write,
            LockKind::Read => &self.read,
        }
    }

    /// Removes one specific registration from a waiter map, on drop,
    /// regardless of whether `wait`'s future resolved, was cancelled, or
    /// was simply abandoned by an outer `select!` choosing another branch.
    /// Without this, each abandoned poll leaves its sender behind forever.
    fn unregister(&self, kind: LockKind, key: &WaiterKey, id: u64) {
        if let Some(mut waiters) = self.map(kind).get_mut(key) {
            waiters.remove(&id);
            if waiters.is_empty() {
                drop(waiters);
                self.map(kind).remove(key);
            }
        }
    }

    /// Parks until `notify` (or `notify_path`) fires for `(path, session)`,
    /// or `cancellation` fires first. Always re-reads storage afterwards —
    /// this only promises "something changed", not a specific new state.
    pub async fn wait(
        &self,
        kind: LockKind,
        path: &Path,
        session: &SessionId,
        cancellation: &CancellationToken,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        let key = (path.clone(), session.clone());
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.map(kind).entry(key.clone()).or_default().insert(id, tx);
        let _guard = WaiterGuard {
            directory: self,
            kind,
            key,
            id,
        };

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(CoordError::Cancelled),
            _ = rx => Ok(()),
        }
    }

    /// Wakes waiters parked on exactly `(path, session)`.
    pub fn notify(&self, kind: LockKind, path: &Path, session: &SessionId) {
        if let Some((_, waiters)) = self.map(kind).remove(&(path.clone(), session.clone())) {
            for (_, waiter) in waiters {
                let _ = waiter.send(());
            }
        }
    }

    /// Wakes every waiter parked on `path`, regardless of which holder
    /// session they were keyed to. Used when a release notification
    /// doesn't identify the specific holder that let go (cross-process
    /// broadcasts, stale-lock cleanup).
    pub fn notify_path(&self, kind: LockKind, path: &Path) {
        let keys: Vec<WaiterKey> = self
            .map(kind)
            .iter()
            .filter(|entry| &entry.key().0 == path)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            if let Some((_, waiters)) = self.map(kind).remove(&key) {
                for (_, waiter) in waiters {
                    let _ = waiter.send(());
                }
            }
        }
    }
}

/// Guarantees a waiter's map entry is removed exactly once, no matter how
/// `wait`'s future is resolved or dropped.
struct WaiterGuard<'a> {
    directory: &'a LockWaitDirectory,
    kind: LockKind,
    key: WaiterKey,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.directory.unregister(self.kind, &self.key, self.id);
    }
}
