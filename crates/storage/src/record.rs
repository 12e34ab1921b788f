//! Storage record layout: [`StoredEntry`] and [`StoredSession`], both
//! indexed by a primary key and discriminated for CAS by
//! `storage_version`.

use ensemble_core::{Path, Segment, SessionId, Timestamp};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeSet;
use std::hash::Hash;

/// A record stored through a [`crate::Database`]: knows its own primary
/// key, and is compared whole for CAS (the whole record is `expected`,
/// not just a version field, matching the spec's "compare-and-swap on a
/// version number" in spirit: `storage_version` is part of the record and
/// so part of the equality check).
pub trait Record: Clone + Send + Sync + PartialEq + Serialize + DeserializeOwned + 'static {
    type Key: Clone + Eq + Hash + Ord + Send + Sync + Serialize + 'static;

    fn key(&self) -> Self::Key;
    fn storage_version(&self) -> u64;
}

/// An entry in the hierarchical namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEntry {
    pub path: Path,
    pub value: Vec<u8>,
    pub creation_time: Timestamp,
    pub last_write_time: Timestamp,
    pub write_lock: Option<SessionId>,
    pub read_locks: BTreeSet<SessionId>,
    pub storage_version: u64,
    pub ephemeral_owner: Option<SessionId>,
    pub children: BTreeSet<Segment>,
}

impl StoredEntry {
    /// A brand-new entry at `path`, unlocked, with no children, at
    /// `storage_version = 1` (the first successful CAS-insert bumps it
    /// there implicitly — this constructor produces the pre-insert shape).
    pub fn new(path: Path, value: Vec<u8>, now: Timestamp, ephemeral_owner: Option<SessionId>) -> Self {
        Self {
            path,
            value,
            creation_time: now,
            last_write_time: now,
            write_lock: None,
            read_locks: BTreeSet::new(),
            storage_version: 1,
            ephemeral_owner,
            children: BTreeSet::new(),
        }
    }

    /// A copy with `storage_version` incremented by one, as every
    /// successful CAS update must produce.
    pub fn bump(&self) -> Self {
        let mut next = self.clone();
        next.storage_version += 1;
        next
    }

    /// True if `session` may observe itself as a compatible writer
    /// (either it already holds the write lock, or there is none).
    pub fn write_lock_free_for(&self, session: &SessionId, allow_own: bool) -> bool {
        match &self.write_lock {
            None => true,
            Some(holder) => allow_own && holder == session,
        }
    }

    /// `read_locks`, minus `session` itself — the set of *other* sessions
    /// a writer must wait to drain.
    pub fn blocking_readers(&self, session: &SessionId) -> BTreeSet<SessionId> {
        self.read_locks
            .iter()
            .filter(|s| *s != session)
            .cloned()
            .collect()
    }

    /// True if `session` holds the write lock, a read lock, or ephemeral
    /// ownership here — i.e. this path belongs in `session.entry_paths`
    /// (spec invariant 6).
    pub fn references(&self, session: &SessionId) -> bool {
        self.write_lock.as_ref() == Some(session)
            || self.read_locks.contains(session)
            || self.ephemeral_owner.as_ref() == Some(session)
    }
}

impl Record for StoredEntry {
    type Key = Path;

    fn key(&self) -> Path {
        self.path.clone()
    }

    fn storage_version(&self) -> u64 {
        self.storage_version
    }
}

/// A session's authoritative liveness and ownership record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredSession {
    pub session_id: SessionId,
    pub lease_end: Timestamp,
    pub is_ended: bool,
    pub storage_version: u64,
    pub entry_paths: BTreeSet<Path>,
}

impl StoredSession {
    pub fn new(session_id: SessionId, lease_end: Timestamp) -> Self {
        Self {
            session_id,
            lease_end,
            is_ended: false,
            storage_version: 1,
            entry_paths: BTreeSet::new(),
        }
    }

    pub fn bump(&self) -> Self {
        let mut next = self.clone();
        next.storage_version += 1;
        next
    }

    /// Invariant 1 (§3.2): alive iff not ended and the lease has not
    /// passed `now`.
    pub fn is_alive(&self, now: Timestamp) -> bool {
        !self.is_ended && !self.lease_end.has_passed(now)
    }
}

impl Record for StoredSession {
    type Key = SessionId;

    fn key(&self) -> SessionId {
        self.session_id.clone()
    }

    fn storage_version(&self) -> u64 {
        self.storage_version
    }
}
