//! Opaque session identifiers.
//!
//! A [`SessionId`] is `prefix ‖ physical_address`: the prefix guarantees
//! uniqueness under same-address contention (a monotonic counter combined
//! with wall-clock ticks), the address bytes let a peer route a
//! notification back to the node that owns the session. Equality and
//! hashing are over the full byte sequence; a designated "none" value is
//! the empty identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// An opaque session identifier: time-derived prefix plus node address
/// bytes, compared and hashed by byte content.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(Vec<u8>);

impl SessionId {
    /// The empty identifier, used as a sentinel "no session" value.
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    /// Builds a session id from its raw bytes (`prefix ‖ address`).
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// A short hex rendering, for logs and error messages.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "SessionId(none)")
        } else {
            write!(f, "SessionId({})", self.to_hex())
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "<none>")
        } else {
            write!(f, "{}", self.to_hex())
        }
    }
}

/// Produces fresh, process-unique session identifiers.
///
/// Combines current wall-clock ticks with a per-process counter as the
/// prefix (distinct per call within a process) and the node's physical
/// address bytes (distinct across processes, assuming distinct addresses).
pub struct SessionProvider {
    physical_address: Vec<u8>,
    counter: AtomicU64,
}

impl SessionProvider {
    pub fn new(physical_address: impl Into<Vec<u8>>) -> Self {
        Self {
            physical_address: physical_address.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// Generates a new, process-unique session identifier.
    pub fn create(&self) -> SessionId {
        let ticks = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);

        let mut bytes = Vec::with_capacity(16 + self.physical_address.len());
        bytes.extend_from_slice(&ticks.to_be_bytes());
        bytes.extend_from_slice(&seq.to_be_bytes());
        bytes.extend_from_slice(&self.physical_address);
        SessionId::from_bytes(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_is_empty() {
        assert!(SessionId::none().is_none());
    }

    #[test]
    fn provider_yields_distinct_ids() {
        let provider = SessionProvider::new(vec![1, 2, 3, 4]);
        let a = provider.create();
        let b = provider.create();
        assert_ne!(a, b);
        assert!(!a.is_none());
    }

    #[test]
    fn different_addresses_differ() {
        let p1 = SessionProvider::new(vec![1, 2, 3, 4]);
        let p2 = SessionProvider::new(vec![5, 6, 7, 8]);
        assert_ne!(p1.create(), p2.create());
    }
}
