//! Error taxonomy for the coordination core.

use thiserror::Error;

/// Result type for coordination-core operations.
pub type Result<T> = std::result::Result<T, CoordError>;

/// Errors surfaced by the coordination core.
///
/// Variants map 1:1 onto the error taxonomy of the coordination spec:
/// `SessionTerminated` and `Invariant` are terminal, `StorageUnavailable`
/// may be retried at the caller's discretion, and `Cancelled` always means
/// a caller-supplied cancellation token fired.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoordError {
    /// The caller's session (or a session named in the call) is no longer
    /// alive. Terminal — never retried internally.
    #[error("session terminated: {session}")]
    SessionTerminated {
        /// Human-readable session identifier (hex-encoded bytes).
        session: String,
    },

    /// The entry at the given path does not exist, possibly due to a
    /// concurrent delete.
    #[error("entry not found: {path}")]
    EntryNotFound {
        /// Escaped path that was looked up.
        path: String,
    },

    /// `create_entry` was called on a path that already has an entry.
    #[error("entry already exists: {path}")]
    DuplicateEntry {
        /// Escaped path that already existed.
        path: String,
    },

    /// The storage backend failed transiently; the caller may retry.
    #[error("storage unavailable: {message}")]
    StorageUnavailable {
        /// Description of the backend failure.
        message: String,
    },

    /// The caller's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,

    /// An internal consistency check failed. Indicates a bug in this
    /// crate or a backend that violated the CAS contract; fatal for the
    /// calling session.
    #[error("invariant violated: {message}")]
    Invariant {
        /// Description of the violated invariant.
        message: String,
    },
}

impl CoordError {
    /// True for errors that a caller may reasonably retry without
    /// changing anything about the request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordError::StorageUnavailable { .. })
    }
}

impl From<tokio::time::error::Elapsed> for CoordError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        CoordError::Cancelled
    }
}
