//! # CAS key-value storage abstraction
//!
//! This crate defines the `Database` contract the coordination core is
//! built on (§6.1 of the design: get / cas_update / scan / delete over
//! opaque records keyed by record type + primary key) and two backends:
//! an in-memory, `dashmap`-backed store used by tests and the CLI demo,
//! and an optional `sled`-backed durable store behind the `sled` feature.
//!
//! `cas_update` is expressed as an explicit `CasExpect`/`CasOutcome` pair
//! rather than the "equality with a record" pseudocode in the design
//! sketch, because Rust has no natural "no record yet" value of type `R`
//! to compare against — `CasExpect::Absent` fills that role without a
//! sentinel.

mod error;
mod memory;
mod record;

#[cfg(feature = "sled")]
mod sled_backend;

pub use error::{Result, StorageError};
pub use memory::MemoryDatabase;
pub use record::{Record, StoredEntry, StoredSession};

#[cfg(feature = "sled")]
pub use sled_backend::SledDatabase;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;

/// What the caller expects the current record to look like before a CAS
/// update is applied.
#[derive(Clone)]
pub enum CasExpect<R> {
    /// No record exists yet at this key.
    Absent,
    /// The current record must equal this exact value (including its
    /// `storage_version`).
    Matches(R),
}

/// The result of a CAS attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome<R> {
    /// The update was applied; carries the new current record (always
    /// equal to the `new_record` that was proposed).
    Applied(R),
    /// Someone else's write landed first; carries the actual current
    /// record (`None` if the key is still/now absent).
    Conflict(Option<R>),
}

impl<R> CasOutcome<R> {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied(_))
    }

    pub fn into_applied(self) -> Option<R> {
        match self {
            CasOutcome::Applied(record) => Some(record),
            CasOutcome::Conflict(_) => None,
        }
    }
}

/// A predicate used by [`Database::scan`] to filter records server-side
/// (or backend-equivalent) before they're streamed to the caller.
pub type Predicate<R> = Arc<dyn Fn(&R) -> bool + Send + Sync>;

/// The storage contract every coordination-core layer above this crate is
/// built against. One instance is bound to one `Record` type — the
/// coordination core holds a `Database<StoredEntry>` and a
/// `Database<StoredSession>` side by side, matching the two record types
/// of the storage layout.
#[async_trait]
pub trait Database<R: Record>: Send + Sync {
    /// Fetches the current record at `key`, if any.
    async fn get(&self, key: &R::Key) -> Result<Option<R>>;

    /// Atomically applies `new_record` if the current state matches
    /// `expected`. Never errors on a CAS loss — that's `CasOutcome::Conflict`,
    /// not a `StorageError`.
    async fn cas_update(&self, new_record: R, expected: CasExpect<R>) -> Result<CasOutcome<R>>;

    /// Streams every record, optionally filtered by `predicate`. No
    /// ordering is guaranteed.
    async fn scan(&self, predicate: Option<Predicate<R>>) -> Result<BoxStream<'static, R>>;

    /// Deletes the record at `key` if it currently equals `expected`.
    /// Returns whether the delete was applied.
    async fn delete(&self, key: &R::Key, expected: R) -> Result<bool>;
}
