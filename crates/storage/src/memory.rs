//! In-memory CAS backend, backed by `dashmap`.
//!
//! `DashMap::entry` holds the shard lock for the lifetime of the `Entry`
//! handle, which is exactly the atomicity a CAS update needs: the
//! read-compare-write happens under one lock acquisition, with no window
//! for another task to observe or mutate the slot in between.

use crate::error::Result;
use crate::record::Record;
use crate::{CasExpect, CasOutcome, Database, Predicate};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::BoxStream;

/// An in-memory, process-local `Database<R>`. The default backend: used
/// directly by tests and the CLI demo, and as the model the `sled`
/// backend's CAS semantics are checked against.
pub struct MemoryDatabase<R: Record> {
    records: DashMap<R::Key, R>,
}

impl<R: Record> Default for MemoryDatabase<R> {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
        }
    }
}

impl<R: Record> MemoryDatabase<R> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<R: Record> Database<R> for MemoryDatabase<R> {
    async fn get(&self, key: &R::Key) -> Result<Option<R>> {
        Ok(self.records.get(key).map(|entry| entry.value().clone()))
    }

    async fn cas_update(&self, new_record: R, expected: CasExpect<R>) -> Result<CasOutcome<R>> {
        let key = new_record.key();
        let outcome = match self.records.entry(key) {
            Entry::Occupied(mut occupied) => match &expected {
                CasExpect::Absent => CasOutcome::Conflict(Some(occupied.get().clone())),
                CasExpect::Matches(expected) if expected == occupied.get() => {
                    occupied.insert(new_record.clone());
                    CasOutcome::Applied(new_record)
                }
                CasExpect::Matches(_) => CasOutcome::Conflict(Some(occupied.get().clone())),
            },
            Entry::Vacant(vacant) => match &expected {
                CasExpect::Absent => {
                    vacant.insert(new_record.clone());
                    CasOutcome::Applied(new_record)
                }
                CasExpect::Matches(_) => CasOutcome::Conflict(None),
            },
        };
        Ok(outcome)
    }

    async fn delete(&self, key: &R::Key, expected: R) -> Result<bool> {
        let Entry::Occupied(occupied) = self.records.entry(key.clone()) else {
            return Ok(false);
        };
        if *occupied.get() == expected {
            occupied.remove();
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn scan(&self, predicate: Option<Predicate<R>>) -> Result<BoxStream<'static, R>> {
        let items: Vec<R> = self
            .records
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|record| predicate.as_ref().map_or(true, |p| p(record)))
            .collect();
        Ok(Box::pin(tokio_stream::iter(items)))
    }
}
