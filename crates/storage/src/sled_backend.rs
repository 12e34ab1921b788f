//! Durable CAS backend over `sled`.
//!
//! `sled::Tree::compare_and_swap` takes `old: Option<IVec>` /
//! `new: Option<IVec>` and is itself a CAS primitive, so this backend maps
//! [`CasExpect`]/[`CasOutcome`] straight onto it instead of hand-rolling a
//! version check inside a mutex the way a Put/Get-only store would have
//! to. Each `Record` type gets its own named tree, matching "keyed by
//! record type + primary key".

use crate::error::{Result, StorageError};
use crate::record::Record;
use crate::{CasExpect, CasOutcome, Database, Predicate};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::marker::PhantomData;
use std::path::Path;
use tracing::{debug, warn};

/// A `sled`-backed `Database<R>`. Opens (or creates) one named tree per
/// record type inside a shared `sled::Db`.
pub struct SledDatabase<R: Record> {
    tree: sled::Tree,
    _marker: PhantomData<R>,
}

impl<R: Record> SledDatabase<R> {
    /// Opens `tree_name` inside the database rooted at `path`.
    pub fn open(path: impl AsRef<Path>, tree_name: &str) -> Result<Self> {
        let db = sled::open(path)?;
        Self::from_tree(db.open_tree(tree_name)?)
    }

    /// Uses an already-open tree (e.g. to share one `sled::Db` across
    /// several record types).
    pub fn from_tree(tree: sled::Tree) -> Result<Self> {
        Ok(Self {
            tree,
            _marker: PhantomData,
        })
    }

    fn encode_key(key: &R::Key) -> Result<Vec<u8>> {
        Ok(bincode::serialize(key)?)
    }

    fn encode_record(record: &R) -> Result<Vec<u8>> {
        Ok(bincode::serialize(record)?)
    }

    fn decode_record(bytes: &[u8]) -> Result<R> {
        Ok(bincode::deserialize(bytes)?)
    }
}

#[async_trait]
impl<R: Record> Database<R> for SledDatabase<R> {
    async fn get(&self, key: &R::Key) -> Result<Option<R>> {
        let key_bytes = Self::encode_key(key)?;
        match self.tree.get(key_bytes)? {
            Some(bytes) => Ok(Some(Self::decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn cas_update(&self, new_record: R, expected: CasExpect<R>) -> Result<CasOutcome<R>> {
        let key_bytes = Self::encode_key(&new_record.key())?;
        let new_bytes = Self::encode_record(&new_record)?;
        let old_bytes = match &expected {
            CasExpect::Absent => None,
            CasExpect::Matches(record) => Some(Self::encode_record(record)?),
        };

        match self
            .tree
            .compare_and_swap(&key_bytes, old_bytes, Some(new_bytes))?
        {
            Ok(()) => {
                debug!("cas_update applied");
                Ok(CasOutcome::Applied(new_record))
            }
            Err(cas_error) => match cas_error.current {
                Some(bytes) => Ok(CasOutcome::Conflict(Some(Self::decode_record(&bytes)?))),
                None => Ok(CasOutcome::Conflict(None)),
            },
        }
    }

    async fn delete(&self, key: &R::Key, expected: R) -> Result<bool> {
        let key_bytes = Self::encode_key(key)?;
        let old_bytes = Self::encode_record(&expected)?;
        match self
            .tree
            .compare_and_swap(&key_bytes, Some(old_bytes), None)?
        {
            Ok(()) => Ok(true),
            Err(_) => {
                warn!("delete lost the race against a concurrent writer");
                Ok(false)
            }
        }
    }

    async fn scan(&self, predicate: Option<Predicate<R>>) -> Result<BoxStream<'static, R>> {
        let mut items = Vec::new();
        for entry in self.tree.iter() {
            let (_, value) = entry.map_err(StorageError::from)?;
            let record = Self::decode_record(&value)?;
            if predicate.as_ref().map_or(true, |p| p(&record)) {
                items.push(record);
            }
        }
        Ok(Box::pin(tokio_stream::iter(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoredSession;
    use ensemble_core::{SessionId, Timestamp};

    fn session(id: u8) -> StoredSession {
        StoredSession::new(SessionId::from_bytes(vec![id]), Timestamp::from_millis(1000))
    }

    #[tokio::test]
    async fn cas_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let db: SledDatabase<StoredSession> = SledDatabase::open(dir.path(), "sessions").unwrap();
        let record = session(1);
        let applied = db.cas_update(record.clone(), CasExpect::Absent).await.unwrap();
        assert!(applied.is_applied());
        assert_eq!(db.get(&record.key()).await.unwrap(), Some(record.clone()));

        let bumped = record.bump();
        let second = db
            .cas_update(bumped.clone(), CasExpect::Matches(record))
            .await
            .unwrap();
        assert_eq!(second, CasOutcome::Applied(bumped));
    }
}
