//! Storage-layer error type and its conversion into the core taxonomy.

use ensemble_core::CoordError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors a [`crate::Database`] implementation may return. All variants
/// are transient/backend failures — CAS *conflicts* are not errors, they
/// are reported through [`crate::CasOutcome::Conflict`].
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("backend unavailable: {0}")]
    Backend(String),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for CoordError {
    fn from(err: StorageError) -> Self {
        CoordError::StorageUnavailable {
            message: err.to_string(),
        }
    }
}

#[cfg(feature = "sled")]
impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for StorageError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        StorageError::Encoding(err.to_string())
    }
}
