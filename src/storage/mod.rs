//! Document model and storage primitives shared by every adapter.
//!
//! The storage module defines what a document looks like to callers and how its
//! revisions evolve, independent of the engine that persists it:
//!
//! 1. **Documents**: JSON bodies addressed by id, either live or tombstoned
//! 2. **Revisions**: `(generation, hash)` pairs checked with compare-and-set
//! 3. **Deletion index**: lifecycle of every id and the ordered live set
//! 4. **Compaction**: background trimming of revision histories
//!
//! Tombstones are never physically purged; compaction only drops ancestor
//! revisions beyond the configured limit.

pub mod compaction;
pub mod document;
pub mod index;
pub mod revision;

pub use compaction::{CompactionMode, Compactor};
pub use document::{DocState, Document, IndexDefinition, IndexOutcome, StoredRecord, LOCAL_PREFIX};
pub use index::DeletionIndex;
pub use revision::{Revision, RevisionTracker, WriteIntent, DEFAULT_REVS_LIMIT};

use crate::adapter::Environment;
use thiserror::Error;

/// Adapter-level I/O and encoding failures.
///
/// These are never interpreted by the contract layer; they travel to the
/// caller inside [`StorageError::StorageUnavailable`].
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupted record: {0}")]
    Corrupted(String),
}

/// Errors surfaced by the document-store contract.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Adapter not registered: {0}")]
    AdapterNotRegistered(String),

    #[error("Adapter already registered: {0}")]
    DuplicateAdapter(String),

    #[error("Adapter {adapter} cannot run in the {environment} environment")]
    UnsupportedAdapter {
        adapter: String,
        environment: Environment,
    },

    #[error("Document not found: {0}")]
    NotFound(String),

    #[error("Revision conflict on document {id}")]
    RevisionConflict {
        id: String,
        current: Option<Revision>,
        supplied: Option<Revision>,
    },

    #[error("Storage handle closed: {0}")]
    HandleClosed(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] BackendError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Adapter {adapter} does not support {operation}")]
    UnsupportedOperation {
        adapter: String,
        operation: &'static str,
    },
}

impl StorageError {
    /// True for revision conflicts, which callers resolve by re-reading.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StorageError::RevisionConflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::StorageUnavailable(BackendError::Sled(err))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::StorageUnavailable(BackendError::Sqlite(err))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::StorageUnavailable(BackendError::Serialization(err))
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::StorageUnavailable(BackendError::Io(err))
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
