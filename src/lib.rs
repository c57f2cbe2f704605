//! # docstore: a revisioned document store with pluggable backends
//!
//! docstore stores JSON documents under string ids and guards every write
//! with an optimistic `(generation, hash)` revision. Storage engines plug in
//! through an explicit adapter registry:
//!
//! - **Revisions**: compare-and-set on every update and removal
//! - **Tombstones**: removals are retained, hidden from counts and scans
//! - **Local documents**: `_local/` ids that never replicate or count
//! - **Batch scans**: bounded, update-ordered reads of the live set
//! - **Engines**: in-memory, sled on disk, SQLite, and a browser-only store
//!
//! # Usage
//!
//! ```no_run
//! use docstore::{AdapterRegistry, Document, MemoryAdapter, OpenOptions, StorageHandle};
//!
//! # async fn example() -> docstore::StorageResult<()> {
//! let registry = AdapterRegistry::new();
//! registry.register(MemoryAdapter::descriptor())?;
//!
//! let db = StorageHandle::open(&registry, "notes", "memory", OpenOptions::default())?;
//! let rev = db.put(Document::empty("note-1")).await?;
//! assert_eq!(db.count_undeleted().await?, 1);
//! # let _ = rev;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod handle;
pub mod storage;

pub use adapter::{
    builtin_descriptors, AdapterDescriptor, AdapterFactory, AdapterRegistry, BackendAdapter,
    Capability, DiskAdapter, Environment, LocalStorageAdapter, MemoryAdapter, OpenOptions,
    SqliteAdapter,
};
pub use handle::{DatabaseInfo, GetOptions, StorageHandle};
pub use storage::{
    BackendError, CompactionMode, Compactor, DocState, Document, IndexDefinition, IndexOutcome,
    Revision, StorageError, StorageResult,
};
