//! Browser-local storage adapter.
//!
//! Declared as restricted to [`Environment::Browser`]; opening it natively
//! fails with `UnsupportedAdapter` before the factory runs. Web storage is a
//! flat string map without secondary indexes, so the adapter declares no
//! `Indexes` capability. Documents are held by the in-process memory engine.

use async_trait::async_trait;
use std::sync::Arc;

use crate::adapter::memory::{MemoryAdapter, MemoryDatabase};
use crate::adapter::shared::SharedPool;
use crate::adapter::{AdapterDescriptor, BackendAdapter, Capability, Environment, OpenOptions};
use crate::storage::{
    Document, IndexDefinition, IndexOutcome, Revision, StorageError, StorageResult,
};

pub const LOCALSTORAGE_ADAPTER: &str = "localstorage";

pub struct LocalStorageAdapter {
    inner: MemoryAdapter,
}

impl LocalStorageAdapter {
    pub fn descriptor() -> AdapterDescriptor {
        let pool: Arc<SharedPool<MemoryDatabase>> = Arc::new(SharedPool::new());
        AdapterDescriptor::new(LOCALSTORAGE_ADAPTER, move |name: &str, options: &OpenOptions| {
            let inner = MemoryAdapter::open(pool.clone(), name, options)?;
            Ok(Arc::new(LocalStorageAdapter { inner }) as Arc<dyn BackendAdapter>)
        })
        .with_capability(Capability::SharedAcrossHandles)
        .with_capability(Capability::RestrictedTo(Environment::Browser))
    }
}

#[async_trait]
impl BackendAdapter for LocalStorageAdapter {
    fn db_name(&self) -> &str {
        self.inner.db_name()
    }

    async fn put(&self, doc: Document) -> StorageResult<Revision> {
        self.inner.put(doc).await
    }

    async fn get(&self, id: &str) -> StorageResult<Option<Document>> {
        self.inner.get(id).await
    }

    async fn remove(&self, id: &str, revision: Option<&Revision>) -> StorageResult<Revision> {
        self.inner.remove(id, revision).await
    }

    async fn create_index(&self, _index: IndexDefinition) -> StorageResult<IndexOutcome> {
        Err(StorageError::UnsupportedOperation {
            adapter: LOCALSTORAGE_ADAPTER.to_string(),
            operation: "create_index",
        })
    }

    async fn scan_live(&self, limit: usize) -> StorageResult<Vec<Document>> {
        self.inner.scan_live(limit).await
    }

    async fn count_live(&self) -> StorageResult<u64> {
        self.inner.count_live().await
    }

    async fn update_seq(&self) -> StorageResult<u64> {
        self.inner.update_seq().await
    }

    async fn revision_history(&self, id: &str) -> StorageResult<Vec<Revision>> {
        self.inner.revision_history(id).await
    }

    async fn compact(&self) -> StorageResult<usize> {
        self.inner.compact().await
    }

    async fn destroy(&self) -> StorageResult<()> {
        self.inner.destroy().await
    }
}
