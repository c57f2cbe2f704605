//! Storage handles: one adapter instance bound to one named database.
//!
//! A handle validates caller input, routes every operation to its adapter and
//! gates operations against `destroy` with a tokio semaphore. Each operation
//! holds one permit while it runs; `destroy` takes every permit, which waits
//! for in-flight operations to finish, then closes the semaphore so later
//! and queued operations fail with `HandleClosed`.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{
    AdapterDescriptor, AdapterRegistry, BackendAdapter, Capability, OpenOptions,
};
use crate::storage::document::validate_id;
use crate::storage::{
    BackendError, Document, IndexDefinition, IndexOutcome, Revision, StorageError, StorageResult,
};

/// Operations that may run concurrently on one handle.
const MAX_IN_FLIGHT: u32 = 4096;

/// Options for [`StorageHandle::get_with_options`].
#[derive(Clone, Copy, Debug, Default)]
pub struct GetOptions {
    /// Return tombstones instead of reporting them as not found.
    pub include_tombstones: bool,
}

/// Summary of an open database.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DatabaseInfo {
    pub db_name: String,
    pub adapter: String,
    pub doc_count: u64,
    pub update_seq: u64,
}

/// A named database opened through a registered adapter.
pub struct StorageHandle {
    name: String,
    descriptor: AdapterDescriptor,
    adapter: Arc<dyn BackendAdapter>,
    gate: Semaphore,
}

impl StorageHandle {
    /// Opens database `name` with the adapter registered as `adapter_name`.
    ///
    /// Fails with `AdapterNotRegistered` for unknown adapters and with
    /// `UnsupportedAdapter` when the adapter is restricted to an environment
    /// other than `options.environment`. The factory is not called in either
    /// case.
    pub fn open(
        registry: &AdapterRegistry,
        name: &str,
        adapter_name: &str,
        options: OpenOptions,
    ) -> StorageResult<Self> {
        if name.is_empty() {
            return Err(StorageError::InvalidArgument(
                "database name is empty".to_string(),
            ));
        }

        let descriptor = registry.resolve(adapter_name)?;
        if !descriptor.runs_in(options.environment) {
            warn!(
                adapter = adapter_name,
                environment = %options.environment,
                "Adapter cannot run in this environment"
            );
            return Err(StorageError::UnsupportedAdapter {
                adapter: adapter_name.to_string(),
                environment: options.environment,
            });
        }

        let adapter = descriptor.instantiate(name, &options)?;
        info!(db = name, adapter = adapter_name, "Database opened");

        Ok(Self {
            name: name.to_string(),
            descriptor,
            adapter,
            gate: Semaphore::new(MAX_IN_FLIGHT as usize),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn adapter_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn capabilities(&self) -> &HashSet<Capability> {
        &self.descriptor.capabilities
    }

    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    async fn permit(&self) -> StorageResult<SemaphorePermit<'_>> {
        self.gate
            .acquire()
            .await
            .map_err(|_| StorageError::HandleClosed(self.name.clone()))
    }

    /// Writes a document and returns its new revision.
    ///
    /// A document in the tombstone state is treated as a removal.
    pub async fn put(&self, doc: Document) -> StorageResult<Revision> {
        validate_id(&doc.id)?;
        let _permit = self.permit().await?;

        if doc.is_deleted() {
            self.adapter.remove(&doc.id, doc.revision.as_ref()).await
        } else {
            self.adapter.put(doc).await
        }
    }

    /// Stores `body` under a freshly generated id.
    pub async fn post(&self, body: Map<String, Value>) -> StorageResult<(String, Revision)> {
        let id = Uuid::new_v4().to_string();
        let revision = self.put(Document::new(id.clone(), body)).await?;
        Ok((id, revision))
    }

    /// Fetches the latest live state of `id`. Tombstones are reported as
    /// not found.
    pub async fn get(&self, id: &str) -> StorageResult<Document> {
        self.get_with_options(id, GetOptions::default()).await
    }

    pub async fn get_with_options(&self, id: &str, options: GetOptions) -> StorageResult<Document> {
        let _permit = self.permit().await?;

        match self.adapter.get(id).await? {
            Some(doc) if !doc.is_deleted() || options.include_tombstones => Ok(doc),
            _ => Err(StorageError::NotFound(id.to_string())),
        }
    }

    /// Converts `doc` into a tombstone. `doc.revision` must be current.
    pub async fn remove(&self, doc: &Document) -> StorageResult<Revision> {
        let _permit = self.permit().await?;
        self.adapter.remove(&doc.id, doc.revision.as_ref()).await
    }

    /// Writes every document independently. The outer error is reserved for
    /// handle-level failures; each document gets its own outcome.
    pub async fn bulk_put(
        &self,
        docs: Vec<Document>,
    ) -> StorageResult<Vec<StorageResult<Revision>>> {
        let _permit = self.permit().await?;

        let mut slots: Vec<Option<StorageResult<Revision>>> = Vec::with_capacity(docs.len());
        let mut accepted = Vec::with_capacity(docs.len());
        for doc in docs {
            match validate_id(&doc.id) {
                Ok(()) => {
                    slots.push(None);
                    accepted.push(doc);
                }
                Err(e) => slots.push(Some(Err(e))),
            }
        }

        let mut written = self.adapter.bulk_put(accepted).await.into_iter();
        let results: Vec<_> = slots
            .into_iter()
            .map(|slot| {
                slot.or_else(|| written.next()).unwrap_or_else(|| {
                    Err(BackendError::Corrupted(
                        "bulk write returned too few results".to_string(),
                    )
                    .into())
                })
            })
            .collect();

        debug!(
            db = %self.name,
            total = results.len(),
            failed = results.iter().filter(|r| r.is_err()).count(),
            "Bulk write finished"
        );
        Ok(results)
    }

    /// Declares an index. Returns `Exists` when an equivalent one is declared.
    pub async fn create_index(&self, index: IndexDefinition) -> StorageResult<IndexOutcome> {
        let _permit = self.permit().await?;

        if !self.descriptor.supports(Capability::Indexes) {
            return Err(StorageError::UnsupportedOperation {
                adapter: self.descriptor.name.clone(),
                operation: "create_index",
            });
        }
        index.validate()?;

        let outcome = self.adapter.create_index(index).await?;
        debug!(db = %self.name, ?outcome, "Index declaration handled");
        Ok(outcome)
    }

    /// Number of live, non-local documents.
    pub async fn count_undeleted(&self) -> StorageResult<u64> {
        let _permit = self.permit().await?;
        self.adapter.count_live().await
    }

    /// Up to `limit` live, non-local documents in update-sequence order.
    pub async fn get_batch(&self, limit: usize) -> StorageResult<Vec<Document>> {
        let _permit = self.permit().await?;
        self.adapter.scan_live(limit).await
    }

    pub async fn info(&self) -> StorageResult<DatabaseInfo> {
        let _permit = self.permit().await?;
        Ok(DatabaseInfo {
            db_name: self.name.clone(),
            adapter: self.descriptor.name.clone(),
            doc_count: self.adapter.count_live().await?,
            update_seq: self.adapter.update_seq().await?,
        })
    }

    /// Current revision of `id` followed by its retained ancestors.
    pub async fn revision_history(&self, id: &str) -> StorageResult<Vec<Revision>> {
        let _permit = self.permit().await?;
        self.adapter.revision_history(id).await
    }

    /// Trims revision histories to the configured limit.
    pub async fn compact(&self) -> StorageResult<usize> {
        let _permit = self.permit().await?;
        let pruned = self.adapter.compact().await?;
        debug!(db = %self.name, pruned, "Compaction pass finished");
        Ok(pruned)
    }

    /// Waits for in-flight operations, releases the adapter and closes the
    /// handle. Every later operation fails with `HandleClosed`.
    pub async fn destroy(&self) -> StorageResult<()> {
        let _all = self
            .gate
            .acquire_many(MAX_IN_FLIGHT)
            .await
            .map_err(|_| StorageError::HandleClosed(self.name.clone()))?;

        let result = self.adapter.destroy().await;
        self.gate.close();

        match &result {
            Ok(()) => info!(db = %self.name, adapter = %self.descriptor.name, "Database destroyed"),
            Err(e) => warn!(db = %self.name, "Adapter release failed: {}", e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{Environment, LocalStorageAdapter, MemoryAdapter};
    use serde_json::json;
    use std::time::Duration;

    fn registry() -> AdapterRegistry {
        let registry = AdapterRegistry::new();
        registry.register(MemoryAdapter::descriptor()).unwrap();
        registry.register(LocalStorageAdapter::descriptor()).unwrap();
        registry
    }

    fn open(registry: &AdapterRegistry, name: &str) -> StorageHandle {
        StorageHandle::open(registry, name, "memory", OpenOptions::default()).unwrap()
    }

    fn body(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_get_hides_tombstones() {
        let registry = registry();
        let db = open(&registry, "db");

        let rev = db.put(Document::new("a", body(json!({"x": 1})))).await.unwrap();
        let doc = db.get("a").await.unwrap();
        assert_eq!(doc.revision, Some(rev));

        db.remove(&doc).await.unwrap();
        assert!(db.get("a").await.unwrap_err().is_not_found());

        let tomb = db
            .get_with_options("a", GetOptions { include_tombstones: true })
            .await
            .unwrap();
        assert!(tomb.is_deleted());
        assert_eq!(tomb.revision.unwrap().generation(), 2);
    }

    #[tokio::test]
    async fn test_put_tombstone_routes_to_remove() {
        let registry = registry();
        let db = open(&registry, "db");

        let rev = db.put(Document::empty("a")).await.unwrap();
        let removed = db.put(Document::tombstone("a", rev)).await.unwrap();
        assert_eq!(removed.generation(), 2);
        assert_eq!(db.count_undeleted().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_post_generates_ids() {
        let registry = registry();
        let db = open(&registry, "db");

        let (id_a, rev_a) = db.post(body(json!({"n": 1}))).await.unwrap();
        let (id_b, _) = db.post(body(json!({"n": 2}))).await.unwrap();
        assert_ne!(id_a, id_b);
        assert_eq!(rev_a.generation(), 1);
        assert_eq!(db.get(&id_a).await.unwrap().field("n"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_invalid_ids_rejected() {
        let registry = registry();
        let db = open(&registry, "db");

        assert!(matches!(
            db.put(Document::empty("")).await.unwrap_err(),
            StorageError::InvalidArgument(_)
        ));

        let results = db
            .bulk_put(vec![Document::empty("ok"), Document::empty("_bad"), Document::empty("ok2")])
            .await
            .unwrap();
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(StorageError::InvalidArgument(_))));
        assert!(results[2].is_ok());
        assert_eq!(db.count_undeleted().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_info() {
        let registry = registry();
        let db = open(&registry, "infodb");
        db.put(Document::empty("a")).await.unwrap();
        db.put(Document::empty("_local/b")).await.unwrap();

        let info = db.info().await.unwrap();
        assert_eq!(
            info,
            DatabaseInfo {
                db_name: "infodb".to_string(),
                adapter: "memory".to_string(),
                doc_count: 1,
                update_seq: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_environment_restriction() {
        let registry = registry();

        let err = StorageHandle::open(&registry, "web", "localstorage", OpenOptions::default())
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StorageError::UnsupportedAdapter { environment: Environment::Native, .. }
        ));

        let options = OpenOptions::default().with_environment(Environment::Browser);
        let db = StorageHandle::open(&registry, "web", "localstorage", options).unwrap();
        db.put(Document::empty("a")).await.unwrap();

        let err = db.create_index(IndexDefinition::new(["x"])).await.unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedOperation { .. }));
    }

    #[tokio::test]
    async fn test_destroy_closes_handle() {
        let registry = registry();
        let db = open(&registry, "db");
        db.put(Document::empty("a")).await.unwrap();

        db.destroy().await.unwrap();
        assert!(db.is_closed());
        assert!(matches!(db.get("a").await, Err(StorageError::HandleClosed(_))));
        assert!(matches!(db.count_undeleted().await, Err(StorageError::HandleClosed(_))));
        assert!(matches!(db.destroy().await, Err(StorageError::HandleClosed(_))));
    }

    #[tokio::test]
    async fn test_destroy_waits_for_in_flight() {
        let registry = registry();
        let db = Arc::new(open(&registry, "db"));

        let permit = db.permit().await.unwrap();
        let destroyer = {
            let db = db.clone();
            tokio::spawn(async move { db.destroy().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!destroyer.is_finished());
        assert!(!db.is_closed());

        drop(permit);
        destroyer.await.unwrap().unwrap();
        assert!(db.is_closed());
    }

    #[tokio::test]
    async fn test_open_rejects_empty_name() {
        let registry = registry();
        let err = StorageHandle::open(&registry, "", "memory", OpenOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }
}
