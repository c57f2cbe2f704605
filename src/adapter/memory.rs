//! In-process memory engine.
//!
//! Each database is a [`MemoryDatabase`]: a DashMap of stored records plus a
//! [`DeletionIndex`] holding the ordered live set. Both hold the same
//! `Arc<StoredRecord>`, so a body is stored once. A write runs entirely while
//! holding the DashMap entry for its id, which makes the revision check and
//! the update one atomic step per id. Inside that section the index mutex is
//! taken to stamp the update sequence; the lock order is always entry, then
//! index. Scans and counts take only the index mutex.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::adapter::shared::SharedPool;
use crate::adapter::{AdapterDescriptor, BackendAdapter, Capability, OpenOptions};
use crate::storage::{
    BackendError, DeletionIndex, Document, IndexDefinition, IndexOutcome, Revision,
    RevisionTracker, StorageError, StorageResult, StoredRecord, WriteIntent,
};

pub const MEMORY_ADAPTER: &str = "memory";

/// One physical in-memory database.
#[derive(Default)]
pub struct MemoryDatabase {
    docs: DashMap<String, Arc<StoredRecord>>,
    index: Mutex<DeletionIndex>,
    update_seq: AtomicU64,
    indexes: RwLock<Vec<IndexDefinition>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validates and applies one write under the id's entry lock.
    pub fn write(
        &self,
        tracker: &RevisionTracker,
        intent: WriteIntent,
    ) -> StorageResult<Revision> {
        let entry = self.docs.entry(intent.id().to_string());
        let current = match &entry {
            Entry::Occupied(slot) => Some(&**slot.get()),
            Entry::Vacant(_) => None,
        };

        let mut index = self.index.lock();
        let seq = self.update_seq.load(Ordering::Acquire) + 1;
        let record = Arc::new(tracker.apply(current, intent, seq)?);
        let revision = record.revision().cloned().ok_or_else(|| {
            BackendError::Corrupted(format!("record {} has no revision", record.doc.id))
        })?;

        self.update_seq.store(seq, Ordering::Release);
        index.apply(record.clone());
        drop(index);

        debug!(
            id = %record.doc.id,
            seq,
            rev = %revision,
            deleted = record.doc.is_deleted(),
            "Document written"
        );
        entry.insert(record);
        Ok(revision)
    }

    pub fn get(&self, id: &str) -> Option<Document> {
        self.docs.get(id).map(|record| record.doc.clone())
    }

    pub fn revision_history(&self, id: &str) -> Option<Vec<Revision>> {
        self.docs.get(id).map(|record| {
            record
                .revision()
                .into_iter()
                .chain(record.history.iter())
                .cloned()
                .collect()
        })
    }

    pub fn scan_live(&self, limit: usize) -> Vec<Document> {
        self.index
            .lock()
            .scan(limit)
            .into_iter()
            .map(|record| record.doc.clone())
            .collect()
    }

    pub fn count_live(&self) -> u64 {
        self.index.lock().count_live() as u64
    }

    pub fn update_seq(&self) -> u64 {
        self.update_seq.load(Ordering::Acquire)
    }

    /// Registers an index declaration. Equivalent declarations are no-ops.
    pub fn declare_index(&self, index: IndexDefinition) -> StorageResult<IndexOutcome> {
        let mut indexes = self.indexes.write();
        if indexes.iter().any(|existing| existing.is_equivalent(&index)) {
            return Ok(IndexOutcome::Exists);
        }
        let name = index.resolved_name();
        if indexes.iter().any(|existing| existing.resolved_name() == name) {
            return Err(StorageError::InvalidArgument(format!(
                "index name {} is already used for other fields",
                name
            )));
        }
        indexes.push(index);
        Ok(IndexOutcome::Created)
    }

    /// Trims every history and compacts the deletion index.
    pub fn compact(&self, tracker: &RevisionTracker) -> usize {
        let keep = tracker.revs_limit() - 1;
        let mut pruned = 0;
        for mut slot in self.docs.iter_mut() {
            if slot.history.len() <= keep {
                continue;
            }
            let record = Arc::make_mut(slot.value_mut());
            pruned += tracker.trim(&mut record.history);
            if record.is_live_user_doc() {
                self.index.lock().refresh(slot.value().clone());
            }
        }
        self.index.lock().compact();
        pruned
    }
}

/// Memory adapter instance bound to one database name.
///
/// `destroy` gives the database back to the pool and drops this instance's
/// reference; every later call fails with `HandleClosed`.
pub struct MemoryAdapter {
    name: String,
    db: RwLock<Option<Arc<MemoryDatabase>>>,
    tracker: RevisionTracker,
    pool: Arc<SharedPool<MemoryDatabase>>,
}

impl MemoryAdapter {
    /// Descriptor with its own pool of databases. Databases live as long as
    /// at least one adapter instance bound to them is not destroyed.
    pub fn descriptor() -> AdapterDescriptor {
        let pool = Arc::new(SharedPool::new());
        AdapterDescriptor::new(MEMORY_ADAPTER, move |name: &str, options: &OpenOptions| {
            let adapter = MemoryAdapter::open(pool.clone(), name, options)?;
            Ok(Arc::new(adapter) as Arc<dyn BackendAdapter>)
        })
        .with_capability(Capability::Indexes)
        .with_capability(Capability::SharedAcrossHandles)
    }

    pub(crate) fn open(
        pool: Arc<SharedPool<MemoryDatabase>>,
        name: &str,
        options: &OpenOptions,
    ) -> StorageResult<Self> {
        let db = pool.acquire(name, || Ok(MemoryDatabase::new()))?;
        debug!(db = name, "Memory database attached");
        Ok(Self {
            name: name.to_string(),
            db: RwLock::new(Some(db)),
            tracker: options.tracker(),
            pool,
        })
    }

    fn database(&self) -> StorageResult<Arc<MemoryDatabase>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| StorageError::HandleClosed(self.name.clone()))
    }
}

#[async_trait]
impl BackendAdapter for MemoryAdapter {
    fn db_name(&self) -> &str {
        &self.name
    }

    async fn put(&self, doc: Document) -> StorageResult<Revision> {
        self.database()?.write(&self.tracker, WriteIntent::Put(doc))
    }

    async fn get(&self, id: &str) -> StorageResult<Option<Document>> {
        Ok(self.database()?.get(id))
    }

    async fn remove(&self, id: &str, revision: Option<&Revision>) -> StorageResult<Revision> {
        self.database()?.write(
            &self.tracker,
            WriteIntent::Remove {
                id: id.to_string(),
                revision: revision.cloned(),
            },
        )
    }

    async fn create_index(&self, index: IndexDefinition) -> StorageResult<IndexOutcome> {
        self.database()?.declare_index(index)
    }

    async fn scan_live(&self, limit: usize) -> StorageResult<Vec<Document>> {
        Ok(self.database()?.scan_live(limit))
    }

    async fn count_live(&self) -> StorageResult<u64> {
        Ok(self.database()?.count_live())
    }

    async fn update_seq(&self) -> StorageResult<u64> {
        Ok(self.database()?.update_seq())
    }

    async fn revision_history(&self, id: &str) -> StorageResult<Vec<Revision>> {
        self.database()?
            .revision_history(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }

    async fn compact(&self) -> StorageResult<usize> {
        Ok(self.database()?.compact(&self.tracker))
    }

    async fn destroy(&self) -> StorageResult<()> {
        let taken = self.db.write().take();
        let db = match taken {
            Some(db) => db,
            None => return Ok(()),
        };
        if self.pool.release(&self.name).is_some() {
            info!(db = %self.name, "Memory database discarded");
        }
        drop(db);
        Ok(())
    }
}
