//! Sled-backed persistent engine.
//!
//! Each database lives in its own sled directory under `data_dir/<name>` and
//! is split into trees:
//! - `docs`: id → JSON-encoded [`StoredRecord`]
//! - `live`: `{seq_be_bytes}` → id, one entry per live non-local document
//! - `meta`: update sequence and live-document counter
//! - `indexes`: index name → JSON-encoded [`IndexDefinition`]
//!
//! Every write is a single transaction over `docs`, `live` and `meta`, so the
//! revision check, the live-set move and the counters commit together. sled
//! retries the transaction on conflict, which serializes writers of the same
//! id. Counting reads one counter and scanning walks `live` in key order,
//! which is update-sequence order.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::{IVec, Transactional};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::adapter::shared::SharedPool;
use crate::adapter::{AdapterDescriptor, BackendAdapter, Capability, OpenOptions};
use crate::storage::{
    BackendError, Document, IndexDefinition, IndexOutcome, Revision, RevisionTracker,
    StorageError, StorageResult, StoredRecord, WriteIntent,
};

pub const DISK_ADAPTER: &str = "disk";

const UPDATE_SEQ_KEY: &[u8] = b"update_seq";
const LIVE_COUNT_KEY: &[u8] = b"live_count";

/// sled refuses to open the same directory twice in one process, so every
/// adapter instance in the process shares one pool keyed by path.
static OPEN_DATABASES: Lazy<SharedPool<DiskDatabase>> = Lazy::new(SharedPool::new);

/// One physical sled database.
pub struct DiskDatabase {
    db: sled::Db,
    docs: sled::Tree,
    live: sled::Tree,
    meta: sled::Tree,
    indexes: sled::Tree,
    index_lock: Mutex<()>,
    path: PathBuf,
}

impl DiskDatabase {
    pub fn open(path: &Path, options: &OpenOptions) -> StorageResult<Self> {
        debug!("Initializing disk database at {:?}", path);

        std::fs::create_dir_all(path)?;

        let db = sled::Config::new()
            .path(path)
            .cache_capacity(options.cache_size_mb * 1024 * 1024)
            .flush_every_ms(options.flush_interval_ms)
            .open()?;

        let docs = db.open_tree("docs")?;
        let live = db.open_tree("live")?;
        let meta = db.open_tree("meta")?;
        let indexes = db.open_tree("indexes")?;

        info!(
            "Disk database opened at {:?} with cache_size={}MB, flush_interval={:?}ms",
            path, options.cache_size_mb, options.flush_interval_ms
        );

        Ok(Self {
            db,
            docs,
            live,
            meta,
            indexes,
            index_lock: Mutex::new(()),
            path: path.to_path_buf(),
        })
    }

    /// Validates and applies one write in a single transaction.
    pub fn write(
        &self,
        tracker: &RevisionTracker,
        intent: WriteIntent,
    ) -> StorageResult<Revision> {
        let id = intent.id().to_string();

        let result = (&self.docs, &self.live, &self.meta).transaction(|(docs, live, meta)| {
            let current = match docs.get(id.as_bytes())? {
                Some(bytes) => {
                    Some(decode_record(&bytes).map_err(ConflictableTransactionError::Abort)?)
                }
                None => None,
            };

            let seq = decode_u64(meta.get(UPDATE_SEQ_KEY)?)
                .map_err(ConflictableTransactionError::Abort)?
                + 1;
            let record = tracker
                .apply(current.as_ref(), intent.clone(), seq)
                .map_err(ConflictableTransactionError::Abort)?;

            let was_live = current.as_ref().map_or(false, StoredRecord::is_live_user_doc);
            let now_live = record.is_live_user_doc();

            if let Some(previous) = current.as_ref().filter(|_| was_live) {
                live.remove(&previous.seq.to_be_bytes()[..])?;
            }
            if now_live {
                live.insert(&seq.to_be_bytes()[..], id.as_bytes())?;
            }

            if was_live != now_live {
                let count = decode_u64(meta.get(LIVE_COUNT_KEY)?)
                    .map_err(ConflictableTransactionError::Abort)?;
                let count = if now_live { count + 1 } else { count.saturating_sub(1) };
                meta.insert(LIVE_COUNT_KEY, &count.to_be_bytes()[..])?;
            }
            meta.insert(UPDATE_SEQ_KEY, &seq.to_be_bytes()[..])?;

            let encoded = serde_json::to_vec(&record)
                .map_err(|e| ConflictableTransactionError::Abort(StorageError::from(e)))?;
            docs.insert(id.as_bytes(), encoded)?;

            Ok(record)
        });

        let record = match result {
            Ok(record) => record,
            Err(TransactionError::Abort(err)) => return Err(err),
            Err(TransactionError::Storage(err)) => return Err(err.into()),
        };

        debug!(id = %id, seq = record.seq, deleted = record.doc.is_deleted(), "Document written");
        record
            .revision()
            .cloned()
            .ok_or_else(|| BackendError::Corrupted(format!("record {} has no revision", id)).into())
    }

    pub fn record(&self, id: &str) -> StorageResult<Option<StoredRecord>> {
        match self.docs.get(id.as_bytes())? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn scan_live(&self, limit: usize) -> StorageResult<Vec<Document>> {
        let mut results = Vec::new();

        for item in self.live.iter() {
            if results.len() >= limit {
                break;
            }
            let (key, id) = item?;
            let seq = decode_u64(Some(key))?;

            // A concurrent write may have moved the document; skip stale keys
            if let Some(bytes) = self.docs.get(&id)? {
                let record = decode_record(&bytes)?;
                if record.seq == seq && record.is_live_user_doc() {
                    results.push(record.doc);
                }
            }
        }

        Ok(results)
    }

    pub fn count_live(&self) -> StorageResult<u64> {
        decode_u64(self.meta.get(LIVE_COUNT_KEY)?)
    }

    pub fn update_seq(&self) -> StorageResult<u64> {
        decode_u64(self.meta.get(UPDATE_SEQ_KEY)?)
    }

    pub fn declare_index(&self, index: IndexDefinition) -> StorageResult<IndexOutcome> {
        let _guard = self.index_lock.lock();

        for item in self.indexes.iter() {
            let (_, bytes) = item?;
            let existing: IndexDefinition = serde_json::from_slice(&bytes)?;
            if existing.is_equivalent(&index) {
                return Ok(IndexOutcome::Exists);
            }
        }

        let name = index.resolved_name();
        if self.indexes.contains_key(name.as_bytes())? {
            return Err(StorageError::InvalidArgument(format!(
                "index name {} is already used for other fields",
                name
            )));
        }

        self.indexes.insert(name.as_bytes(), serde_json::to_vec(&index)?)?;
        debug!(index = %name, "Index declared");
        Ok(IndexOutcome::Created)
    }

    /// Trims histories with compare-and-swap so concurrent writes are never
    /// overwritten. Records that change mid-compaction are left for the next
    /// pass.
    pub fn compact(&self, tracker: &RevisionTracker) -> StorageResult<usize> {
        let mut pruned = 0;

        for item in self.docs.iter() {
            let (key, bytes) = item?;
            let mut record = decode_record(&bytes)?;
            let dropped = tracker.trim(&mut record.history);
            if dropped == 0 {
                continue;
            }

            let encoded = serde_json::to_vec(&record)?;
            match self.docs.compare_and_swap(&key, Some(&bytes), Some(encoded))? {
                Ok(()) => pruned += dropped,
                Err(_) => debug!(id = %record.doc.id, "Record changed during compaction, skipped"),
            }
        }

        Ok(pruned)
    }

    pub fn flush(&self) -> StorageResult<()> {
        self.db.flush()?;
        Ok(())
    }
}

fn decode_record(bytes: &IVec) -> StorageResult<StoredRecord> {
    Ok(serde_json::from_slice(bytes)?)
}

fn decode_u64(bytes: Option<IVec>) -> StorageResult<u64> {
    match bytes {
        None => Ok(0),
        Some(bytes) => {
            let raw: [u8; 8] = bytes[..].try_into().map_err(|_| {
                BackendError::Corrupted(format!(
                    "expected 8-byte counter, found {} bytes",
                    bytes.len()
                ))
            })?;
            Ok(u64::from_be_bytes(raw))
        }
    }
}

/// Directory of database `name` under `data_dir`.
fn database_path(data_dir: &Path, name: &str) -> StorageResult<PathBuf> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c| c == '/' || c == '\\' || c == '\0');
    if !valid {
        return Err(StorageError::InvalidArgument(format!(
            "database name cannot be used as a directory: {:?}",
            name
        )));
    }
    Ok(data_dir.join(name))
}

/// Disk adapter instance bound to one database directory.
///
/// `destroy` flushes, releases the pool entry and drops this instance's
/// reference, so the last destroy closes sled and frees the directory lock.
pub struct DiskAdapter {
    name: String,
    key: String,
    db: RwLock<Option<Arc<DiskDatabase>>>,
    tracker: RevisionTracker,
}

impl DiskAdapter {
    pub fn descriptor() -> AdapterDescriptor {
        AdapterDescriptor::new(DISK_ADAPTER, |name: &str, options: &OpenOptions| {
            let adapter = DiskAdapter::open(name, options)?;
            Ok(Arc::new(adapter) as Arc<dyn BackendAdapter>)
        })
        .with_capability(Capability::Indexes)
        .with_capability(Capability::Persistent)
        .with_capability(Capability::SharedAcrossHandles)
    }

    pub fn open(name: &str, options: &OpenOptions) -> StorageResult<Self> {
        let data_dir = options.data_dir.as_deref().ok_or_else(|| {
            StorageError::InvalidArgument("the disk adapter requires a data_dir".to_string())
        })?;
        let path = database_path(data_dir, name)?;
        let key = path.to_string_lossy().into_owned();

        let db = OPEN_DATABASES.acquire(&key, || DiskDatabase::open(&path, options))?;

        Ok(Self {
            name: name.to_string(),
            key,
            db: RwLock::new(Some(db)),
            tracker: options.tracker(),
        })
    }

    fn database(&self) -> StorageResult<Arc<DiskDatabase>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| StorageError::HandleClosed(self.name.clone()))
    }
}

#[async_trait]
impl BackendAdapter for DiskAdapter {
    fn db_name(&self) -> &str {
        &self.name
    }

    async fn put(&self, doc: Document) -> StorageResult<Revision> {
        self.database()?.write(&self.tracker, WriteIntent::Put(doc))
    }

    async fn get(&self, id: &str) -> StorageResult<Option<Document>> {
        Ok(self.database()?.record(id)?.map(|record| record.doc))
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
        self.database()?.scan_live(limit)
    }

    async fn count_live(&self) -> StorageResult<u64> {
        self.database()?.count_live()
    }

    async fn update_seq(&self) -> StorageResult<u64> {
        self.database()?.update_seq()
    }

    async fn revision_history(&self, id: &str) -> StorageResult<Vec<Revision>> {
        let record = self
            .database()?
            .record(id)?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        Ok(record
            .revision()
            .into_iter()
            .chain(record.history.iter())
            .cloned()
            .collect())
    }

    async fn compact(&self) -> StorageResult<usize> {
        self.database()?.compact(&self.tracker)
    }

    async fn destroy(&self) -> StorageResult<()> {
        let taken = self.db.write().take();
        let db = match taken {
            Some(db) => db,
            None => return Ok(()),
        };
        if let Err(e) = db.flush() {
            warn!(db = %self.name, "Flush on destroy failed: {}", e);
        }
        if OPEN_DATABASES.release(&self.key).is_some() {
            info!(db = %self.name, "Disk database at {:?} closed", db.path);
        }
        drop(db);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn options(dir: &TempDir) -> OpenOptions {
        OpenOptions {
            data_dir: Some(dir.path().to_path_buf()),
            cache_size_mb: 8,
            flush_interval_ms: Some(100),
            ..OpenOptions::default()
        }
    }

    fn doc(id: &str, value: serde_json::Value) -> Document {
        Document::new(id, value.as_object().cloned().unwrap())
    }

    #[tokio::test]
    async fn test_requires_data_dir() {
        let err = DiskAdapter::open("db", &OpenOptions::default()).err().unwrap();
        assert!(matches!(err, StorageError::InvalidArgument(_)));

        let dir = TempDir::new().unwrap();
        assert!(DiskAdapter::open("../escape", &options(&dir)).is_err());
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let dir = TempDir::new().unwrap();
        let db = DiskAdapter::open("test", &options(&dir)).unwrap();

        let rev = db.put(doc("a", json!({"x": 1}))).await.unwrap();
        assert_eq!(rev.generation(), 1);
        assert_eq!(db.count_live().await.unwrap(), 1);

        let fetched = db.get("a").await.unwrap().unwrap();
        assert_eq!(fetched.field("x"), Some(&json!(1)));

        db.remove("a", Some(&rev)).await.unwrap();
        assert!(db.get("a").await.unwrap().unwrap().is_deleted());
        assert_eq!(db.count_live().await.unwrap(), 0);
        assert!(db.scan_live(10).await.unwrap().is_empty());
        assert_eq!(db.update_seq().await.unwrap(), 2);

        db.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_conflict_rolls_back() {
        let dir = TempDir::new().unwrap();
        let db = DiskAdapter::open("test", &options(&dir)).unwrap();

        db.put(Document::empty("a")).await.unwrap();
        let err = db.put(Document::empty("a")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(db.update_seq().await.unwrap(), 1);
        assert_eq!(db.count_live().await.unwrap(), 1);

        db.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_order_follows_updates() {
        let dir = TempDir::new().unwrap();
        let db = DiskAdapter::open("test", &options(&dir)).unwrap();

        let rev_a = db.put(Document::empty("a")).await.unwrap();
        db.put(Document::empty("b")).await.unwrap();
        db.put(Document::empty("_local/c")).await.unwrap();
        db.put(Document::empty("a").with_revision(rev_a)).await.unwrap();

        let ids: Vec<_> = db.scan_live(10).await.unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(db.count_live().await.unwrap(), 2);

        let ids: Vec<_> = db.scan_live(1).await.unwrap().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["b"]);

        db.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let dir = TempDir::new().unwrap();

        let db = DiskAdapter::open("persist", &options(&dir)).unwrap();
        for i in 0..5 {
            db.put(Document::empty(format!("doc{}", i))).await.unwrap();
        }
        db.create_index(IndexDefinition::new(["updatedAt"])).await.unwrap();
        db.destroy().await.unwrap();

        // The destroyed instance is still alive; its directory lock must be gone
        let reopened = DiskAdapter::open("persist", &options(&dir)).unwrap();
        assert!(matches!(db.get("doc0").await, Err(StorageError::HandleClosed(_))));
        let db = reopened;
        assert_eq!(db.count_live().await.unwrap(), 5);
        assert_eq!(db.update_seq().await.unwrap(), 5);
        assert_eq!(
            db.create_index(IndexDefinition::new(["updatedAt"])).await.unwrap(),
            IndexOutcome::Exists
        );
        db.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_instances_share_database() {
        let dir = TempDir::new().unwrap();
        let first = DiskAdapter::open("shared", &options(&dir)).unwrap();
        let second = DiskAdapter::open("shared", &options(&dir)).unwrap();

        first.put(Document::empty("_local/foobar")).await.unwrap();
        assert!(second.get("_local/foobar").await.unwrap().is_some());
        assert_eq!(second.count_live().await.unwrap(), 0);

        first.destroy().await.unwrap();
        assert!(matches!(first.count_live().await, Err(StorageError::HandleClosed(_))));
        assert!(second.get("_local/foobar").await.unwrap().is_some());
        second.destroy().await.unwrap();
        first.destroy().await.unwrap();
    }

    #[tokio::test]
    async fn test_compact_trims_history() {
        let dir = TempDir::new().unwrap();
        let db = DiskAdapter::open("compact", &options(&dir).with_revs_limit(1)).unwrap();

        let mut rev = db.put(Document::empty("a")).await.unwrap();
        for _ in 0..4 {
            rev = db.put(Document::empty("a").with_revision(rev)).await.unwrap();
        }
        assert_eq!(db.revision_history("a").await.unwrap().len(), 5);

        assert_eq!(db.compact().await.unwrap(), 4);
        assert_eq!(db.revision_history("a").await.unwrap(), vec![rev]);
        assert_eq!(db.compact().await.unwrap(), 0);

        db.destroy().await.unwrap();
    }
}
