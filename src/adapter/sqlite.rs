//! SQLite engine.
//!
//! # Responsibility
//! - Store documents as rows of a `docs` table, one row per id.
//! - Keep the live set queryable through a partial index on `seq` restricted
//!   to live non-local rows.
//! - Turn index declarations into real expression indexes over the JSON body.
//!
//! # Invariants
//! - Every write runs in an IMMEDIATE transaction, so the revision check and
//!   the row update cannot interleave with another writer.
//! - `meta.update_seq` equals the highest `docs.seq`.
//!
//! A database without `data_dir` lives in memory and is shared by every
//! adapter instance opened through the same descriptor under the same name.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::adapter::shared::SharedPool;
use crate::adapter::{AdapterDescriptor, BackendAdapter, Capability, OpenOptions};
use crate::storage::{
    BackendError, DocState, Document, IndexDefinition, IndexOutcome, Revision, RevisionTracker,
    StorageError, StorageResult, StoredRecord, WriteIntent,
};

pub const SQLITE_ADAPTER: &str = "sqlite";

const SCHEMA_VERSION: u32 = 1;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS docs (
    id         TEXT PRIMARY KEY NOT NULL,
    seq        INTEGER NOT NULL,
    generation INTEGER NOT NULL,
    hash       TEXT NOT NULL,
    deleted    INTEGER NOT NULL,
    local      INTEGER NOT NULL,
    body       TEXT NOT NULL,
    history    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS docs_live_by_seq ON docs(seq) WHERE deleted = 0 AND local = 0;
CREATE TABLE IF NOT EXISTS meta (
    key   TEXT PRIMARY KEY NOT NULL,
    value INTEGER NOT NULL
);
INSERT OR IGNORE INTO meta (key, value) VALUES ('update_seq', 0);
CREATE TABLE IF NOT EXISTS indexes (
    name   TEXT PRIMARY KEY NOT NULL,
    fields TEXT NOT NULL
);
";

const SELECT_RECORD: &str =
    "SELECT id, seq, generation, hash, deleted, body, history FROM docs";

/// Where a SQLite database lives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Location {
    File(PathBuf),
    Memory(String),
}

impl Location {
    fn key(&self) -> String {
        match self {
            Location::File(path) => format!("file:{}", path.display()),
            Location::Memory(name) => format!("memory:{}", name),
        }
    }
}

/// One physical SQLite database behind a single connection.
pub struct SqliteDatabase {
    conn: Mutex<Connection>,
    location: Location,
}

impl SqliteDatabase {
    pub fn open(location: Location) -> StorageResult<Self> {
        let started_at = Instant::now();
        debug!(location = ?location, "Opening SQLite database");

        let conn = match &location {
            Location::File(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                Connection::open(path)
            }
            Location::Memory(_) => Connection::open_in_memory(),
        };

        let mut conn = conn.map_err(|err| {
            error!(location = ?location, error = %err, "SQLite open failed");
            StorageError::from(err)
        })?;
        bootstrap_connection(&mut conn)?;

        info!(
            location = ?location,
            duration_ms = started_at.elapsed().as_millis() as u64,
            "SQLite database opened"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            location,
        })
    }

    /// Validates and applies one write in an IMMEDIATE transaction.
    pub fn write(
        &self,
        tracker: &RevisionTracker,
        intent: WriteIntent,
    ) -> StorageResult<Revision> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = load_record(&tx, intent.id())?;
        let seq = read_update_seq(&tx)? + 1;
        let record = tracker.apply(current.as_ref(), intent, seq)?;
        let revision = record.revision().cloned().ok_or_else(|| {
            BackendError::Corrupted(format!("record {} has no revision", record.doc.id))
        })?;

        tx.execute(
            "INSERT OR REPLACE INTO docs (id, seq, generation, hash, deleted, local, body, history)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                record.doc.id,
                seq as i64,
                revision.generation() as i64,
                revision.hash(),
                record.doc.is_deleted(),
                record.doc.is_local(),
                serde_json::to_string(&record.doc.body)?,
                serde_json::to_string(&record.history)?,
            ],
        )?;
        tx.execute(
            "UPDATE meta SET value = ?1 WHERE key = 'update_seq'",
            params![seq as i64],
        )?;
        tx.commit()?;

        debug!(
            id = %record.doc.id,
            seq,
            rev = %revision,
            deleted = record.doc.is_deleted(),
            "Document written"
        );
        Ok(revision)
    }

    pub fn record(&self, id: &str) -> StorageResult<Option<StoredRecord>> {
        let conn = self.conn.lock();
        load_record(&conn, id)
    }

    pub fn scan_live(&self, limit: usize) -> StorageResult<Vec<Document>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{} WHERE deleted = 0 AND local = 0 ORDER BY seq LIMIT ?1",
            SELECT_RECORD
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![limit], RawRecord::from_row)?;

        let mut docs = Vec::new();
        for row in rows {
            docs.push(row?.into_record()?.doc);
        }
        Ok(docs)
    }

    pub fn count_live(&self) -> StorageResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM docs WHERE deleted = 0 AND local = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    pub fn update_seq(&self) -> StorageResult<u64> {
        let conn = self.conn.lock();
        read_update_seq(&conn)
    }

    /// Records the declaration and builds an expression index over the
    /// declared body fields.
    pub fn declare_index(&self, index: IndexDefinition) -> StorageResult<IndexOutcome> {
        index.validate()?;

        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = {
            let mut stmt = tx.prepare("SELECT name, fields FROM indexes")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let mut existing = Vec::new();
            for row in rows {
                let (name, fields) = row?;
                let fields: Vec<String> = serde_json::from_str(&fields)?;
                existing.push(IndexDefinition { name: Some(name), fields });
            }
            existing
        };

        if existing.iter().any(|other| other.is_equivalent(&index)) {
            return Ok(IndexOutcome::Exists);
        }

        let name = index.resolved_name();
        if existing.iter().any(|other| other.resolved_name() == name) {
            return Err(StorageError::InvalidArgument(format!(
                "index name {} is already used for other fields",
                name
            )));
        }

        tx.execute(
            "INSERT INTO indexes (name, fields) VALUES (?1, ?2)",
            params![name, serde_json::to_string(&index.fields)?],
        )?;
        tx.execute_batch(&index_ddl(&name, &index.fields))?;
        tx.commit()?;

        debug!(index = %name, "Index declared");
        Ok(IndexOutcome::Created)
    }

    pub fn compact(&self, tracker: &RevisionTracker) -> StorageResult<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let histories = {
            let mut stmt = tx.prepare("SELECT id, history FROM docs")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut pruned = 0;
        for (id, history) in histories {
            let mut history: Vec<Revision> = serde_json::from_str(&history)?;
            let dropped = tracker.trim(&mut history);
            if dropped > 0 {
                tx.execute(
                    "UPDATE docs SET history = ?1 WHERE id = ?2",
                    params![serde_json::to_string(&history)?, id],
                )?;
                pruned += dropped;
            }
        }

        tx.commit()?;
        Ok(pruned)
    }

    #[cfg(test)]
    fn sql_index_names(&self) -> StorageResult<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'index' AND tbl_name = 'docs' ORDER BY name",
        )?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

fn bootstrap_connection(conn: &mut Connection) -> StorageResult<()> {
    conn.busy_timeout(Duration::from_secs(5))?;

    let version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if version > SCHEMA_VERSION {
        return Err(BackendError::Corrupted(format!(
            "schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        ))
        .into());
    }
    if version < SCHEMA_VERSION {
        let tx = conn.transaction()?;
        tx.execute_batch(SCHEMA)?;
        tx.execute_batch(&format!("PRAGMA user_version = {};", SCHEMA_VERSION))?;
        tx.commit()?;
    }
    Ok(())
}

fn read_update_seq(conn: &Connection) -> StorageResult<u64> {
    let seq: i64 = conn.query_row(
        "SELECT value FROM meta WHERE key = 'update_seq'",
        [],
        |row| row.get(0),
    )?;
    Ok(seq as u64)
}

fn load_record(conn: &Connection, id: &str) -> StorageResult<Option<StoredRecord>> {
    conn.query_row(
        &format!("{} WHERE id = ?1", SELECT_RECORD),
        params![id],
        RawRecord::from_row,
    )
    .optional()?
    .map(RawRecord::into_record)
    .transpose()
}

/// `CREATE INDEX` over `json_extract` of each declared field.
fn index_ddl(name: &str, fields: &[String]) -> String {
    let columns: Vec<String> = fields
        .iter()
        .map(|field| {
            let path: Vec<String> = field.split('.').map(|part| format!("\"{}\"", part)).collect();
            format!("json_extract(body, '$.{}')", path.join("."))
        })
        .collect();
    format!(
        "CREATE INDEX IF NOT EXISTS \"docs_{}\" ON docs ({});",
        name,
        columns.join(", ")
    )
}

/// A `docs` row before JSON decoding.
struct RawRecord {
    id: String,
    seq: i64,
    generation: i64,
    hash: String,
    deleted: bool,
    body: String,
    history: String,
}

impl RawRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            seq: row.get(1)?,
            generation: row.get(2)?,
            hash: row.get(3)?,
            deleted: row.get(4)?,
            body: row.get(5)?,
            history: row.get(6)?,
        })
    }

    fn into_record(self) -> StorageResult<StoredRecord> {
        let body: Map<String, Value> = serde_json::from_str(&self.body)?;
        let history: Vec<Revision> = serde_json::from_str(&self.history)?;
        let state = if self.deleted {
            DocState::Tombstone
        } else {
            DocState::Live
        };

        Ok(StoredRecord {
            doc: Document {
                id: self.id,
                revision: Some(Revision::new(self.generation as u64, self.hash)),
                state,
                body,
            },
            seq: self.seq as u64,
            history,
        })
    }
}

fn database_file(data_dir: &Path, name: &str) -> StorageResult<PathBuf> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(|c| c == '/' || c == '\\' || c == '\0');
    if !valid {
        return Err(StorageError::InvalidArgument(format!(
            "database name cannot be used as a file name: {:?}",
            name
        )));
    }
    Ok(data_dir.join(format!("{}.sqlite", name)))
}

/// SQLite adapter instance bound to one database. The connection closes
/// when the last instance bound to it is destroyed.
pub struct SqliteAdapter {
    name: String,
    key: String,
    db: RwLock<Option<Arc<SqliteDatabase>>>,
    tracker: RevisionTracker,
    pool: Arc<SharedPool<SqliteDatabase>>,
}

impl SqliteAdapter {
    pub fn descriptor() -> AdapterDescriptor {
        let pool = Arc::new(SharedPool::new());
        AdapterDescriptor::new(SQLITE_ADAPTER, move |name: &str, options: &OpenOptions| {
            let adapter = SqliteAdapter::open(pool.clone(), name, options)?;
            Ok(Arc::new(adapter) as Arc<dyn BackendAdapter>)
        })
        .with_capability(Capability::Indexes)
        .with_capability(Capability::Persistent)
        .with_capability(Capability::SharedAcrossHandles)
    }

    fn open(
        pool: Arc<SharedPool<SqliteDatabase>>,
        name: &str,
        options: &OpenOptions,
    ) -> StorageResult<Self> {
        let location = match &options.data_dir {
            Some(dir) => Location::File(database_file(dir, name)?),
            None => Location::Memory(name.to_string()),
        };
        let key = location.key();
        let db = pool.acquire(&key, || SqliteDatabase::open(location))?;

        Ok(Self {
            name: name.to_string(),
            key,
            db: RwLock::new(Some(db)),
            tracker: options.tracker(),
            pool,
        })
    }

    fn database(&self) -> StorageResult<Arc<SqliteDatabase>> {
        self.db
            .read()
            .clone()
            .ok_or_else(|| StorageError::HandleClosed(self.name.clone()))
    }
}

#[async_trait]
impl BackendAdapter for SqliteAdapter {
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
        if self.pool.release(&self.key).is_some() {
            info!(db = %self.name, location = ?db.location, "SQLite database closed");
        }
        drop(db);
        Ok(())
    }
}
