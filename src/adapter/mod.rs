//! Backend adapter contract and the shipped engines.
//!
//! An adapter is registered under a name as an [`AdapterDescriptor`]: a factory
//! plus the set of capabilities it declares. Opening a database resolves the
//! descriptor, checks its environment restriction and asks the factory for a
//! [`BackendAdapter`] bound to that database name.
//!
//! Shipped engines:
//! - `memory`: in-process maps, shared per database name
//! - `disk`: log-structured sled database under `data_dir`
//! - `sqlite`: SQL tables in a SQLite file (or in memory without `data_dir`)
//! - `localstorage`: browser-local store, restricted to the browser environment
//!
//! Engines keep one shared physical database per name or path, so two handles
//! opened against the same database observe each other's writes.

pub mod browser;
pub mod disk;
pub mod memory;
pub mod registry;
mod shared;
pub mod sqlite;

pub use browser::LocalStorageAdapter;
pub use disk::DiskAdapter;
pub use memory::MemoryAdapter;
pub use registry::AdapterRegistry;
pub use sqlite::SqliteAdapter;

use async_trait::async_trait;
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::storage::{
    Document, IndexDefinition, IndexOutcome, Revision, RevisionTracker, StorageResult,
    DEFAULT_REVS_LIMIT,
};

/// Runtime environment an adapter may be restricted to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Environment {
    /// Native process (server, desktop, CLI).
    Native,
    /// Browser with web storage APIs.
    Browser,
}

impl Environment {
    /// The environment this build targets.
    pub fn current() -> Self {
        if cfg!(target_arch = "wasm32") {
            Environment::Browser
        } else {
            Environment::Native
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Native => "native",
            Environment::Browser => "browser",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capabilities an adapter declares on its descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Accepts secondary index declarations.
    Indexes,
    /// Survives process restarts.
    Persistent,
    /// Handles opened on the same database share one physical store.
    SharedAcrossHandles,
    /// Only usable in the given environment.
    RestrictedTo(Environment),
}

/// Options for opening a database.
#[derive(Clone, Debug)]
pub struct OpenOptions {
    /// Directory for persistent engines. SQLite runs in memory without it;
    /// the disk engine requires it.
    pub data_dir: Option<PathBuf>,

    /// Page cache size for the disk engine, in megabytes.
    pub cache_size_mb: u64,

    /// How often the disk engine flushes dirty pages (None disables
    /// periodic flushing).
    pub flush_interval_ms: Option<u64>,

    /// Revisions (current included) kept per document.
    pub revs_limit: usize,

    /// Trim revision histories on every write instead of on `compact`.
    pub auto_compaction: bool,

    /// Environment the caller runs in; checked against adapter restrictions.
    pub environment: Environment,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache_size_mb: 64,
            flush_interval_ms: Some(1000),
            revs_limit: DEFAULT_REVS_LIMIT,
            auto_compaction: false,
            environment: Environment::current(),
        }
    }
}

impl OpenOptions {
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_revs_limit(mut self, revs_limit: usize) -> Self {
        self.revs_limit = revs_limit;
        self
    }

    pub fn with_auto_compaction(mut self, enabled: bool) -> Self {
        self.auto_compaction = enabled;
        self
    }

    pub fn with_environment(mut self, environment: Environment) -> Self {
        self.environment = environment;
        self
    }

    /// Revision tracker configured from these options.
    pub fn tracker(&self) -> RevisionTracker {
        RevisionTracker::new(self.revs_limit, self.auto_compaction)
    }
}

/// Builds an adapter bound to the given database name.
pub type AdapterFactory =
    Arc<dyn Fn(&str, &OpenOptions) -> StorageResult<Arc<dyn BackendAdapter>> + Send + Sync>;

/// A registered adapter: name, factory and declared capabilities.
#[derive(Clone)]
pub struct AdapterDescriptor {
    pub name: String,
    pub factory: AdapterFactory,
    pub capabilities: HashSet<Capability>,
}

impl AdapterDescriptor {
    pub fn new<F>(name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&str, &OpenOptions) -> StorageResult<Arc<dyn BackendAdapter>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            factory: Arc::new(factory),
            capabilities: HashSet::new(),
        }
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capabilities.insert(capability);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Environment restriction, if the adapter declares one.
    pub fn restricted_to(&self) -> Option<Environment> {
        self.capabilities.iter().find_map(|cap| match cap {
            Capability::RestrictedTo(env) => Some(*env),
            _ => None,
        })
    }

    /// True if the adapter may be opened in `environment`.
    pub fn runs_in(&self, environment: Environment) -> bool {
        self.restricted_to().map_or(true, |env| env == environment)
    }

    /// Instantiates the adapter for database `name`.
    pub fn instantiate(
        &self,
        name: &str,
        options: &OpenOptions,
    ) -> StorageResult<Arc<dyn BackendAdapter>> {
        (self.factory)(name, options)
    }
}

impl fmt::Debug for AdapterDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterDescriptor")
            .field("name", &self.name)
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

/// The raw document operations an engine must provide.
///
/// Implementations must apply [`RevisionTracker`] atomically per id, keep
/// tombstones and local documents out of `scan_live` and `count_live`, and
/// never cache state privately per instance: two adapters bound to the same
/// physical database must observe each other's writes.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Name of the database this adapter is bound to.
    fn db_name(&self) -> &str;

    /// Inserts or updates a live document, returning its new revision.
    async fn put(&self, doc: Document) -> StorageResult<Revision>;

    /// Returns the latest state of `id`, tombstones included.
    async fn get(&self, id: &str) -> StorageResult<Option<Document>>;

    /// Converts `id` into a tombstone if `revision` is current.
    async fn remove(&self, id: &str, revision: Option<&Revision>) -> StorageResult<Revision>;

    /// Writes documents independently; one failure does not affect the rest.
    async fn bulk_put(&self, docs: Vec<Document>) -> Vec<StorageResult<Revision>> {
        let mut results = Vec::with_capacity(docs.len());
        for doc in docs {
            let result = if doc.is_deleted() {
                self.remove(&doc.id, doc.revision.as_ref()).await
            } else {
                self.put(doc).await
            };
            results.push(result);
        }
        results
    }

    /// Declares an index. Re-declaring an equivalent index is a no-op.
    async fn create_index(&self, index: IndexDefinition) -> StorageResult<IndexOutcome>;

    /// Up to `limit` live, non-local documents in update-sequence order.
    async fn scan_live(&self, limit: usize) -> StorageResult<Vec<Document>>;

    /// Number of live, non-local documents.
    async fn count_live(&self) -> StorageResult<u64>;

    /// Sequence number of the most recent write.
    async fn update_seq(&self) -> StorageResult<u64>;

    /// Current revision followed by retained ancestors, newest first.
    async fn revision_history(&self, id: &str) -> StorageResult<Vec<Revision>>;

    /// Trims revision histories to the configured limit. Returns the number
    /// of ancestor revisions dropped.
    async fn compact(&self) -> StorageResult<usize>;

    /// Drops this instance's reference to its physical database. Repeat
    /// calls are no-ops; every other call afterwards fails with
    /// `HandleClosed`.
    async fn destroy(&self) -> StorageResult<()>;
}

/// Descriptors for every shipped adapter, for explicit registration.
pub fn builtin_descriptors() -> Vec<AdapterDescriptor> {
    vec![
        MemoryAdapter::descriptor(),
        DiskAdapter::descriptor(),
        SqliteAdapter::descriptor(),
        LocalStorageAdapter::descriptor(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_gate() {
        let browser_only = LocalStorageAdapter::descriptor();
        assert_eq!(browser_only.restricted_to(), Some(Environment::Browser));
        assert!(browser_only.runs_in(Environment::Browser));
        assert!(!browser_only.runs_in(Environment::Native));

        let memory = MemoryAdapter::descriptor();
        assert_eq!(memory.restricted_to(), None);
        assert!(memory.runs_in(Environment::Native));
        assert!(memory.runs_in(Environment::Browser));
    }

    #[test]
    fn test_builtin_capabilities() {
        let names: Vec<_> = builtin_descriptors().into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["memory", "disk", "sqlite", "localstorage"]);

        assert!(DiskAdapter::descriptor().supports(Capability::Persistent));
        assert!(SqliteAdapter::descriptor().supports(Capability::Indexes));
        assert!(!LocalStorageAdapter::descriptor().supports(Capability::Indexes));
    }

    #[test]
    fn test_default_options() {
        let options = OpenOptions::default();
        assert_eq!(options.environment, Environment::Native);
        assert_eq!(options.revs_limit, DEFAULT_REVS_LIMIT);
        assert!(options.data_dir.is_none());

        let options = options.with_revs_limit(1).with_auto_compaction(true);
        assert_eq!(options.tracker().revs_limit(), 1);
    }
}
