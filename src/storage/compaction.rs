//! Background compaction worker for a document database.
//!
//! Compaction drops ancestor revisions beyond the database's `revs_limit` and
//! forgets closed lifecycles in the deletion index. It never touches current
//! revisions and never purges tombstones.
//!
//! Compaction modes:
//! - Periodic: compact every N seconds until the handle is destroyed
//! - Once: compact a single time and exit

use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::handle::StorageHandle;
use crate::storage::StorageError;

/// Compaction strategy.
#[derive(Clone, Debug)]
pub enum CompactionMode {
    /// Compact at a fixed interval
    Periodic(Duration),

    /// Compact once and exit
    Once,
}

/// Background compactor bound to one handle.
pub struct Compactor {
    handle: Arc<StorageHandle>,
    mode: CompactionMode,
}

impl Compactor {
    pub fn new(handle: Arc<StorageHandle>, mode: CompactionMode) -> Self {
        Self { handle, mode }
    }

    /// Spawns the compaction task.
    ///
    /// Periodic tasks stop on their own once the handle is destroyed; the
    /// returned JoinHandle may also be aborted.
    pub fn run(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match self.mode.clone() {
                CompactionMode::Periodic(period) => self.run_periodic(period).await,
                CompactionMode::Once => {
                    self.compact_now().await;
                }
            }
        })
    }

    async fn run_periodic(&self, period: Duration) {
        let mut ticker = interval(period);

        info!(db = %self.handle.name(), ?period, "Starting periodic compactor");

        loop {
            ticker.tick().await;

            match self.handle.compact().await {
                Ok(0) => debug!(db = %self.handle.name(), "Periodic compaction: nothing to prune"),
                Ok(pruned) => {
                    info!(db = %self.handle.name(), pruned, "Periodic compaction completed")
                }
                Err(StorageError::HandleClosed(_)) => {
                    info!(db = %self.handle.name(), "Handle closed, stopping compactor");
                    return;
                }
                Err(e) => warn!(db = %self.handle.name(), "Periodic compaction failed: {}", e),
            }
        }
    }

    /// Runs one compaction pass immediately. Returns the number of ancestor
    /// revisions pruned, or 0 if the pass failed.
    pub async fn compact_now(&self) -> usize {
        match self.handle.compact().await {
            Ok(pruned) => {
                info!(db = %self.handle.name(), pruned, "Manual compaction completed");
                pruned
            }
            Err(e) => {
                warn!(db = %self.handle.name(), "Manual compaction failed: {}", e);
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterRegistry, MemoryAdapter, OpenOptions};
    use crate::storage::Document;

    async fn open(revs_limit: usize) -> Arc<StorageHandle> {
        let registry = AdapterRegistry::new();
        registry.register(MemoryAdapter::descriptor()).unwrap();
        let options = OpenOptions::default().with_revs_limit(revs_limit);
        Arc::new(StorageHandle::open(&registry, "compaction", "memory", options).unwrap())
    }

    async fn rewrite(handle: &StorageHandle, id: &str, times: usize) {
        let mut rev = handle.put(Document::empty(id)).await.unwrap();
        for _ in 0..times {
            rev = handle.put(Document::empty(id).with_revision(rev)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_compact_now() {
        let handle = open(2).await;
        rewrite(&handle, "a", 4).await;
        assert_eq!(handle.revision_history("a").await.unwrap().len(), 5);

        let compactor = Compactor::new(handle.clone(), CompactionMode::Once);
        assert_eq!(compactor.compact_now().await, 3);

        let history = handle.revision_history("a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].generation(), 5);
    }

    #[tokio::test]
    async fn test_one_shot_task_completes() {
        let handle = open(1).await;
        rewrite(&handle, "a", 2).await;

        Compactor::new(handle.clone(), CompactionMode::Once)
            .run()
            .await
            .unwrap();

        assert_eq!(handle.revision_history("a").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_periodic_stops_after_destroy() {
        let handle = open(1).await;
        rewrite(&handle, "a", 3).await;

        let mode = CompactionMode::Periodic(Duration::from_millis(10));
        let task = Compactor::new(handle.clone(), mode).run();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.revision_history("a").await.unwrap().len(), 1);

        handle.destroy().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("compactor did not stop")
            .unwrap();
    }
}
