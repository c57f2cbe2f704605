//! Reference-counted pool of physical databases.
//!
//! Engines open one physical database per key (name or path) and hand the
//! same `Arc` to every adapter instance bound to it. The entry is dropped
//! when the last instance releases it.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

use crate::storage::StorageResult;

struct PoolEntry<T> {
    value: Arc<T>,
    handles: usize,
}

pub(crate) struct SharedPool<T> {
    entries: DashMap<String, PoolEntry<T>>,
}

impl<T> SharedPool<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Returns the database under `key`, opening it with `open` if absent.
    pub(crate) fn acquire<F>(&self, key: &str, open: F) -> StorageResult<Arc<T>>
    where
        F: FnOnce() -> StorageResult<T>,
    {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.handles += 1;
                Ok(entry.value.clone())
            }
            Entry::Vacant(slot) => {
                let value = Arc::new(open()?);
                slot.insert(PoolEntry {
                    value: value.clone(),
                    handles: 1,
                });
                Ok(value)
            }
        }
    }

    /// Releases one instance. Returns the database if this was the last one.
    pub(crate) fn release(&self, key: &str) -> Option<Arc<T>> {
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                entry.handles = entry.handles.saturating_sub(1);
                if entry.handles == 0 {
                    Some(slot.remove().value)
                } else {
                    None
                }
            }
            Entry::Vacant(_) => None,
        }
    }

    #[cfg(test)]
    pub(crate) fn handles(&self, key: &str) -> usize {
        self.entries.get(key).map_or(0, |entry| entry.handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_shares_and_release_drops() {
        let pool: SharedPool<u32> = SharedPool::new();
        let a = pool.acquire("db", || Ok(7)).unwrap();
        let b = pool.acquire("db", || Ok(9)).unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*b, 7);
        assert_eq!(pool.handles("db"), 2);

        assert!(pool.release("db").is_none());
        assert_eq!(pool.release("db").map(|v| *v), Some(7));
        assert_eq!(pool.handles("db"), 0);
        assert!(pool.release("db").is_none());
    }

    #[test]
    fn test_failed_open_leaves_no_entry() {
        let pool: SharedPool<u32> = SharedPool::new();
        let err = pool.acquire("db", || {
            Err(crate::storage::StorageError::InvalidArgument("nope".into()))
        });
        assert!(err.is_err());
        assert_eq!(pool.handles("db"), 0);
    }
}
