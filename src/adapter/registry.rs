//! Adapter registry: name → descriptor.
//!
//! The registry is an explicit object. Applications create one (or use the
//! process-wide [`AdapterRegistry::global`] instance), register the adapters
//! they need and pass it to [`StorageHandle::open`](crate::StorageHandle::open).
//! Nothing is registered implicitly.
//!
//! Lookups go through a DashMap, so concurrent `resolve` calls never contend
//! on a caller-visible lock; registration is rare and takes a shard lock.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use tracing::{debug, info};

use crate::adapter::AdapterDescriptor;
use crate::storage::{StorageError, StorageResult};

static GLOBAL: Lazy<AdapterRegistry> = Lazy::new(AdapterRegistry::new);

/// Mapping from adapter name to descriptor.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: DashMap<String, AdapterDescriptor>,
}

impl AdapterRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry. Empty until adapters are registered.
    pub fn global() -> &'static AdapterRegistry {
        &GLOBAL
    }

    /// Registers an adapter. Fails if the name is taken.
    pub fn register(&self, descriptor: AdapterDescriptor) -> StorageResult<()> {
        match self.adapters.entry(descriptor.name.clone()) {
            Entry::Occupied(_) => Err(StorageError::DuplicateAdapter(descriptor.name)),
            Entry::Vacant(slot) => {
                info!(adapter = %descriptor.name, "Adapter registered");
                slot.insert(descriptor);
                Ok(())
            }
        }
    }

    /// Registers an adapter, replacing any previous one with the same name.
    /// Returns the replaced descriptor.
    pub fn register_or_replace(&self, descriptor: AdapterDescriptor) -> Option<AdapterDescriptor> {
        let name = descriptor.name.clone();
        let previous = self.adapters.insert(name.clone(), descriptor);
        if previous.is_some() {
            info!(adapter = %name, "Adapter replaced");
        } else {
            info!(adapter = %name, "Adapter registered");
        }
        previous
    }

    /// Looks up an adapter by name.
    pub fn resolve(&self, name: &str) -> StorageResult<AdapterDescriptor> {
        self.adapters
            .get(name)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| StorageError::AdapterNotRegistered(name.to_string()))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// Removes an adapter. Handles already opened through it stay usable.
    pub fn unregister(&self, name: &str) -> Option<AdapterDescriptor> {
        let removed = self.adapters.remove(name).map(|(_, descriptor)| descriptor);
        if removed.is_some() {
            debug!(adapter = name, "Adapter unregistered");
        }
        removed
    }

    /// Registered adapter names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Removes every adapter.
    pub fn clear(&self) {
        self.adapters.clear();
        debug!("Adapter registry cleared");
    }
}
