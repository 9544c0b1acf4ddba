//! Named cache store registry.
//!
//! Built once by the application and handed to whatever needs a store; there
//! is no process-global registry.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use super::config::CacheConfig;
use super::store::{CacheStore, MemoryStore, StoreError};

/// Name under which [`MemoryStore`] is registered by [`StoreRegistry::from_config`].
pub const MEMORY_BACKEND: &str = "memory";

/// A set of named [`CacheStore`] backends with one active selection.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use rttp_cache::cache::{MemoryStore, StoreRegistry};
///
/// let mut registry = StoreRegistry::new("memory", Arc::new(MemoryStore::new()));
/// registry.register("sessions", Arc::new(MemoryStore::new()));
/// registry.set_active("sessions").unwrap();
/// assert_eq!(registry.active_name(), "sessions");
/// assert!(registry.get("nope").is_err());
/// ```
#[derive(Clone)]
pub struct StoreRegistry {
    stores: HashMap<String, Arc<dyn CacheStore>>,
    active: String,
    active_store: Arc<dyn CacheStore>,
}

impl StoreRegistry {
    /// Creates a registry whose first store is also the active one.
    pub fn new(name: impl Into<String>, store: Arc<dyn CacheStore>) -> Self {
        let name = name.into();
        let mut stores = HashMap::new();
        stores.insert(name.clone(), Arc::clone(&store));
        Self {
            stores,
            active: name,
            active_store: store,
        }
    }

    /// Registers the built-in backends and activates `config.backend`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::UnknownStore`] if the configured backend is not built in.
    pub fn from_config(config: &CacheConfig) -> Result<Self, StoreError> {
        let mut registry = Self::new(MEMORY_BACKEND, Arc::new(MemoryStore::new()));
        registry.set_active(&config.backend)?;
        info!(backend = %registry.active, "cache store selected");
        Ok(registry)
    }

    /// Adds or replaces a named store, returning the previous one.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        store: Arc<dyn CacheStore>,
    ) -> Option<Arc<dyn CacheStore>> {
        let name = name.into();
        if name == self.active {
            self.active_store = Arc::clone(&store);
        }
        self.stores.insert(name, store)
    }

    /// Looks up a store by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn CacheStore>, StoreError> {
        self.stores
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownStore(name.to_owned()))
    }

    /// Switches the active store.
    pub fn set_active(&mut self, name: &str) -> Result<(), StoreError> {
        self.active_store = self.get(name)?;
        self.active = name.to_owned();
        Ok(())
    }

    pub fn active_name(&self) -> &str {
        &self.active
    }

    /// The active store.
    pub fn active(&self) -> Arc<dyn CacheStore> {
        Arc::clone(&self.active_store)
    }

    /// Registered store names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.stores.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
