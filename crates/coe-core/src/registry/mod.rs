//! Plugin-based component registry
//!
//! Maps configuration type names to factories for datastores, event sources
//! and checkpoint stores, so the daemon can build its collaborators from a
//! [`CoeConfig`](crate::config::CoeConfig) without hardcoded match arms.
//!
//! ## Registration
//!
//! Backend crates expose a `register` function:
//!
//! ```rust,ignore
//! // In coe-datastore-restconf
//! pub fn register(registry: &ComponentRegistry) {
//!     registry.register_datastore("restconf", Box::new(RestconfDatastoreFactory));
//! }
//! ```

use crate::checkpoint::{FileCheckpointStoreFactory, MemoryCheckpointStoreFactory};
use crate::config::{CheckpointConfig, DatastoreConfig, EventSourceConfig};
use crate::datastore::MemoryDatastoreFactory;
use crate::error::{Error, Result};
use crate::source::MemoryEventSourceFactory;
use crate::traits::{
    CheckpointStore, CheckpointStoreFactory, Datastore, DatastoreFactory, EventSource,
    EventSourceFactory,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Registry of backend factories
///
/// ## Thread Safety
///
/// Interior mutability with RwLock: concurrent lookups, exclusive
/// registration.
#[derive(Default)]
pub struct ComponentRegistry {
    datastores: RwLock<HashMap<String, Box<dyn DatastoreFactory>>>,
    event_sources: RwLock<HashMap<String, Box<dyn EventSourceFactory>>>,
    checkpoint_stores: RwLock<HashMap<String, Arc<dyn CheckpointStoreFactory>>>,
}

impl ComponentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the in-process backends registered
    ///
    /// - datastore: `memory`
    /// - event source: `memory`
    /// - checkpoint store: `memory`, `file`
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_datastore("memory", Box::new(MemoryDatastoreFactory));
        registry.register_event_source("memory", Box::new(MemoryEventSourceFactory));
        registry.register_checkpoint_store("memory", Box::new(MemoryCheckpointStoreFactory));
        registry.register_checkpoint_store("file", Box::new(FileCheckpointStoreFactory));
        registry
    }

    pub fn register_datastore(&self, name: impl Into<String>, factory: Box<dyn DatastoreFactory>) {
        self.datastores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), factory);
    }

    pub fn register_event_source(
        &self,
        name: impl Into<String>,
        factory: Box<dyn EventSourceFactory>,
    ) {
        self.event_sources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), factory);
    }

    pub fn register_checkpoint_store(
        &self,
        name: impl Into<String>,
        factory: Box<dyn CheckpointStoreFactory>,
    ) {
        self.checkpoint_stores
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), Arc::from(factory));
    }

    /// Create a datastore from configuration
    ///
    /// # Errors
    ///
    /// `Error::FatalConfig` if the type is not registered, or whatever the
    /// factory reports.
    pub fn create_datastore(&self, config: &DatastoreConfig) -> Result<Arc<dyn Datastore>> {
        let type_name = config.type_name();
        let datastores = self.datastores.read().unwrap_or_else(PoisonError::into_inner);

        let factory = datastores
            .get(type_name)
            .ok_or_else(|| Error::config(format!("Unknown datastore type: {}", type_name)))?;

        factory.create(config)
    }

    /// Create an event source from configuration
    pub fn create_event_source(&self, config: &EventSourceConfig) -> Result<Arc<dyn EventSource>> {
        let type_name = config.type_name();
        let sources = self.event_sources.read().unwrap_or_else(PoisonError::into_inner);

        let factory = sources
            .get(type_name)
            .ok_or_else(|| Error::config(format!("Unknown event source type: {}", type_name)))?;

        factory.create(config)
    }

    /// Create a checkpoint store from configuration
    pub async fn create_checkpoint_store(
        &self,
        config: &CheckpointConfig,
    ) -> Result<Arc<dyn CheckpointStore>> {
        let type_name = config.type_name();

        // Release the lock before calling async create
        let factory = self
            .checkpoint_stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(type_name)
            .cloned()
            .ok_or_else(|| Error::config(format!("Unknown checkpoint store type: {}", type_name)))?;

        factory.create(config).await
    }

    pub fn list_datastores(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .datastores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn list_event_sources(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .event_sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn list_checkpoint_stores(&self) -> Vec<String> {
        let mut names: Vec<_> = self
            .checkpoint_stores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn has_datastore(&self, name: &str) -> bool {
        self.datastores
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    pub fn has_event_source(&self, name: &str) -> bool {
        self.event_sources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RefusingFactory;

    impl DatastoreFactory for RefusingFactory {
        fn create(&self, _config: &DatastoreConfig) -> Result<Arc<dyn Datastore>> {
            Err(Error::not_found("refusing factory"))
        }
    }

    #[test]
    fn builtins_are_registered() {
        let registry = ComponentRegistry::with_builtins();

        assert!(registry.has_datastore("memory"));
        assert!(registry.has_event_source("memory"));
        assert_eq!(registry.list_checkpoint_stores(), vec!["file", "memory"]);
    }

    #[test]
    fn unknown_type_is_a_config_error() {
        let registry = ComponentRegistry::new();
        let config = DatastoreConfig::Restconf {
            url: "http://odl:8181/restconf/config".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
            poll_interval_secs: 5,
        };

        assert!(matches!(
            registry.create_datastore(&config),
            Err(Error::FatalConfig(_))
        ));
    }

    #[test]
    fn custom_factory_is_dispatched_by_name() {
        let registry = ComponentRegistry::new();
        registry.register_datastore("etcd", Box::new(RefusingFactory));

        let config = DatastoreConfig::Custom {
            factory: "etcd".to_string(),
            config: serde_json::Value::Null,
        };

        assert!(matches!(
            registry.create_datastore(&config),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn file_checkpoint_store_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ComponentRegistry::with_builtins();
        let config = CheckpointConfig::File {
            path: dir.path().join("cp.json").display().to_string(),
        };

        let store = registry.create_checkpoint_store(&config).await.unwrap();
        store.save(3).await.unwrap();
        assert_eq!(store.load().await.unwrap().map(|c| c.seq), Some(3));
    }
}
