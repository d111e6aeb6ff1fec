//! Backend registry for resolving storage by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::provider::CloudStorage;
use soundvault_common::{Error, Result};

/// Factory function type for creating backends.
pub type BackendFactory = Box<dyn Fn(Value) -> Result<Arc<dyn CloudStorage>> + Send + Sync>;

/// Registry for storage backend factories.
///
/// Allows the CLI (or any host) to pick a backend from configuration.
pub struct BackendRegistry {
    factories: HashMap<String, BackendFactory>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a backend factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: BackendFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a backend by name and configuration.
    ///
    /// # Errors
    /// - Backend not registered
    /// - Configuration invalid for the backend
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn CloudStorage>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Backend '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered backend names, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in backends (`memory`, `local`, `dropbox`).
pub fn create_default_registry() -> Result<BackendRegistry> {
    let mut registry = BackendRegistry::new();

    registry.register(
        "memory",
        Box::new(|_config| Ok(Arc::new(crate::memory::MemoryStorage::new()))),
    )?;

    registry.register(
        "local",
        Box::new(|config| {
            let root = config.get("root").and_then(|v| v.as_str()).ok_or_else(|| {
                Error::InvalidInput("Local backend requires 'root' path".to_string())
            })?;
            Ok(Arc::new(crate::local::LocalStorage::new(root)?))
        }),
    )?;

    registry.register(
        "dropbox",
        Box::new(crate::dropbox::create_dropbox_storage),
    )?;

    Ok(registry)
}
