use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use super::{new_storage, ObjectStorage, StorageConfig};
use crate::{Error, Result};

/// Named storage backends, e.g. `"lfs"` and `"actions-artifacts"`.
#[derive(Debug, Clone, Default)]
pub struct StorageRegistry {
    backends: HashMap<String, Arc<dyn ObjectStorage>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one backend per configured name.
    pub fn from_configs(configs: &BTreeMap<String, StorageConfig>) -> Result<Self> {
        let mut registry = Self::new();
        for (name, config) in configs {
            let storage = new_storage(config)
                .map_err(|e| Error::Config(format!("storage {:?}: {}", name, e)))?;
            tracing::info!(name = %name, kind = %config.kind(), "storage registered");
            registry.insert(name.clone(), storage);
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, storage: Arc<dyn ObjectStorage>) {
        self.backends.insert(name.into(), storage);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ObjectStorage>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Config(format!("no storage named {:?}", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
