//! LFS meta objects: which repository references which OID.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::repo::RepoId;
use crate::{Pointer, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaObject {
    #[serde(flatten)]
    pub pointer: Pointer,
    pub repository_id: RepoId,
    pub created_at: DateTime<Utc>,
}

/// Key-value store of meta objects keyed by repository and OID.
pub trait MetaStore: Send + Sync {
    fn get(&self, repo: RepoId, oid: &str) -> Result<Option<MetaObject>>;

    /// Record `pointer` for `repo`. An existing record is returned unchanged.
    fn create(&self, repo: RepoId, pointer: &Pointer) -> Result<MetaObject>;

    /// Returns whether a record was removed.
    fn remove(&self, repo: RepoId, oid: &str) -> Result<bool>;

    /// Repositories holding a record for `oid`.
    fn repositories_with(&self, oid: &str) -> Result<Vec<RepoId>>;
}

#[derive(Debug, Default)]
pub struct MemoryMetaStore {
    objects: RwLock<BTreeMap<(String, RepoId), MetaObject>>,
}

impl MemoryMetaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl MetaStore for MemoryMetaStore {
    fn get(&self, repo: RepoId, oid: &str) -> Result<Option<MetaObject>> {
        Ok(self.objects.read().get(&(oid.to_string(), repo)).cloned())
    }

    fn create(&self, repo: RepoId, pointer: &Pointer) -> Result<MetaObject> {
        let mut objects = self.objects.write();
        let meta = objects
            .entry((pointer.oid.clone(), repo))
            .or_insert_with(|| MetaObject {
                pointer: pointer.clone(),
                repository_id: repo,
                created_at: Utc::now(),
            });
        Ok(meta.clone())
    }

    fn remove(&self, repo: RepoId, oid: &str) -> Result<bool> {
        Ok(self
            .objects
            .write()
            .remove(&(oid.to_string(), repo))
            .is_some())
    }

    fn repositories_with(&self, oid: &str) -> Result<Vec<RepoId>> {
        let objects = self.objects.read();
        Ok(objects
            .range((oid.to_string(), RepoId::MIN)..=(oid.to_string(), RepoId::MAX))
            .map(|(_, meta)| meta.repository_id)
            .collect())
    }
}
