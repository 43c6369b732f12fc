//! File locks: one active lock per path per repository.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::repo::{Principal, RepoId, Repository};
use crate::storage::path::normalize;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: i64,
    pub repo_id: RepoId,
    pub path: String,
    pub owner_id: i64,
    pub owner_name: String,
    pub locked_at: DateTime<Utc>,
}

/// Persistent lock storage.
pub trait LockStore: Send + Sync {
    /// Create a lock, or fail with [`Error::LockConflict`] carrying the lock
    /// already held on `path`.
    fn create(&self, repo: RepoId, owner: &Principal, path: &str) -> Result<Lock>;

    fn get_by_id(&self, repo: RepoId, id: i64) -> Result<Option<Lock>>;

    fn get_by_path(&self, repo: RepoId, path: &str) -> Result<Option<Lock>>;

    fn delete(&self, repo: RepoId, id: i64) -> Result<Option<Lock>>;

    /// Up to `limit` locks with `id >= from`, ordered by ID.
    fn range(&self, repo: RepoId, from: i64, limit: usize) -> Result<Vec<Lock>>;
}

#[derive(Debug, Default)]
struct LockTable {
    next_id: i64,
    repos: BTreeMap<RepoId, BTreeMap<i64, Lock>>,
}

#[derive(Debug, Default)]
pub struct MemoryLockStore {
    table: Mutex<LockTable>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockStore for MemoryLockStore {
    fn create(&self, repo: RepoId, owner: &Principal, path: &str) -> Result<Lock> {
        let mut table = self.table.lock();
        let locks = table.repos.entry(repo).or_default();
        if let Some(existing) = locks.values().find(|l| l.path == path) {
            return Err(Error::LockConflict(Box::new(existing.clone())));
        }
        table.next_id += 1;
        let lock = Lock {
            id: table.next_id,
            repo_id: repo,
            path: path.to_string(),
            owner_id: owner.id,
            owner_name: owner.name.clone(),
            locked_at: Utc::now(),
        };
        table
            .repos
            .entry(repo)
            .or_default()
            .insert(lock.id, lock.clone());
        Ok(lock)
    }

    fn get_by_id(&self, repo: RepoId, id: i64) -> Result<Option<Lock>> {
        let table = self.table.lock();
        Ok(table.repos.get(&repo).and_then(|l| l.get(&id)).cloned())
    }

    fn get_by_path(&self, repo: RepoId, path: &str) -> Result<Option<Lock>> {
        let table = self.table.lock();
        Ok(table
            .repos
            .get(&repo)
            .and_then(|l| l.values().find(|l| l.path == path))
            .cloned())
    }

    fn delete(&self, repo: RepoId, id: i64) -> Result<Option<Lock>> {
        let mut table = self.table.lock();
        Ok(table.repos.get_mut(&repo).and_then(|l| l.remove(&id)))
    }

    fn range(&self, repo: RepoId, from: i64, limit: usize) -> Result<Vec<Lock>> {
        let table = self.table.lock();
        Ok(table
            .repos
            .get(&repo)
            .map(|l| l.range(from..).take(limit).map(|(_, l)| l.clone()).collect())
            .unwrap_or_default())
    }
}

/// Lock operations on behalf of one principal in one repository.
#[derive(Clone)]
pub struct LockBackend {
    store: Arc<dyn LockStore>,
    repo: Repository,
    principal: Principal,
}

/// Clean a repository-relative lock path.
pub fn clean_lock_path(path: &str) -> Result<String> {
    let cleaned = normalize(path)?;
    if cleaned.is_empty() {
        return Err(Error::InvalidArgument("lock path must not be empty".into()));
    }
    Ok(cleaned)
}

/// Parse a list cursor; empty means from the start.
pub fn parse_cursor(cursor: &str) -> Result<i64> {
    if cursor.is_empty() {
        return Ok(0);
    }
    cursor
        .parse::<i64>()
        .ok()
        .filter(|c| *c >= 0)
        .ok_or_else(|| Error::InvalidArgument(format!("invalid cursor {:?}", cursor)))
}

impl LockBackend {
    pub fn new(store: Arc<dyn LockStore>, repo: Repository, principal: Principal) -> Self {
        LockBackend {
            store,
            repo,
            principal,
        }
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn create(&self, path: &str, refname: Option<&str>) -> Result<Lock> {
        let path = clean_lock_path(path)?;
        let lock = self.store.create(self.repo.id, &self.principal, &path)?;
        tracing::info!(
            repo = %self.repo.full_name(),
            path = %lock.path,
            id = lock.id,
            owner = %lock.owner_name,
            refname = refname.unwrap_or_default(),
            "lock created"
        );
        Ok(lock)
    }

    /// Release a lock. Only its owner may release it unless `force`.
    pub fn unlock(&self, id: i64, force: bool) -> Result<Lock> {
        let lock = self
            .from_id(id)?
            .ok_or_else(|| Error::NotFound(format!("lock {}", id)))?;
        if lock.owner_id != self.principal.id && !force {
            return Err(Error::PermissionDenied(format!(
                "lock {} is owned by {}",
                id, lock.owner_name
            )));
        }
        self.store.delete(self.repo.id, id)?;
        tracing::info!(repo = %self.repo.full_name(), id, force, "lock released");
        Ok(lock)
    }

    pub fn from_path(&self, path: &str) -> Result<Option<Lock>> {
        self.store.get_by_path(self.repo.id, &clean_lock_path(path)?)
    }

    pub fn from_id(&self, id: i64) -> Result<Option<Lock>> {
        self.store.get_by_id(self.repo.id, id)
    }

    /// Visit up to `limit` locks starting at `cursor` (a lock ID). Returns
    /// the cursor of the next page, if any.
    pub fn range(
        &self,
        cursor: &str,
        limit: usize,
        visit: &mut dyn FnMut(&Lock) -> Result<()>,
    ) -> Result<Option<String>> {
        let from = parse_cursor(cursor)?;
        let limit = limit.max(1);
        let mut locks = self.store.range(self.repo.id, from, limit + 1)?;
        let next = if locks.len() > limit {
            locks.pop().map(|l| l.id.to_string())
        } else {
            None
        };
        for lock in &locks {
            visit(lock)?;
        }
        Ok(next)
    }

    /// Whether a lock belongs to the bound principal.
    pub fn is_ours(&self, lock: &Lock) -> bool {
        lock.owner_id == self.principal.id
    }
}
