//! Repositories, principals and access control.
//!
//! The LFS endpoints only ever ask two questions of the surrounding
//! application: "which repository is `owner/name`" and "may this principal
//! read or write it". Both are traits so a host can plug in its own user and
//! repository database; [`StaticDirectory`] answers them from configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;

use crate::{Error, Result};

pub type RepoId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepoId,
    pub owner: String,
    pub name: String,
}

impl Repository {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
}

pub trait RepositoryStore: Send + Sync {
    /// Look up a repository; [`Error::NotFound`] if it does not exist.
    fn by_owner_and_name(&self, owner: &str, name: &str) -> Result<Repository>;

    fn by_id(&self, id: RepoId) -> Result<Repository>;
}

pub trait AccessControl: Send + Sync {
    /// `principal` is `None` for anonymous requests.
    fn can_access(&self, principal: Option<&Principal>, repo: &Repository, mode: AccessMode)
        -> bool;

    /// Check HTTP basic credentials.
    fn authenticate_basic(&self, username: &str, password: &str) -> Option<Principal>;

    fn principal_by_id(&self, id: i64) -> Option<Principal>;

    fn principal_by_name(&self, name: &str) -> Option<Principal>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub owner: String,
    pub name: String,
    /// Anyone, including anonymous users, may read.
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub readers: Vec<String>,
    #[serde(default)]
    pub writers: Vec<String>,
}

#[derive(Debug)]
struct UserEntry {
    principal: Principal,
    password: String,
}

#[derive(Debug)]
struct RepoEntry {
    repo: Repository,
    public: bool,
    readers: Vec<String>,
    writers: Vec<String>,
}

/// Users and repositories loaded from configuration.
///
/// IDs are assigned in declaration order starting at 1.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    users: Vec<UserEntry>,
    repos: Vec<RepoEntry>,
    by_name: HashMap<(String, String), usize>,
}

impl StaticDirectory {
    pub fn new(users: &[UserConfig], repositories: &[RepositoryConfig]) -> Result<Self> {
        let mut dir = StaticDirectory::default();
        for (i, user) in users.iter().enumerate() {
            if dir.users.iter().any(|u| u.principal.name == user.name) {
                return Err(Error::Config(format!("duplicate user {:?}", user.name)));
            }
            dir.users.push(UserEntry {
                principal: Principal {
                    id: i as i64 + 1,
                    name: user.name.clone(),
                    is_admin: user.is_admin,
                },
                password: user.password.clone(),
            });
        }
        for (i, cfg) in repositories.iter().enumerate() {
            let key = (cfg.owner.to_lowercase(), cfg.name.to_lowercase());
            if dir.by_name.insert(key, i).is_some() {
                return Err(Error::Config(format!(
                    "duplicate repository {}/{}",
                    cfg.owner, cfg.name
                )));
            }
            dir.repos.push(RepoEntry {
                repo: Repository {
                    id: i as i64 + 1,
                    owner: cfg.owner.clone(),
                    name: cfg.name.clone(),
                },
                public: cfg.public,
                readers: cfg.readers.clone(),
                writers: cfg.writers.clone(),
            });
        }
        Ok(dir)
    }

    fn entry(&self, repo: &Repository) -> Option<&RepoEntry> {
        self.repos.iter().find(|e| e.repo.id == repo.id)
    }
}

impl RepositoryStore for StaticDirectory {
    fn by_owner_and_name(&self, owner: &str, name: &str) -> Result<Repository> {
        let name = name.strip_suffix(".git").unwrap_or(name);
        self.by_name
            .get(&(owner.to_lowercase(), name.to_lowercase()))
            .map(|&i| self.repos[i].repo.clone())
            .ok_or_else(|| Error::NotFound(format!("repository {}/{}", owner, name)))
    }

    fn by_id(&self, id: RepoId) -> Result<Repository> {
        self.repos
            .iter()
            .find(|e| e.repo.id == id)
            .map(|e| e.repo.clone())
            .ok_or_else(|| Error::NotFound(format!("repository {}", id)))
    }
}

impl AccessControl for StaticDirectory {
    fn can_access(
        &self,
        principal: Option<&Principal>,
        repo: &Repository,
        mode: AccessMode,
    ) -> bool {
        let Some(entry) = self.entry(repo) else {
            return false;
        };
        let Some(principal) = principal else {
            return mode == AccessMode::Read && entry.public;
        };
        if principal.is_admin || principal.name == repo.owner {
            return true;
        }
        let writer = entry.writers.iter().any(|w| *w == principal.name);
        match mode {
            AccessMode::Write => writer,
            AccessMode::Read => {
                writer || entry.public || entry.readers.iter().any(|r| *r == principal.name)
            }
        }
    }

    fn authenticate_basic(&self, username: &str, password: &str) -> Option<Principal> {
        let user = self.users.iter().find(|u| u.principal.name == username)?;
        let matches: bool = user.password.as_bytes().ct_eq(password.as_bytes()).into();
        matches.then(|| user.principal.clone())
    }

    fn principal_by_id(&self, id: i64) -> Option<Principal> {
        self.users
            .iter()
            .find(|u| u.principal.id == id)
            .map(|u| u.principal.clone())
    }

    fn principal_by_name(&self, name: &str) -> Option<Principal> {
        self.users
            .iter()
            .find(|u| u.principal.name == name)
            .map(|u| u.principal.clone())
    }
}
