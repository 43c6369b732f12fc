//! TOML configuration.
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:3000"
//! app_url = "https://git.example.com/"
//!
//! [lfs]
//! storage = "lfs"
//! token_secret = "change me"
//!
//! [storage.lfs]
//! type = "local"
//! path = "/var/lib/lfs"
//!
//! [[users]]
//! name = "alice"
//! password = "secret"
//!
//! [[repositories]]
//! owner = "alice"
//! name = "assets"
//! ```
//!
//! Storage names referenced by `[lfs]` or `[artifacts]` without a
//! `[storage.<name>]` table default to a local directory under `data/`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::artifacts::ArtifactStore;
use crate::content_store::ContentStore;
use crate::lock::MemoryLockStore;
use crate::meta::MemoryMetaStore;
use crate::repo::{RepositoryConfig, StaticDirectory, UserConfig};
use crate::service::{LfsOptions, LfsService};
use crate::storage::{StorageConfig, StorageRegistry};
use crate::token::TokenSigner;
use crate::{Error, Result};

/// Top-level configuration, parsed from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub lfs: LfsSection,
    pub artifacts: ArtifactsSection,
    /// Named storage backends.
    pub storage: BTreeMap<String, StorageConfig>,
    pub log: LogSection,
    pub users: Vec<UserConfig>,
    pub repositories: Vec<RepositoryConfig>,
}

/// `[server]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub listen_addr: String,
    /// Base URL clients reach the server at; used in batch action links.
    pub app_url: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:3000".to_string(),
            app_url: "http://localhost:3000/".to_string(),
        }
    }
}

/// `[lfs]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LfsSection {
    /// Name of the storage backend holding LFS objects.
    pub storage: String,
    /// Largest accepted object in bytes; 0 for no limit.
    pub max_file_size: i64,
    /// HMAC key for transfer tokens and artifact signatures.
    pub token_secret: String,
    pub token_ttl_secs: u64,
    /// Hand out pre-signed backend URLs for downloads.
    pub serve_direct: bool,
    pub locking: bool,
    pub locks_paging_num: usize,
}

impl Default for LfsSection {
    fn default() -> Self {
        let options = LfsOptions::default();
        Self {
            storage: "lfs".to_string(),
            max_file_size: options.max_file_size,
            token_secret: String::new(),
            token_ttl_secs: 20 * 60,
            serve_direct: options.serve_direct,
            locking: options.locking,
            locks_paging_num: options.locks_paging_num,
        }
    }
}

/// `[artifacts]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ArtifactsSection {
    pub enabled: bool,
    pub storage: String,
    /// Redirect downloads to pre-signed backend URLs.
    pub serve_direct: bool,
}

impl Default for ArtifactsSection {
    fn default() -> Self {
        Self {
            enabled: false,
            storage: "actions_artifacts".to_string(),
            serve_direct: false,
        }
    }
}

/// `[log]` section.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Everything the binary runs on, assembled from a [`Config`].
pub struct Components {
    pub service: LfsService,
    pub artifacts: Option<ArtifactStore>,
    pub directory: Arc<StaticDirectory>,
}

impl Config {
    /// Load from `path`, or defaults when there is none.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("{}: {}", p.display(), e)))?;
                Self::from_toml(&content)
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.lfs.token_secret.is_empty() {
            return Err(Error::Config("lfs.token_secret must be set".into()));
        }
        if self.lfs.max_file_size < 0 {
            return Err(Error::Config("lfs.max_file_size must not be negative".into()));
        }
        url::Url::parse(&self.server.app_url)
            .map_err(|e| Error::Config(format!("server.app_url: {}", e)))?;
        Ok(())
    }

    pub fn lfs_options(&self) -> LfsOptions {
        LfsOptions {
            app_url: self.server.app_url.clone(),
            max_file_size: self.lfs.max_file_size,
            serve_direct: self.lfs.serve_direct,
            locking: self.lfs.locking,
            locks_paging_num: self.lfs.locks_paging_num,
        }
    }

    pub fn token_ttl(&self) -> Duration {
        Duration::from_secs(self.lfs.token_ttl_secs)
    }

    /// Configured backends plus local defaults for referenced names.
    pub fn storage_configs(&self) -> BTreeMap<String, StorageConfig> {
        let mut configs = self.storage.clone();
        let mut referenced = vec![self.lfs.storage.clone()];
        if self.artifacts.enabled {
            referenced.push(self.artifacts.storage.clone());
        }
        for name in referenced {
            configs
                .entry(name.clone())
                .or_insert_with(|| StorageConfig::Local {
                    path: PathBuf::from("data").join(&name),
                    tmp_path: None,
                });
        }
        configs
    }

    /// Build the storage backends, the in-memory stores and the service.
    pub fn build(&self) -> Result<Components> {
        self.validate()?;
        let registry = StorageRegistry::from_configs(&self.storage_configs())?;
        let directory = Arc::new(StaticDirectory::new(&self.users, &self.repositories)?);
        let tokens = TokenSigner::new(self.lfs.token_secret.as_bytes(), self.token_ttl())?;

        let service = LfsService::new(
            ContentStore::new(registry.get(&self.lfs.storage)?),
            Arc::new(MemoryMetaStore::new()),
            directory.clone(),
            directory.clone(),
            Arc::new(MemoryLockStore::new()),
            tokens,
            self.lfs_options(),
        );
        let artifacts = if self.artifacts.enabled {
            Some(ArtifactStore::new(registry.get(&self.artifacts.storage)?))
        } else {
            None
        };
        Ok(Components {
            service,
            artifacts,
            directory,
        })
    }
}
