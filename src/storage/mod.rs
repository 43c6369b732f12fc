//! Pluggable object storage.
//!
//! Every backend implements [`ObjectStorage`], a small synchronous, streaming
//! interface over opaque slash-separated paths. The content store, the chunk
//! engine and the artifact store only ever talk to this trait.

use std::fmt;
use std::io::{Read, Seek};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::Result;

pub mod azure;
mod cloud;
pub mod drive;
pub mod gcs;
pub mod local;
pub mod memory;
pub mod path;
mod registry;
mod remote;
pub mod s3;

pub use azure::AzureConfig;
pub use cloud::CloudStorage;
pub use drive::{DriveConfig, DriveStorage};
pub use gcs::GcsConfig;
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use registry::StorageRegistry;
pub use s3::S3Config;

/// Metadata describing a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    /// Last path component.
    pub name: String,
    pub size: i64,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
}

/// An open, seekable stored object.
pub trait Object: Read + Seek + Send {
    fn stat(&self) -> Result<FileInfo>;
}

/// Options for [`ObjectStorage::url`].
#[derive(Debug, Clone)]
pub struct UrlParams {
    /// How long the URL stays valid.
    pub expires_in: Duration,
}

impl Default for UrlParams {
    fn default() -> Self {
        UrlParams {
            expires_in: Duration::from_secs(5 * 60),
        }
    }
}

/// Callback used by [`ObjectStorage::iterate_objects`].
pub type VisitFn<'a> = dyn FnMut(&str, &mut dyn Object) -> Result<()> + 'a;

/// A storage backend.
///
/// Paths are normalized by the backend; a path that climbs above the backend
/// root fails with [`crate::Error::InvalidPath`]. A missing path fails with
/// [`crate::Error::NotExist`].
pub trait ObjectStorage: Send + Sync + fmt::Debug {
    /// Open an object for reading.
    fn open(&self, path: &str) -> Result<Box<dyn Object>>;

    /// Stream `reader` into `path` and return the number of bytes written.
    ///
    /// `size` is the expected length, or `-1` when unknown. When it is known
    /// and the reader yields a different amount, nothing is published.
    fn save(&self, path: &str, reader: &mut dyn Read, size: i64) -> Result<i64>;

    fn stat(&self, path: &str) -> Result<FileInfo>;

    /// Delete an object. Deleting a missing object succeeds.
    fn delete(&self, path: &str) -> Result<()>;

    /// A time-limited URL serving the object directly, with `name` as the
    /// download file name. Backends without direct URLs return
    /// [`crate::Error::UrlNotSupported`].
    fn url(&self, path: &str, name: &str, params: &UrlParams) -> Result<Url>;

    /// Visit every object below the directory `prefix` (empty for all).
    /// An error returned by `visit` stops the iteration and is returned.
    fn iterate_objects(&self, prefix: &str, visit: &mut VisitFn<'_>) -> Result<()>;

    fn kind(&self) -> StorageType;
}

/// Backend kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Local,
    Memory,
    S3,
    Azure,
    Gcs,
    Drive,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageType::Local => "local",
            StorageType::Memory => "memory",
            StorageType::S3 => "s3",
            StorageType::Azure => "azure",
            StorageType::Gcs => "gcs",
            StorageType::Drive => "drive",
        };
        f.write_str(name)
    }
}

/// Configuration of one storage backend, tagged by `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Local {
        path: std::path::PathBuf,
        #[serde(default)]
        tmp_path: Option<std::path::PathBuf>,
    },
    Memory,
    S3(S3Config),
    Azure(AzureConfig),
    Gcs(GcsConfig),
    Drive(DriveConfig),
}

impl StorageConfig {
    pub fn kind(&self) -> StorageType {
        match self {
            StorageConfig::Local { .. } => StorageType::Local,
            StorageConfig::Memory => StorageType::Memory,
            StorageConfig::S3(_) => StorageType::S3,
            StorageConfig::Azure(_) => StorageType::Azure,
            StorageConfig::Gcs(_) => StorageType::Gcs,
            StorageConfig::Drive(_) => StorageType::Drive,
        }
    }
}

/// Build a backend from its configuration.
pub fn new_storage(config: &StorageConfig) -> Result<Arc<dyn ObjectStorage>> {
    let storage: Arc<dyn ObjectStorage> = match config {
        StorageConfig::Local { path, tmp_path } => {
            Arc::new(LocalStorage::new(path, tmp_path.as_deref())?)
        }
        StorageConfig::Memory => Arc::new(MemoryStorage::new()),
        StorageConfig::S3(cfg) => Arc::new(cfg.build()?),
        StorageConfig::Azure(cfg) => Arc::new(cfg.build()?),
        StorageConfig::Gcs(cfg) => Arc::new(cfg.build()?),
        StorageConfig::Drive(cfg) => Arc::new(DriveStorage::new(cfg.clone())?),
    };
    tracing::debug!(kind = %config.kind(), "storage backend created");
    Ok(storage)
}

/// Escape a file name for use inside a quoted `Content-Disposition` value.
pub(crate) fn content_disposition(name: &str) -> String {
    let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
    format!("attachment; filename=\"{}\"", escaped)
}
