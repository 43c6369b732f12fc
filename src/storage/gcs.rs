//! Google Cloud Storage backend.
//!
//! Credentials come from a service account file or key, application default
//! credentials, or the instance metadata server, in that order.

use std::fmt;
use std::sync::Arc;

use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::signer::Signer;
use serde::{Deserialize, Serialize};

use super::cloud::CloudStorage;
use super::StorageType;
use crate::{Error, Result};

/// Multipart parts below this size are rejected, except the last.
const MIN_CHUNK_SIZE: usize = 5 * 1024 * 1024;

fn default_chunk_size() -> usize {
    8 * 1024 * 1024
}

#[derive(Clone, Default, Serialize, Deserialize)]
pub struct GcsConfig {
    pub bucket: String,
    #[serde(default)]
    pub base_path: String,
    /// Path to a service account JSON file.
    #[serde(default)]
    pub service_account_path: Option<String>,
    /// Service account JSON, inline.
    #[serde(default)]
    pub service_account_key: Option<String>,
    /// Path to an application credentials JSON file.
    #[serde(default)]
    pub application_credentials: Option<String>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
}

impl fmt::Debug for GcsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcsConfig")
            .field("bucket", &self.bucket)
            .field("base_path", &self.base_path)
            .field("service_account_path", &self.service_account_path)
            .finish_non_exhaustive()
    }
}

impl GcsConfig {
    fn builder(&self) -> Result<GoogleCloudStorageBuilder> {
        if self.bucket.trim().is_empty() {
            return Err(Error::Config("gcs bucket must be set".into()));
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(Error::Config("gcs chunk_size must be at least 5 MiB".into()));
        }
        let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(&self.bucket);
        if let Some(path) = &self.service_account_path {
            builder = builder.with_service_account_path(path);
        }
        if let Some(key) = &self.service_account_key {
            builder = builder.with_service_account_key(key);
        }
        if let Some(path) = &self.application_credentials {
            builder = builder.with_application_credentials(path);
        }
        Ok(builder)
    }

    /// Connect the backend. Direct URLs need credentials that can sign.
    pub fn build(&self) -> Result<CloudStorage> {
        let store = Arc::new(
            self.builder()?
                .build()
                .map_err(|e| Error::Config(format!("gcs: {}", e)))?,
        );
        let signer: Arc<dyn Signer> = store.clone();
        CloudStorage::new(
            StorageType::Gcs,
            store,
            Some(signer),
            &self.base_path,
            self.chunk_size,
        )
    }
}
