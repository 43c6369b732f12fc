//! S3 compatible backend (AWS S3, MinIO, ...).

use std::fmt;
use std::sync::Arc;

use object_store::aws::AmazonS3Builder;
use object_store::signer::Signer;
use serde::{Deserialize, Serialize};

use super::cloud::CloudStorage;
use super::StorageType;
use crate::{Error, Result};

/// S3 rejects multipart parts below this size, except the last.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

fn default_region() -> String {
    "us-east-1".into()
}

fn default_true() -> bool {
    true
}

fn default_part_size() -> usize {
    16 * 1024 * 1024
}

#[derive(Clone, Serialize, Deserialize)]
pub struct S3Config {
    /// Service endpoint, e.g. `http://localhost:9000`. AWS when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default)]
    pub session_token: Option<String>,
    /// Key prefix for every object.
    #[serde(default)]
    pub base_path: String,
    /// `endpoint/bucket/key` instead of `bucket.endpoint/key`.
    #[serde(default = "default_true")]
    pub path_style: bool,
    /// Multipart part size in bytes.
    #[serde(default = "default_part_size")]
    pub part_size: usize,
}

impl fmt::Debug for S3Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Config")
            .field("endpoint", &self.endpoint)
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("base_path", &self.base_path)
            .finish_non_exhaustive()
    }
}

impl S3Config {
    fn builder(&self) -> Result<AmazonS3Builder> {
        if self.bucket.trim().is_empty() {
            return Err(Error::Config("s3 bucket must be set".into()));
        }
        if self.part_size < MIN_PART_SIZE {
            return Err(Error::Config("s3 part_size must be at least 5 MiB".into()));
        }

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&self.bucket)
            .with_region(&self.region)
            .with_access_key_id(&self.access_key_id)
            .with_secret_access_key(&self.secret_access_key)
            .with_virtual_hosted_style_request(!self.path_style);
        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }
        if let Some(token) = &self.session_token {
            builder = builder.with_token(token);
        }
        Ok(builder)
    }

    /// Connect the backend. No request is made until first use.
    pub fn build(&self) -> Result<CloudStorage> {
        let store = Arc::new(
            self.builder()?
                .build()
                .map_err(|e| Error::Config(format!("s3: {}", e)))?,
        );
        let signer: Arc<dyn Signer> = store.clone();
        CloudStorage::new(
            StorageType::S3,
            store,
            Some(signer),
            &self.base_path,
            self.part_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{ObjectStorage, UrlParams};

    fn config() -> S3Config {
        S3Config {
            endpoint: Some("http://localhost:9000".into()),
            bucket: "lfs".into(),
            region: default_region(),
            access_key_id: "minio".into(),
            secret_access_key: "minio123".into(),
            session_token: None,
            base_path: "objects/".into(),
            path_style: true,
            part_size: default_part_size(),
        }
    }

    #[test]
    fn test_presigned_url() {
        let storage = config().build().unwrap();
        assert_eq!(storage.kind(), StorageType::S3);
        let url = storage
            .url("ab/cd/ef", "report.bin", &UrlParams::default())
            .unwrap();
        assert_eq!(url.path(), "/lfs/objects/ab/cd/ef");
        assert_eq!(url.host_str(), Some("localhost"));
        let query: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert!(query.iter().any(|(k, _)| k == "X-Amz-Signature"));
        assert!(query.iter().any(|(k, v)| k == "X-Amz-Expires" && v == "300"));
    }

    #[test]
    fn test_rejects_bad_config() {
        let small = S3Config {
            part_size: 1024,
            ..config()
        };
        assert!(matches!(small.build(), Err(Error::Config(_))));
        let unnamed = S3Config {
            bucket: " ".into(),
            ..config()
        };
        assert!(matches!(unnamed.build(), Err(Error::Config(_))));
    }

    #[test]
    fn test_key_rejects_escape() {
        let storage = config().build().unwrap();
        assert!(matches!(
            storage.url("../x", "x", &UrlParams::default()),
            Err(Error::InvalidPath(_))
        ));
    }
}
