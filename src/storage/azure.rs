//! Azure Blob Storage backend.
//!
//! Unknown sizes are staged as blocks and committed as one block list.
//! Direct URLs carry a service SAS signed with the account key.

use std::fmt;
use std::sync::Arc;

use object_store::azure::MicrosoftAzureBuilder;
use object_store::signer::Signer;
use serde::{Deserialize, Serialize};

use super::cloud::CloudStorage;
use super::StorageType;
use crate::{Error, Result};

fn default_block_size() -> usize {
    8 * 1024 * 1024
}

#[derive(Clone, Serialize, Deserialize)]
pub struct AzureConfig {
    /// Blob service endpoint, e.g. `http://127.0.0.1:10000/devstoreaccount1`.
    /// `https://{account_name}.blob.core.windows.net` when absent.
    #[serde(default)]
    pub endpoint: Option<String>,
    pub account_name: String,
    /// Base64 account key.
    pub account_key: String,
    pub container: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default = "default_block_size")]
    pub block_size: usize,
}

impl fmt::Debug for AzureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureConfig")
            .field("endpoint", &self.endpoint)
            .field("account_name", &self.account_name)
            .field("container", &self.container)
            .finish_non_exhaustive()
    }
}

impl AzureConfig {
    fn builder(&self) -> Result<MicrosoftAzureBuilder> {
        if self.account_name.is_empty() || self.container.is_empty() {
            return Err(Error::Config(
                "azure account_name and container must be set".into(),
            ));
        }
        let mut builder = MicrosoftAzureBuilder::new()
            .with_account(&self.account_name)
            .with_access_key(self.account_key.trim())
            .with_container_name(&self.container);
        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.trim().is_empty()) {
            builder = builder
                .with_endpoint(endpoint.to_string())
                .with_allow_http(endpoint.starts_with("http://"));
        }
        Ok(builder)
    }

    /// Connect the backend. No request is made until first use.
    pub fn build(&self) -> Result<CloudStorage> {
        let store = Arc::new(
            self.builder()?
                .build()
                .map_err(|e| Error::Config(format!("azure: {}", e)))?,
        );
        let signer: Arc<dyn Signer> = store.clone();
        CloudStorage::new(
            StorageType::Azure,
            store,
            Some(signer),
            &self.base_path,
            self.block_size,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::ObjectStorage;

    fn config() -> AzureConfig {
        AzureConfig {
            endpoint: Some("http://127.0.0.1:10000/devstoreaccount1".into()),
            account_name: "devstoreaccount1".into(),
            account_key: "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==".into(),
            container: "lfs".into(),
            base_path: String::new(),
            block_size: default_block_size(),
        }
    }

    #[test]
    fn test_build() {
        let storage = config().build().unwrap();
        assert_eq!(storage.kind(), StorageType::Azure);
    }

    #[test]
    fn test_requires_container() {
        let err = AzureConfig {
            container: String::new(),
            ..config()
        }
        .build()
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_config_from_toml() {
        let cfg: AzureConfig = toml::from_str(
            r#"
            account_name = "acct"
            account_key = "a2V5"
            container = "lfs"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.endpoint, None);
        assert_eq!(cfg.block_size, default_block_size());
    }
}
