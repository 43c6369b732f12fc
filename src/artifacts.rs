//! CI artifact uploads on top of the chunk engine.

use std::io::Read;
use std::sync::Arc;

use url::Url;

use crate::chunks::{ChunkItem, ChunkStore, MergeOutcome};
use crate::range::ContentRange;
use crate::storage::{Object, ObjectStorage, UrlParams};
use crate::{Error, Result};

/// Identifies one artifact of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArtifactKey {
    pub run_id: i64,
    pub artifact_id: i64,
}

impl ArtifactKey {
    pub fn new(run_id: i64, artifact_id: i64) -> Result<Self> {
        if run_id <= 0 || artifact_id <= 0 {
            return Err(Error::InvalidArgument(format!(
                "invalid artifact {}/{}",
                run_id, artifact_id
            )));
        }
        Ok(ArtifactKey {
            run_id,
            artifact_id,
        })
    }

    /// Chunk-engine object id.
    pub fn object_id(&self) -> String {
        format!("{}-{}", self.run_id, self.artifact_id)
    }

    /// Where the merged archive lives. Runs are bucketed to bound directory
    /// fan-out.
    pub fn storage_path(&self) -> String {
        format!(
            "{}/{}/{}.zip",
            self.run_id % 255,
            self.run_id,
            self.artifact_id
        )
    }

    pub fn file_name(&self) -> String {
        format!("{}.zip", self.artifact_id)
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    chunks: ChunkStore,
}

impl ArtifactStore {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        ArtifactStore {
            chunks: ChunkStore::new(storage),
        }
    }

    fn storage(&self) -> &Arc<dyn ObjectStorage> {
        self.chunks.storage()
    }

    pub fn upload_chunk(
        &self,
        key: ArtifactKey,
        range: &ContentRange,
        reader: &mut dyn Read,
        checksum: Option<&str>,
    ) -> Result<ChunkItem> {
        self.chunks
            .save_chunk(&key.object_id(), range, reader, checksum)
    }

    /// Merge the uploaded chunks into the final archive.
    pub fn finalize(&self, key: ArtifactKey, size: i64) -> Result<MergeOutcome> {
        if size <= 0 {
            return Err(Error::InvalidArgument(format!("invalid artifact size {}", size)));
        }
        let outcome = self
            .chunks
            .merge_to(&key.object_id(), size, &key.storage_path())?;
        if let MergeOutcome::Merged { size } = outcome {
            tracing::info!(
                run_id = key.run_id,
                artifact_id = key.artifact_id,
                size,
                path = %key.storage_path(),
                "artifact finalized"
            );
        }
        Ok(outcome)
    }

    pub fn open(&self, key: ArtifactKey) -> Result<Box<dyn Object>> {
        self.storage().open(&key.storage_path())
    }

    /// Direct download URL, when the backend supports one.
    pub fn url(&self, key: ArtifactKey, params: &UrlParams) -> Result<Url> {
        self.storage()
            .url(&key.storage_path(), &key.file_name(), params)
    }

    /// Remove the archive and any leftover chunks.
    pub fn delete(&self, key: ArtifactKey) -> Result<()> {
        self.chunks.discard(&key.object_id())?;
        self.storage().delete(&key.storage_path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_paths() {
        let key = ArtifactKey::new(300, 7).unwrap();
        assert_eq!(key.object_id(), "300-7");
        assert_eq!(key.storage_path(), "45/300/7.zip");
        assert!(ArtifactKey::new(0, 1).is_err());
    }

    #[test]
    fn test_upload_finalize_download() {
        let store = ArtifactStore::new(Arc::new(MemoryStorage::new()));
        let key = ArtifactKey::new(1, 2).unwrap();

        let second = ContentRange::parse("bytes 5-9/10").unwrap();
        store
            .upload_chunk(key, &second, &mut &b"56789"[..], None)
            .unwrap();
        assert_eq!(
            store.finalize(key, 10).unwrap(),
            MergeOutcome::Incomplete { received: 0 }
        );

        let first = ContentRange::parse("bytes 0-4/10").unwrap();
        store
            .upload_chunk(key, &first, &mut &b"01234"[..], None)
            .unwrap();
        assert_eq!(
            store.finalize(key, 10).unwrap(),
            MergeOutcome::Merged { size: 10 }
        );

        let mut out = String::new();
        store.open(key).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "0123456789");
        assert!(matches!(
            store.url(key, &UrlParams::default()),
            Err(Error::UrlNotSupported)
        ));

        store.delete(key).unwrap();
        assert!(store.open(key).is_err());
    }
}
