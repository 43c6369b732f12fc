//! Adapter from an `object_store` client to [`ObjectStorage`].
//!
//! S3, Azure and GCS all go through here. The storage trait is blocking, so
//! every backend owns a small runtime and blocks on the client's futures from
//! the calling thread. Callers on the HTTP server already run on the blocking
//! pool; the SSH transfer command has no runtime of its own.

use std::fmt;
use std::future::Future;
use std::io::{self, Read};
use std::sync::Arc;

use axum::http::Method;
use futures::TryStreamExt;
use object_store::path::Path as StorePath;
use object_store::signer::Signer;
use object_store::{GetOptions, GetRange, ObjectMeta, ObjectStore, PutPayload};
use tokio::runtime::{Builder, Handle, Runtime};
use tokio_util::io::{StreamReader, SyncIoBridge};
use url::Url;

use super::path::{join, normalize, object_path, strip_base};
use super::remote::{read_part, Body, RemoteObject};
use super::{FileInfo, Object, ObjectStorage, StorageType, UrlParams, VisitFn};
use crate::{Error, Result};

const RUNTIME_THREADS: usize = 2;

/// Runtime driving one backend's client.
struct Bridge(Option<Runtime>);

impl Bridge {
    fn new(kind: StorageType) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(RUNTIME_THREADS)
            .thread_name(format!("storage-{}", kind))
            .enable_all()
            .build()?;
        Ok(Bridge(Some(runtime)))
    }

    fn handle(&self) -> Result<&Handle> {
        self.0
            .as_ref()
            .map(Runtime::handle)
            .ok_or_else(|| Error::Storage("storage runtime is shut down".into()))
    }

    fn block_on<F: Future>(&self, future: F) -> Result<F::Output> {
        Ok(self.handle()?.block_on(future))
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        // Backends may be dropped from inside the server's runtime, where a
        // blocking shutdown is not allowed.
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// An `object_store` client with a key prefix.
#[derive(Clone)]
pub struct CloudStorage {
    store: Arc<dyn ObjectStore>,
    signer: Option<Arc<dyn Signer>>,
    bridge: Arc<Bridge>,
    base_path: String,
    part_size: usize,
    kind: StorageType,
}

impl fmt::Debug for CloudStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudStorage")
            .field("kind", &self.kind)
            .field("store", &self.store.to_string())
            .field("base_path", &self.base_path)
            .finish()
    }
}

impl CloudStorage {
    /// Wrap `store`. Objects up to `part_size` bytes go up with a single
    /// PUT; larger or unknown-size objects use a multipart upload with parts
    /// of that size.
    pub(crate) fn new(
        kind: StorageType,
        store: Arc<dyn ObjectStore>,
        signer: Option<Arc<dyn Signer>>,
        base_path: &str,
        part_size: usize,
    ) -> Result<Self> {
        if part_size == 0 {
            return Err(Error::Config(format!("{} part size must be positive", kind)));
        }
        Ok(CloudStorage {
            store,
            signer,
            bridge: Arc::new(Bridge::new(kind)?),
            base_path: base_path.trim_matches('/').to_string(),
            part_size,
            kind,
        })
    }

    fn location(&self, path: &str) -> Result<StorePath> {
        Ok(StorePath::from(join(&self.base_path, &object_path(path)?)))
    }

    fn info(meta: &ObjectMeta) -> FileInfo {
        FileInfo {
            name: meta.location.filename().unwrap_or_default().to_string(),
            size: meta.size as i64,
            mod_time: meta.last_modified,
            is_dir: false,
        }
    }

    fn head(&self, location: &StorePath) -> Result<ObjectMeta> {
        Ok(self.bridge.block_on(self.store.head(location))??)
    }

    /// A blocking reader over the object from `offset` on.
    fn get_from(&self, location: &StorePath, offset: u64) -> Result<Body> {
        let options = GetOptions {
            range: (offset > 0).then_some(GetRange::Offset(offset as usize)),
            ..GetOptions::default()
        };
        let result = self
            .bridge
            .block_on(self.store.get_opts(location, options))??;
        let stream = result.into_stream().map_err(io::Error::other);
        Ok(Box::new(SyncIoBridge::new_with_handle(
            StreamReader::new(stream),
            self.bridge.handle()?.clone(),
        )))
    }

    fn remote_object(&self, location: StorePath, info: FileInfo) -> RemoteObject {
        let this = self.clone();
        RemoteObject::new(
            info,
            Box::new(move |offset| this.get_from(&location, offset)),
        )
    }

    /// Stream `reader` into a multipart upload. `first` holds the bytes
    /// already read. Nothing is published unless the total matches `size`.
    fn put_multipart(
        &self,
        location: &StorePath,
        first: Vec<u8>,
        reader: &mut dyn Read,
        size: i64,
    ) -> Result<i64> {
        let mut upload = self.bridge.block_on(self.store.put_multipart(location))??;
        let mut written = first.len() as i64;
        let mut part = first;

        let result = loop {
            if let Err(e) = self
                .bridge
                .block_on(upload.put_part(PutPayload::from(std::mem::take(&mut part))))
                .and_then(|r| r.map_err(Error::from))
            {
                break Err(e);
            }
            match read_part(reader, &mut part, self.part_size) {
                Ok(0) => break Ok(()),
                Ok(n) => written += n as i64,
                Err(e) => break Err(e),
            }
        };
        let result = result.and_then(|()| {
            if size >= 0 && written != size {
                return Err(Error::SizeMismatch {
                    expected: size,
                    actual: written,
                });
            }
            self.bridge.block_on(upload.complete())??;
            Ok(written)
        });

        if result.is_err() {
            let aborted = self.bridge.block_on(upload.abort());
            if let Err(e) = aborted.and_then(|r| r.map_err(Error::from)) {
                tracing::warn!(location = %location, error = %e, "failed to abort multipart upload");
            }
        }
        result
    }
}

impl ObjectStorage for CloudStorage {
    fn open(&self, path: &str) -> Result<Box<dyn Object>> {
        let location = self.location(path)?;
        let info = Self::info(&self.head(&location)?);
        Ok(Box::new(self.remote_object(location, info)))
    }

    fn save(&self, path: &str, reader: &mut dyn Read, size: i64) -> Result<i64> {
        let location = self.location(path)?;
        let mut first = Vec::new();
        let n = read_part(reader, &mut first, self.part_size)?;
        if n == self.part_size {
            return self.put_multipart(&location, first, reader, size);
        }

        let written = n as i64;
        if size >= 0 && written != size {
            return Err(Error::SizeMismatch {
                expected: size,
                actual: written,
            });
        }
        self.bridge
            .block_on(self.store.put(&location, PutPayload::from(first)))??;
        tracing::trace!(location = %location, written, "object stored");
        Ok(written)
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        Ok(Self::info(&self.head(&self.location(path)?)?))
    }

    fn delete(&self, path: &str) -> Result<()> {
        let location = self.location(path)?;
        match self.bridge.block_on(self.store.delete(&location))? {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn url(&self, path: &str, _name: &str, params: &UrlParams) -> Result<Url> {
        let signer = self.signer.as_ref().ok_or(Error::UrlNotSupported)?;
        let location = self.location(path)?;
        Ok(self.bridge.block_on(signer.signed_url(
            Method::GET,
            &location,
            params.expires_in,
        ))??)
    }

    fn iterate_objects(&self, prefix: &str, visit: &mut VisitFn<'_>) -> Result<()> {
        let dir = join(&self.base_path, &normalize(prefix)?);
        let dir = (!dir.is_empty()).then(|| StorePath::from(dir));
        let mut objects: Vec<ObjectMeta> = self
            .bridge
            .block_on(self.store.list(dir.as_ref()).try_collect())??;
        objects.sort_by(|a, b| a.location.as_ref().cmp(b.location.as_ref()));

        for meta in objects {
            let rel = strip_base(&self.base_path, meta.location.as_ref()).to_string();
            let info = Self::info(&meta);
            let mut object = self.remote_object(meta.location, info);
            visit(&rel, &mut object)?;
        }
        Ok(())
    }

    fn kind(&self) -> StorageType {
        self.kind
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use std::io::{Seek, SeekFrom};

    fn storage(part_size: usize) -> CloudStorage {
        CloudStorage::new(
            StorageType::S3,
            Arc::new(InMemory::new()),
            None,
            "/lfs/",
            part_size,
        )
        .unwrap()
    }

    #[test]
    fn test_roundtrip_under_base_path() {
        let s = storage(1024);
        assert_eq!(s.save("ab/cd/ef", &mut &b"0123456789"[..], 10).unwrap(), 10);

        let info = s.stat("ab/cd/ef").unwrap();
        assert_eq!(info.name, "ef");
        assert_eq!(info.size, 10);

        let mut object = s.open("ab/cd/ef").unwrap();
        object.seek(SeekFrom::Start(4)).unwrap();
        let mut rest = String::new();
        object.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "456789");

        let raw = s.bridge.block_on(s.store.head(&StorePath::from("lfs/ab/cd/ef")));
        assert!(raw.unwrap().is_ok());
    }

    #[test]
    fn test_multipart_save() {
        let s = storage(4);
        assert_eq!(s.save("big", &mut &b"0123456789"[..], -1).unwrap(), 10);
        let mut out = Vec::new();
        s.open("big").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"0123456789");

        // Exactly one part's worth still completes.
        assert_eq!(s.save("four", &mut &b"abcd"[..], 4).unwrap(), 4);
        assert_eq!(s.stat("four").unwrap().size, 4);
    }

    #[test]
    fn test_size_mismatch_publishes_nothing() {
        let s = storage(4);
        assert!(matches!(
            s.save("small", &mut &b"abc"[..], 5),
            Err(Error::SizeMismatch { expected: 5, actual: 3 })
        ));
        assert!(s.stat("small").unwrap_err().is_not_exist());

        assert!(matches!(
            s.save("big", &mut &b"0123456789"[..], 12),
            Err(Error::SizeMismatch { expected: 12, actual: 10 })
        ));
        assert!(s.stat("big").unwrap_err().is_not_exist());
    }

    #[test]
    fn test_missing_and_delete() {
        let s = storage(1024);
        assert!(matches!(s.open("nope"), Err(e) if e.is_not_exist()));
        s.delete("nope").unwrap();
        s.save("x", &mut &b"1"[..], 1).unwrap();
        s.delete("x").unwrap();
        assert!(s.stat("x").unwrap_err().is_not_exist());
        assert!(matches!(s.stat("../x"), Err(Error::InvalidPath(_))));
    }

    #[test]
    fn test_iterate_is_directory_scoped() {
        let s = storage(1024);
        s.save("tmp1-2/5-9.chunk", &mut &b"56789"[..], 5).unwrap();
        s.save("tmp1-2/0-4.chunk", &mut &b"01234"[..], 5).unwrap();
        s.save("tmp1-20/0-1.chunk", &mut &b"ab"[..], 2).unwrap();

        let mut seen = Vec::new();
        s.iterate_objects("tmp1-2", &mut |path, object| {
            let mut data = String::new();
            object.read_to_string(&mut data).map_err(Error::from_io)?;
            seen.push((path.to_string(), data));
            Ok(())
        })
        .unwrap();
        assert_eq!(
            seen,
            vec![
                ("tmp1-2/0-4.chunk".to_string(), "01234".to_string()),
                ("tmp1-2/5-9.chunk".to_string(), "56789".to_string()),
            ]
        );

        let mut all = 0;
        s.iterate_objects("", &mut |path, _| {
            all += 1;
            s.delete(path)
        })
        .unwrap();
        assert_eq!(all, 3);
        assert!(s.stat("tmp1-20/0-1.chunk").unwrap_err().is_not_exist());
    }

    #[test]
    fn test_url_needs_signer() {
        assert!(matches!(
            storage(1024).url("ab/cd/ef", "f", &UrlParams::default()),
            Err(Error::UrlNotSupported)
        ));
    }
}
