//! In-memory backend, for tests and throwaway development servers.

use std::collections::BTreeMap;
use std::io::{self, Cursor, Read, Seek, SeekFrom};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use url::Url;

use super::path::{dir_prefix, object_path};
use super::{FileInfo, Object, ObjectStorage, StorageType, UrlParams, VisitFn};
use crate::{Error, Result};

/// Upper bound on the buffer reserved up front from a caller-supplied size.
const MAX_PREALLOC: i64 = 1 << 20;

#[derive(Debug, Clone)]
struct Entry {
    data: Bytes,
    mod_time: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: RwLock<BTreeMap<String, Entry>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    fn entry(&self, path: &str) -> Result<(String, Entry)> {
        let key = object_path(path)?;
        let entry = self
            .objects
            .read()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::NotExist(path.to_string()))?;
        Ok((key, entry))
    }
}

fn info(key: &str, entry: &Entry) -> FileInfo {
    FileInfo {
        name: key.rsplit('/').next().unwrap_or(key).to_string(),
        size: entry.data.len() as i64,
        mod_time: entry.mod_time,
        is_dir: false,
    }
}

impl ObjectStorage for MemoryStorage {
    fn open(&self, path: &str) -> Result<Box<dyn Object>> {
        let (key, entry) = self.entry(path)?;
        Ok(Box::new(MemoryObject {
            info: info(&key, &entry),
            cursor: Cursor::new(entry.data),
        }))
    }

    fn save(&self, path: &str, reader: &mut dyn Read, size: i64) -> Result<i64> {
        let key = object_path(path)?;
        let mut data = Vec::with_capacity(size.clamp(0, MAX_PREALLOC) as usize);
        reader.read_to_end(&mut data).map_err(Error::from_io)?;
        let written = data.len() as i64;
        if size >= 0 && written != size {
            return Err(Error::SizeMismatch {
                expected: size,
                actual: written,
            });
        }
        self.objects.write().insert(
            key,
            Entry {
                data: Bytes::from(data),
                mod_time: Utc::now(),
            },
        );
        Ok(written)
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let (key, entry) = self.entry(path)?;
        Ok(info(&key, &entry))
    }

    fn delete(&self, path: &str) -> Result<()> {
        let key = object_path(path)?;
        self.objects.write().remove(&key);
        Ok(())
    }

    fn url(&self, _path: &str, _name: &str, _params: &UrlParams) -> Result<Url> {
        Err(Error::UrlNotSupported)
    }

    fn iterate_objects(&self, prefix: &str, visit: &mut VisitFn<'_>) -> Result<()> {
        let prefix = dir_prefix("", prefix)?;
        // Snapshot so `visit` may write to or delete from this backend.
        let entries: Vec<(String, Entry)> = self
            .objects
            .read()
            .range(prefix.clone()..)
            .take_while(|(key, _)| key.starts_with(&prefix))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();

        for (key, entry) in entries {
            let mut object = MemoryObject {
                info: info(&key, &entry),
                cursor: Cursor::new(entry.data),
            };
            visit(&key, &mut object)?;
        }
        Ok(())
    }

    fn kind(&self) -> StorageType {
        StorageType::Memory
    }
}

struct MemoryObject {
    info: FileInfo,
    cursor: Cursor<Bytes>,
}

impl Read for MemoryObject {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryObject {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl Object for MemoryObject {
    fn stat(&self) -> Result<FileInfo> {
        Ok(self.info.clone())
    }
}
