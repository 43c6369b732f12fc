//! Local filesystem backend.
//!
//! Objects live under a base directory. Writes stream into a temp file in a
//! separate temp directory and are renamed into place, so a reader never
//! observes a partially written object.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tempfile::NamedTempFile;
use url::Url;
use walkdir::WalkDir;

use super::path::{normalize, object_path};
use super::{FileInfo, Object, ObjectStorage, StorageType, UrlParams, VisitFn};
use crate::{Error, Result};

/// Name of the default temp directory below the base directory.
const TMP_DIR_NAME: &str = ".tmp";

#[derive(Debug)]
pub struct LocalStorage {
    dir: PathBuf,
    tmp_dir: PathBuf,
}

impl LocalStorage {
    /// Create a backend rooted at `dir`, creating it if needed.
    ///
    /// Temp files go to `tmp_dir`, or `<dir>/.tmp` when not given. The temp
    /// directory should be on the same filesystem so the final rename is atomic.
    pub fn new<P: AsRef<Path>>(dir: P, tmp_dir: Option<&Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let tmp_dir = tmp_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| dir.join(TMP_DIR_NAME));
        Ok(LocalStorage { dir, tmp_dir })
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        Ok(self.dir.join(object_path(path)?))
    }

    /// Remove empty directories between `path` and the base directory.
    fn prune_empty_parents(&self, path: &Path) {
        let mut current = path.parent();
        while let Some(dir) = current {
            if dir == self.dir || !dir.starts_with(&self.dir) {
                break;
            }
            if fs::remove_dir(dir).is_err() {
                break;
            }
            current = dir.parent();
        }
    }

    fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.dir).ok()?;
        let parts: Vec<_> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }
}

fn file_info(path: &Path, meta: &fs::Metadata) -> FileInfo {
    let mod_time = meta
        .modified()
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    FileInfo {
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        size: meta.len() as i64,
        mod_time,
        is_dir: meta.is_dir(),
    }
}

fn not_exist(path: &str, err: io::Error) -> Error {
    if err.kind() == io::ErrorKind::NotFound {
        Error::NotExist(path.to_string())
    } else {
        Error::Io(err)
    }
}

impl ObjectStorage for LocalStorage {
    fn open(&self, path: &str) -> Result<Box<dyn Object>> {
        let full = self.resolve(path)?;
        let file = File::open(&full).map_err(|e| not_exist(path, e))?;
        Ok(Box::new(LocalObject { file, path: full }))
    }

    fn save(&self, path: &str, reader: &mut dyn Read, size: i64) -> Result<i64> {
        let full = self.resolve(path)?;
        fs::create_dir_all(&self.tmp_dir)?;

        // Dropping the temp file on any early return removes it.
        let mut tmp = NamedTempFile::new_in(&self.tmp_dir)?;
        let written = io::copy(reader, tmp.as_file_mut()).map_err(Error::from_io)? as i64;
        if size >= 0 && written != size {
            return Err(Error::SizeMismatch {
                expected: size,
                actual: written,
            });
        }
        tmp.as_file().sync_all()?;

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        tmp.persist(&full).map_err(|e| Error::Io(e.error))?;
        tracing::trace!(path, written, "local object saved");
        Ok(written)
    }

    fn stat(&self, path: &str) -> Result<FileInfo> {
        let full = self.resolve(path)?;
        let meta = fs::metadata(&full).map_err(|e| not_exist(path, e))?;
        Ok(file_info(&full, &meta))
    }

    fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full) {
            Ok(()) => {
                self.prune_empty_parents(&full);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn url(&self, _path: &str, _name: &str, _params: &UrlParams) -> Result<Url> {
        Err(Error::UrlNotSupported)
    }

    fn iterate_objects(&self, prefix: &str, visit: &mut VisitFn<'_>) -> Result<()> {
        let root = self.dir.join(normalize(prefix)?);
        if !root.is_dir() {
            return Ok(());
        }
        for path in walk_files(&root, &self.tmp_dir)? {
            let Some(rel) = self.relative(&path) else {
                continue;
            };
            let file = match File::open(&path) {
                Ok(file) => file,
                // Deleted since the directory was read.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Error::Io(e)),
            };
            let mut object = LocalObject { file, path };
            visit(&rel, &mut object)?;
        }
        Ok(())
    }

    fn kind(&self) -> StorageType {
        StorageType::Local
    }
}

/// Collect all file paths below `base`, skipping `skip`, in sorted order.
fn walk_files(base: &Path, skip: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(base)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| entry.path() != skip);
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            // Removed while walking.
            Err(e) if e.io_error().map(io::Error::kind) == Some(io::ErrorKind::NotFound) => {
                continue
            }
            Err(e) => return Err(Error::Io(e.into())),
        };
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

struct LocalObject {
    file: File,
    path: PathBuf,
}

impl Read for LocalObject {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Seek for LocalObject {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

impl Object for LocalObject {
    fn stat(&self) -> Result<FileInfo> {
        let meta = self.file.metadata()?;
        Ok(file_info(&self.path, &meta))
    }
}
