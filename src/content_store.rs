//! Content-addressed LFS object store on top of an [`ObjectStorage`].
//!
//! Objects live at `oid[0:2]/oid[2:4]/oid[4:]`. Every write is hashed on the
//! fly; an object whose bytes do not match its pointer is never left behind.

use std::io::{self, Read, SeekFrom};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::oid::HashingReader;
use crate::storage::{Object, ObjectStorage};
use crate::{Error, Pointer, Result};

#[derive(Debug, Clone)]
pub struct ContentStore {
    storage: Arc<dyn ObjectStorage>,
}

impl ContentStore {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        ContentStore { storage }
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    /// Open the object for `pointer`, positioned at `from`.
    pub fn get(&self, pointer: &Pointer, from: i64) -> Result<Box<dyn Object>> {
        pointer.validate()?;
        let mut object = self.storage.open(&pointer.relative_path())?;
        if from > 0 {
            if from >= pointer.size {
                return Err(Error::RangeNotSatisfiable {
                    from,
                    size: pointer.size,
                });
            }
            object.seek(SeekFrom::Start(from as u64))?;
        }
        Ok(object)
    }

    /// Store the bytes of `reader` as `pointer`.
    ///
    /// Fails with [`Error::SizeMismatch`] or [`Error::HashMismatch`] when the
    /// content does not match; in that case nothing remains at the path.
    pub fn put(&self, pointer: &Pointer, reader: &mut dyn Read) -> Result<()> {
        pointer.validate()?;
        let path = pointer.relative_path();
        let mut verifier = VerifyingReader::new(reader, pointer);

        let written = match self.storage.save(&path, &mut verifier, pointer.size) {
            Ok(written) => written,
            Err(err) => {
                // The final path may belong to a concurrent writer of the
                // same content, so it is left alone here.
                let err = verifier.verdict().unwrap_or(err);
                tracing::debug!(oid = %pointer.oid, error = %err, "object write failed");
                return Err(err);
            }
        };

        let check = if written != pointer.size {
            Err(Error::SizeMismatch {
                expected: pointer.size,
                actual: written,
            })
        } else {
            verifier.finish()
        };
        if let Err(err) = check {
            tracing::warn!(oid = %pointer.oid, error = %err, "stored object does not match pointer");
            if let Err(e) = self.storage.delete(&path) {
                tracing::error!(oid = %pointer.oid, error = %e, "failed to delete mismatched object");
            }
            return Err(err);
        }

        tracing::debug!(oid = %pointer.oid, size = pointer.size, "object stored");
        Ok(())
    }

    pub fn exists(&self, pointer: &Pointer) -> Result<bool> {
        match self.storage.stat(&pointer.relative_path()) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_exist() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether the object exists with the size recorded in `pointer`.
    pub fn verify(&self, pointer: &Pointer) -> Result<bool> {
        match self.storage.stat(&pointer.relative_path()) {
            Ok(info) => Ok(info.size == pointer.size),
            Err(e) if e.is_not_exist() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Re-read the stored object and check both its size and its digest.
    pub fn verify_content(&self, pointer: &Pointer) -> Result<bool> {
        let object = match self.storage.open(&pointer.relative_path()) {
            Ok(object) => object,
            Err(e) if e.is_not_exist() => return Ok(false),
            Err(e) => return Err(e),
        };
        let mut hashing = HashingReader::new(object);
        io::copy(&mut hashing, &mut io::sink()).map_err(Error::from_io)?;
        let (oid, count) = hashing.finish();
        Ok(count as i64 == pointer.size && oid.to_hex() == pointer.oid)
    }
}

/// Hashes and counts the stream, failing it as soon as it can no longer
/// match the expected pointer.
struct VerifyingReader<'a, R: ?Sized> {
    inner: HashingReader<&'a mut R>,
    oid: &'a str,
    size: i64,
    eof: bool,
}

impl<'a, R: Read + ?Sized> VerifyingReader<'a, R> {
    fn new(reader: &'a mut R, pointer: &'a Pointer) -> Self {
        VerifyingReader {
            inner: HashingReader::new(reader),
            oid: &pointer.oid,
            size: pointer.size,
            eof: false,
        }
    }

    fn verdict(&self) -> Option<Error> {
        let count = self.inner.count() as i64;
        if count > self.size || (self.eof && count != self.size) {
            return Some(Error::SizeMismatch {
                expected: self.size,
                actual: count,
            });
        }
        if self.eof {
            let actual = self.inner.oid().to_hex();
            if actual != self.oid {
                return Some(Error::HashMismatch {
                    expected: self.oid.to_string(),
                    actual,
                });
            }
        }
        None
    }

    /// Final check once the backend is done: the source must be exhausted
    /// and the digest must match.
    fn finish(mut self) -> Result<()> {
        if !self.eof {
            let mut extra_byte = [0u8; 1];
            self.read(&mut extra_byte).map_err(Error::from_io)?;
            if !self.eof {
                return Err(Error::SizeMismatch {
                    expected: self.size,
                    actual: self.size + 1,
                });
            }
        }
        match self.verdict() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl<R: Read + ?Sized> Read for VerifyingReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if n == 0 && !buf.is_empty() {
            self.eof = true;
        }
        match self.verdict() {
            Some(err) => Err(err.into_io()),
            None => Ok(n),
        }
    }
}

/// Reader that fails with [`Error::Cancelled`] once its token is cancelled.
pub struct Cancellable<R> {
    inner: R,
    token: CancellationToken,
}

impl<R> Cancellable<R> {
    pub fn new(inner: R, token: CancellationToken) -> Self {
        Cancellable { inner, token }
    }
}

impl<R: Read> Read for Cancellable<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled.into_io());
        }
        self.inner.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{LocalStorage, MemoryStorage};

    fn store() -> (ContentStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (ContentStore::new(storage.clone()), storage)
    }

    #[test]
    fn test_put_get_round_trip() {
        let (cs, _) = store();
        let p = Pointer::from_content(b"0123456789");
        cs.put(&p, &mut &b"0123456789"[..]).unwrap();

        let mut out = String::new();
        cs.get(&p, 0).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "0123456789");

        out.clear();
        cs.get(&p, 5).unwrap().read_to_string(&mut out).unwrap();
        assert_eq!(out, "56789");
    }

    #[test]
    fn test_get_out_of_range() {
        let (cs, _) = store();
        let p = Pointer::from_content(b"abc");
        cs.put(&p, &mut &b"abc"[..]).unwrap();
        assert!(matches!(
            cs.get(&p, 3),
            Err(Error::RangeNotSatisfiable { from: 3, size: 3 })
        ));
    }

    #[test]
    fn test_put_rejects_invalid_pointer() {
        let (cs, storage) = store();
        let p = Pointer::new("not-an-oid", 3);
        assert!(matches!(
            cs.put(&p, &mut &b"abc"[..]),
            Err(Error::InvalidPointer(_))
        ));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_put_wrong_content_leaves_nothing() {
        let (cs, storage) = store();
        let p = Pointer::from_content(b"expected");
        let err = cs.put(&p, &mut &b"whatever"[..]).unwrap_err();
        assert!(matches!(err, Error::HashMismatch { .. }));
        assert!(!cs.exists(&p).unwrap());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_put_short_and_long_bodies() {
        let (cs, _) = store();
        let p = Pointer::from_content(b"0123456789");
        let err = cs.put(&p, &mut &b"01234567"[..]).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 10, actual: 8 }));

        let err = cs.put(&p, &mut &b"0123456789AB"[..]).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 10, .. }));
        assert!(!cs.exists(&p).unwrap());
    }

    #[test]
    fn test_put_local_publishes_nothing_on_mismatch() {
        let td = tempfile::TempDir::new().unwrap();
        let cs = ContentStore::new(Arc::new(LocalStorage::new(td.path(), None).unwrap()));
        let p = Pointer::from_content(b"good data");
        assert!(cs.put(&p, &mut &b"bad! data"[..]).is_err());
        assert!(!td.path().join(p.relative_path()).exists());

        cs.put(&p, &mut &b"good data"[..]).unwrap();
        assert!(td.path().join(p.relative_path()).exists());
    }

    #[test]
    fn test_verify() {
        let (cs, storage) = store();
        let p = Pointer::from_content(b"hello");
        assert!(!cs.verify(&p).unwrap());
        cs.put(&p, &mut &b"hello"[..]).unwrap();
        assert!(cs.verify(&p).unwrap());
        assert!(!cs.verify(&Pointer::new(p.oid.clone(), 4)).unwrap());
        assert!(cs.verify_content(&p).unwrap());

        // Corrupt the stored bytes behind the store's back.
        storage
            .save(&p.relative_path(), &mut &b"jello"[..], 5)
            .unwrap();
        assert!(cs.verify(&p).unwrap());
        assert!(!cs.verify_content(&p).unwrap());
    }

    #[test]
    fn test_cancelled_put_fails() {
        let (cs, _) = store();
        let p = Pointer::from_content(b"data");
        let token = CancellationToken::new();
        token.cancel();
        let mut reader = Cancellable::new(&b"data"[..], token);
        assert!(matches!(cs.put(&p, &mut reader), Err(Error::Cancelled)));
        assert!(!cs.exists(&p).unwrap());
    }
}
