//! Chunked uploads and their reassembly.
//!
//! Each chunk of a logical object is stored on its own at
//! `tmp{object_id}/{start}-{end}.chunk` (inclusive end). Chunks may arrive in
//! any order and may be retried; once they cover `[0, total)` without gaps
//! they are concatenated into the final object and removed.

use std::cmp::Ordering;
use std::io::{self, Read};
use std::sync::Arc;

use crate::oid::HashingReader;
use crate::range::ContentRange;
use crate::storage::{Object, ObjectStorage};
use crate::{Error, Result};

/// Header carrying the hex SHA-256 of a chunk body.
pub const CHECKSUM_HEADER: &str = "x-checksum-sha256";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkItem {
    pub object_id: String,
    pub start: i64,
    /// Inclusive.
    pub end: i64,
    pub path: String,
}

impl ChunkItem {
    pub fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Result of checking a chunk set against the declared total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    /// Chunks to concatenate, in order.
    Complete(Vec<ChunkItem>),
    /// Contiguous bytes available from offset 0.
    Incomplete { received: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Incomplete { received: i64 },
    Merged { size: i64 },
}

fn validate_object_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'))
        && id != "."
        && id != "..";
    if !valid {
        return Err(Error::InvalidArgument(format!("invalid object id {:?}", id)));
    }
    Ok(())
}

fn chunk_prefix(object_id: &str) -> String {
    format!("tmp{}", object_id)
}

fn chunk_path(object_id: &str, start: i64, end: i64) -> String {
    format!("{}/{}-{}.chunk", chunk_prefix(object_id), start, end)
}

/// Parse `{start}-{end}.chunk`; anything else is not ours.
fn parse_chunk_name(name: &str) -> Option<(i64, i64)> {
    let (start, end) = name.strip_suffix(".chunk")?.split_once('-')?;
    let digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
    if !digits(start) || !digits(end) {
        return None;
    }
    let (start, end) = (start.parse().ok()?, end.parse().ok()?);
    (start <= end).then_some((start, end))
}

#[derive(Debug, Clone)]
pub struct ChunkStore {
    storage: Arc<dyn ObjectStorage>,
}

impl ChunkStore {
    pub fn new(storage: Arc<dyn ObjectStorage>) -> Self {
        ChunkStore { storage }
    }

    pub fn storage(&self) -> &Arc<dyn ObjectStorage> {
        &self.storage
    }

    /// Store one chunk. A body whose length differs from the range, or whose
    /// digest differs from `checksum`, leaves no chunk behind.
    pub fn save_chunk(
        &self,
        object_id: &str,
        range: &ContentRange,
        reader: &mut dyn Read,
        checksum: Option<&str>,
    ) -> Result<ChunkItem> {
        validate_object_id(object_id)?;
        range.validate()?;
        let expected = range.length();
        let path = chunk_path(object_id, range.start, range.end);

        let mut body = LimitedHashingReader {
            inner: HashingReader::new(reader),
            limit: expected,
        };
        let result = self
            .storage
            .save(&path, &mut body, expected)
            .and_then(|written| body.finish(written));
        let result = result.and_then(|()| match checksum {
            Some(want) => {
                let actual = body.inner.oid().to_hex();
                if actual.eq_ignore_ascii_case(want.trim()) {
                    Ok(())
                } else {
                    Err(Error::ChecksumMismatch {
                        expected: want.to_string(),
                        actual,
                    })
                }
            }
            None => Ok(()),
        });

        if let Err(err) = result {
            tracing::warn!(object_id, range = %range, error = %err, "chunk rejected");
            if let Err(e) = self.storage.delete(&path) {
                tracing::error!(path = %path, error = %e, "failed to delete rejected chunk");
            }
            return Err(err);
        }

        tracing::debug!(object_id, range = %range, "chunk stored");
        Ok(ChunkItem {
            object_id: object_id.to_string(),
            start: range.start,
            end: range.end,
            path,
        })
    }

    /// All chunks stored for `object_id`, unordered.
    pub fn list_chunks(&self, object_id: &str) -> Result<Vec<ChunkItem>> {
        validate_object_id(object_id)?;
        let mut chunks = Vec::new();
        self.storage
            .iterate_objects(&chunk_prefix(object_id), &mut |path, _| {
                let name = path.rsplit('/').next().unwrap_or(path);
                match parse_chunk_name(name) {
                    Some((start, end)) => chunks.push(ChunkItem {
                        object_id: object_id.to_string(),
                        start,
                        end,
                        path: path.to_string(),
                    }),
                    None => tracing::debug!(path, "ignoring foreign file in chunk directory"),
                }
                Ok(())
            })?;
        Ok(chunks)
    }

    /// Pick a gap-free sequence of chunks covering `[0, total)`.
    ///
    /// Chunks are scanned by start offset; a chunk starting before the next
    /// expected byte is a duplicate or overlap and is skipped.
    pub fn plan(mut chunks: Vec<ChunkItem>, total: i64) -> Plan {
        chunks.sort_by(|a, b| match a.start.cmp(&b.start) {
            Ordering::Equal => b.end.cmp(&a.end),
            other => other,
        });
        let mut expected_next = 0;
        let mut accepted = Vec::new();
        for chunk in chunks {
            if chunk.start > expected_next {
                break;
            }
            if chunk.start < expected_next || chunk.end >= total {
                continue;
            }
            expected_next = chunk.end + 1;
            accepted.push(chunk);
        }
        if expected_next == total && total > 0 {
            Plan::Complete(accepted)
        } else {
            Plan::Incomplete {
                received: expected_next,
            }
        }
    }

    /// Concatenate the chunks of `object_id` into `write` once they form the
    /// whole object. `write` returns the number of bytes it consumed.
    ///
    /// On success the chunks are deleted. If `write` fails or does not consume
    /// exactly `total` bytes, the chunks are kept for another attempt.
    pub fn merge<F>(&self, object_id: &str, total: i64, write: F) -> Result<MergeOutcome>
    where
        F: FnOnce(&mut dyn Read) -> Result<i64>,
    {
        let chunks = match Self::plan(self.list_chunks(object_id)?, total) {
            Plan::Complete(chunks) => chunks,
            Plan::Incomplete { received } => {
                tracing::debug!(object_id, received, total, "chunks incomplete");
                return Ok(MergeOutcome::Incomplete { received });
            }
        };

        let mut reader = ChainReader::new(self.storage.clone(), chunks);
        let written = write(&mut reader)?;
        if written != total {
            return Err(Error::SizeMismatch {
                expected: total,
                actual: written,
            });
        }

        self.discard(object_id)?;
        tracing::info!(object_id, size = total, "chunks merged");
        Ok(MergeOutcome::Merged { size: total })
    }

    /// Merge into `dest` on the same storage. A destination of the wrong
    /// size is removed.
    pub fn merge_to(&self, object_id: &str, total: i64, dest: &str) -> Result<MergeOutcome> {
        let storage = self.storage.clone();
        self.merge(object_id, total, |reader| {
            match storage.save(dest, reader, total) {
                Ok(written) if written == total => Ok(written),
                Ok(written) => {
                    storage.delete(dest)?;
                    Ok(written)
                }
                Err(err) => {
                    if let Err(e) = storage.delete(dest) {
                        tracing::error!(path = dest, error = %e, "failed to delete partial merge");
                    }
                    Err(err)
                }
            }
        })
    }

    /// Remove every file under the chunk directory of `object_id`.
    pub fn discard(&self, object_id: &str) -> Result<()> {
        validate_object_id(object_id)?;
        let mut paths = Vec::new();
        self.storage
            .iterate_objects(&chunk_prefix(object_id), &mut |path, _| {
                paths.push(path.to_string());
                Ok(())
            })?;
        for path in paths {
            self.storage.delete(&path)?;
        }
        Ok(())
    }
}

/// Hashes a chunk body and fails it once it exceeds its declared length.
struct LimitedHashingReader<'a> {
    inner: HashingReader<&'a mut dyn Read>,
    limit: i64,
}

impl LimitedHashingReader<'_> {
    fn finish(&mut self, written: i64) -> Result<()> {
        let mut extra_byte = [0u8; 1];
        let extra = self.read(&mut extra_byte).map_err(Error::from_io)?;
        let count = self.inner.count() as i64;
        if written != self.limit || count != self.limit || extra > 0 {
            return Err(Error::SizeMismatch {
                expected: self.limit,
                actual: count.max(written),
            });
        }
        Ok(())
    }
}

impl Read for LimitedHashingReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        let count = self.inner.count() as i64;
        if count > self.limit {
            return Err(Error::SizeMismatch {
                expected: self.limit,
                actual: count,
            }
            .into_io());
        }
        Ok(n)
    }
}

/// Reads a sequence of chunks back to back, opening each one only when the
/// previous one is exhausted.
pub struct ChainReader {
    storage: Arc<dyn ObjectStorage>,
    pending: std::vec::IntoIter<ChunkItem>,
    current: Option<Box<dyn Object>>,
}

impl ChainReader {
    pub fn new(storage: Arc<dyn ObjectStorage>, chunks: Vec<ChunkItem>) -> Self {
        ChainReader {
            storage,
            pending: chunks.into_iter(),
            current: None,
        }
    }
}

impl Read for ChainReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.current.is_none() {
                let Some(chunk) = self.pending.next() else {
                    return Ok(0);
                };
                let object = self.storage.open(&chunk.path).map_err(Error::into_io)?;
                self.current = Some(object);
            }
            if let Some(current) = self.current.as_mut() {
                let n = current.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
            }
            self.current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oid::Oid;
    use crate::storage::MemoryStorage;

    fn store() -> (ChunkStore, Arc<MemoryStorage>) {
        let storage = Arc::new(MemoryStorage::new());
        (ChunkStore::new(storage.clone()), storage)
    }

    fn put(cs: &ChunkStore, id: &str, data: &[u8], start: i64, total: i64) -> Result<ChunkItem> {
        let end = start + data.len() as i64 - 1;
        let range = ContentRange { start, end, total };
        cs.save_chunk(id, &range, &mut &data[..], None)
    }

    fn read_back(storage: &MemoryStorage, path: &str) -> Vec<u8> {
        let mut out = Vec::new();
        storage.open(path).unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_merge_in_reverse_order() {
        let (cs, storage) = store();
        put(&cs, "1-2", b"6789", 6, 10).unwrap();
        put(&cs, "1-2", b"345", 3, 10).unwrap();
        put(&cs, "1-2", b"012", 0, 10).unwrap();

        let outcome = cs.merge_to("1-2", 10, "out.bin").unwrap();
        assert_eq!(outcome, MergeOutcome::Merged { size: 10 });
        assert_eq!(read_back(&storage, "out.bin"), b"0123456789");
        assert!(cs.list_chunks("1-2").unwrap().is_empty());
    }

    #[test]
    fn test_duplicates_and_overlaps_skipped() {
        let (cs, storage) = store();
        put(&cs, "x", b"01234", 0, 10).unwrap();
        put(&cs, "x", b"234", 2, 10).unwrap();
        put(&cs, "x", b"56789", 5, 10).unwrap();
        put(&cs, "x", b"56789", 5, 10).unwrap();

        assert_eq!(
            cs.merge_to("x", 10, "out").unwrap(),
            MergeOutcome::Merged { size: 10 }
        );
        assert_eq!(read_back(&storage, "out"), b"0123456789");
    }

    #[test]
    fn test_gap_is_incomplete() {
        let (cs, storage) = store();
        put(&cs, "gap", b"012", 0, 10).unwrap();
        put(&cs, "gap", b"6789", 6, 10).unwrap();
        assert_eq!(
            cs.merge_to("gap", 10, "out").unwrap(),
            MergeOutcome::Incomplete { received: 3 }
        );
        assert!(storage.open("out").is_err());
        assert_eq!(cs.list_chunks("gap").unwrap().len(), 2);
    }

    #[test]
    fn test_short_body_rejected() {
        let (cs, storage) = store();
        let range = ContentRange::parse("bytes 0-9/10").unwrap();
        let err = cs
            .save_chunk("short", &range, &mut &b"01234567"[..], None)
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 10, .. }));
        assert!(storage.is_empty());
        assert_eq!(
            cs.merge_to("short", 10, "out").unwrap(),
            MergeOutcome::Incomplete { received: 0 }
        );
    }

    #[test]
    fn test_long_body_rejected() {
        let (cs, storage) = store();
        let range = ContentRange::parse("bytes 0-3/10").unwrap();
        assert!(cs
            .save_chunk("long", &range, &mut &b"0123456"[..], None)
            .is_err());
        assert!(storage.is_empty());
    }

    #[test]
    fn test_checksum() {
        let (cs, storage) = store();
        let range = ContentRange::parse("bytes 0-3/4").unwrap();
        let good = Oid::from_content(b"abcd").to_hex();
        cs.save_chunk("c", &range, &mut &b"abcd"[..], Some(&good))
            .unwrap();
        let err = cs
            .save_chunk("d", &range, &mut &b"abce"[..], Some(&good))
            .unwrap_err();
        assert!(matches!(err, Error::ChecksumMismatch { .. }));
        assert_eq!(storage.len(), 1);
    }

    #[test]
    fn test_foreign_files_ignored() {
        let (cs, storage) = store();
        put(&cs, "f", b"ab", 0, 2).unwrap();
        storage.save("tmpf/readme.txt", &mut &b"hi"[..], 2).unwrap();
        let chunks = cs.list_chunks("f").unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!((chunks[0].start, chunks[0].end), (0, 1));

        cs.merge_to("f", 2, "out").unwrap();
        assert!(storage.open("tmpf/readme.txt").is_err());
    }

    #[test]
    fn test_invalid_object_id() {
        let (cs, _) = store();
        assert!(matches!(
            put(&cs, "../etc", b"a", 0, 1),
            Err(Error::InvalidArgument(_))
        ));
        assert!(cs.list_chunks("a/b").is_err());
    }

    #[test]
    fn test_merge_size_mismatch_keeps_chunks() {
        let (cs, _) = store();
        put(&cs, "m", b"0123", 0, 4).unwrap();
        let err = cs
            .merge("m", 4, |reader| {
                let mut buf = [0u8; 2];
                reader.read_exact(&mut buf).map_err(Error::from_io)?;
                Ok(2)
            })
            .unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 4, actual: 2 }));
        assert_eq!(cs.list_chunks("m").unwrap().len(), 1);
    }

    #[test]
    fn test_plan() {
        let item = |start, end| ChunkItem {
            object_id: "p".into(),
            start,
            end,
            path: String::new(),
        };
        assert_eq!(
            ChunkStore::plan(vec![item(4, 9), item(0, 3)], 10),
            Plan::Complete(vec![item(0, 3), item(4, 9)])
        );
        assert_eq!(
            ChunkStore::plan(vec![item(0, 3)], 10),
            Plan::Incomplete { received: 4 }
        );
        assert_eq!(ChunkStore::plan(vec![], 0), Plan::Incomplete { received: 0 });
    }
}
