//! Helpers shared by the remote backends.

use std::io::{self, Read, Seek, SeekFrom};
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::{FileInfo, Object};
use crate::{Error, Result};

/// Body reader returned by a ranged GET.
pub(crate) type Body = Box<dyn Read + Send + 'static>;

/// Opens a body starting at the given byte offset.
pub(crate) type FetchFn = Box<dyn Fn(u64) -> Result<Body> + Send>;

/// A remote object read through ranged GETs.
///
/// No request is made until the first read; seeking drops the current body
/// and the next read starts a new ranged request at the new offset.
pub(crate) struct RemoteObject {
    info: FileInfo,
    fetch: FetchFn,
    offset: u64,
    body: Option<Body>,
}

impl RemoteObject {
    pub(crate) fn new(info: FileInfo, fetch: FetchFn) -> Self {
        RemoteObject {
            info,
            fetch,
            offset: 0,
            body: None,
        }
    }

    fn size(&self) -> u64 {
        self.info.size.max(0) as u64
    }
}

impl Read for RemoteObject {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.offset >= self.size() {
            return Ok(0);
        }
        if self.body.is_none() {
            self.body = Some((self.fetch)(self.offset).map_err(Error::into_io)?);
        }
        let n = match self.body.as_mut() {
            Some(body) => body.read(buf)?,
            None => 0,
        };
        self.offset += n as u64;
        Ok(n)
    }
}

impl Seek for RemoteObject {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(n) => Some(n),
            SeekFrom::Current(delta) => self.offset.checked_add_signed(delta),
            SeekFrom::End(delta) => self.size().checked_add_signed(delta),
        };
        let target = target.ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek before start of object")
        })?;
        if target != self.offset {
            self.body = None;
            self.offset = target;
        }
        Ok(target)
    }
}

impl Object for RemoteObject {
    fn stat(&self) -> Result<FileInfo> {
        Ok(self.info.clone())
    }
}

/// Fill `buf` with up to `limit` bytes from `reader`; returns bytes read.
/// Fewer than `limit` bytes means the reader is exhausted.
pub(crate) fn read_part(reader: &mut dyn Read, buf: &mut Vec<u8>, limit: usize) -> Result<usize> {
    buf.clear();
    Read::take(&mut *reader, limit as u64)
        .read_to_end(buf)
        .map_err(Error::from_io)
}

/// Parse an RFC 3339 timestamp as returned by the JSON APIs.
pub(crate) fn parse_rfc3339(value: Option<&str>) -> DateTime<Utc> {
    value
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Last path component of a key.
pub(crate) fn base_name(key: &str) -> String {
    key.rsplit('/').next().unwrap_or(key).to_string()
}

/// Shared ureq agent for storage backends.
pub(crate) fn agent() -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(30))
        .redirects(0)
        .build()
}

/// Resumable upload session as used by Drive: chunks are PUT to the
/// session URL with `Content-Range`, intermediate chunks answer 308.
pub(crate) struct ResumableUpload<'a> {
    pub agent: &'a ureq::Agent,
    pub session: &'a str,
    pub bearer: &'a str,
    pub chunk_size: usize,
}

impl ResumableUpload<'_> {
    /// Stream the whole reader; returns bytes written. `size` may be `-1`.
    pub(crate) fn upload(&self, reader: &mut dyn Read, size: i64) -> Result<i64> {
        let mut current = Vec::with_capacity(self.chunk_size);
        let mut next = Vec::with_capacity(self.chunk_size);
        read_part(reader, &mut current, self.chunk_size)?;
        let mut offset: u64 = 0;

        loop {
            // Look ahead one chunk so the final chunk carries the total size.
            let last = current.len() < self.chunk_size || {
                read_part(reader, &mut next, self.chunk_size)? == 0
            };
            let end = offset + current.len() as u64;
            let range = match (last, current.is_empty()) {
                (true, true) => format!("bytes */{}", end),
                (true, false) => format!("bytes {}-{}/{}", offset, end - 1, end),
                (false, _) => format!("bytes {}-{}/*", offset, end - 1),
            };
            if last && size >= 0 && end as i64 != size {
                return Err(Error::SizeMismatch {
                    expected: size,
                    actual: end as i64,
                });
            }

            let response = self
                .agent
                .put(self.session)
                .set("Authorization", &format!("Bearer {}", self.bearer))
                .set("Content-Range", &range)
                .send_bytes(&current)?;
            let status = response.status();
            if last {
                if !(200..300).contains(&status) {
                    return Err(Error::Storage(format!(
                        "resumable upload finished with status {}",
                        status
                    )));
                }
                return Ok(end as i64);
            }
            if status != 308 {
                return Err(Error::Storage(format!(
                    "resumable upload chunk answered {}",
                    status
                )));
            }
            offset = end;
            std::mem::swap(&mut current, &mut next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn object(data: &'static [u8], calls: Arc<AtomicUsize>) -> RemoteObject {
        let info = FileInfo {
            name: "obj".into(),
            size: data.len() as i64,
            mod_time: Utc::now(),
            is_dir: false,
        };
        RemoteObject::new(
            info,
            Box::new(move |offset| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Box::new(&data[offset as usize..]) as Body)
            }),
        )
    }

    #[test]
    fn test_lazy_ranged_reads() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut obj = object(b"0123456789", calls.clone());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        obj.seek(SeekFrom::Start(5)).unwrap();
        let mut out = String::new();
        obj.read_to_string(&mut out).unwrap();
        assert_eq!(out, "56789");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        obj.seek(SeekFrom::End(-3)).unwrap();
        out.clear();
        obj.read_to_string(&mut out).unwrap();
        assert_eq!(out, "789");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_seek_before_start_fails() {
        let mut obj = object(b"abc", Arc::new(AtomicUsize::new(0)));
        assert!(obj.seek(SeekFrom::Current(-1)).is_err());
    }

    #[test]
    fn test_read_part() {
        let mut reader: &[u8] = b"abcdefg";
        let mut buf = Vec::new();
        assert_eq!(read_part(&mut reader, &mut buf, 4).unwrap(), 4);
        assert_eq!(buf, b"abcd");
        assert_eq!(read_part(&mut reader, &mut buf, 4).unwrap(), 3);
        assert_eq!(read_part(&mut reader, &mut buf, 4).unwrap(), 0);
    }
}
