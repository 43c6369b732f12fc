//! LFS Object ID (OID) - SHA256 content hash.

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};

/// LFS Object ID - a SHA256 hash of the file content.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Oid {
    bytes: [u8; 32],
}

impl Oid {
    /// Compute the OID (SHA256 hash) of content.
    pub fn from_content(content: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(content);
        Oid::from_hasher(hasher)
    }

    fn from_hasher(hasher: Sha256) -> Self {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hasher.finalize());
        Oid { bytes }
    }

    /// Get the OID as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.bytes)
    }
}

/// Returns true when `s` consists only of `[0-9a-f]`.
pub(crate) fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oid({})", self.to_hex())
    }
}

/// Reader adapter that hashes and counts the bytes passing through it.
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        HashingReader {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    /// Bytes read so far.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Digest of the bytes read so far, without consuming the reader.
    pub fn oid(&self) -> Oid {
        Oid::from_hasher(self.hasher.clone())
    }

    /// Consume the reader and return the final digest and byte count.
    pub fn finish(self) -> (Oid, u64) {
        (Oid::from_hasher(self.hasher), self.count)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_from_content() {
        let content = b"Hello, World!";
        let oid = Oid::from_content(content);
        // SHA256 of "Hello, World!"
        assert_eq!(
            oid.to_hex(),
            "dffd6021bb2bd5b0af676290809ec3a53191dd81c7f70a4b28688a362182986f"
        );
    }

    #[test]
    fn test_hashing_reader_matches_from_content() {
        let content = b"streamed content".repeat(1000);
        let mut reader = HashingReader::new(&content[..]);
        io::copy(&mut reader, &mut io::sink()).unwrap();
        let (oid, size) = reader.finish();
        assert_eq!(oid, Oid::from_content(&content));
        assert_eq!(size, content.len() as u64);
    }

    #[test]
    fn test_lower_hex() {
        assert!(is_lower_hex("0123456789abcdef"));
        assert!(!is_lower_hex("ABCDEF"));
        assert!(!is_lower_hex("xyz"));
    }

    #[test]
    fn test_hashing_reader_partial_digest() {
        let mut reader = HashingReader::new(&b"0123456789"[..]);
        let mut buf = [0u8; 5];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(reader.count(), 5);
        assert_eq!(reader.oid(), Oid::from_content(b"01234"));
    }
}
