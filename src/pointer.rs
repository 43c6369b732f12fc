//! LFS pointers.
//!
//! A pointer identifies a logical LFS object by `(oid, size)`.

use serde::{Deserialize, Serialize};

use crate::oid::is_lower_hex;
use crate::{Error, Oid, Result};

/// An LFS pointer: the SHA256 OID of the content and its size in bytes.
///
/// Pointers received from clients may be invalid; check [`Pointer::is_valid`]
/// before trusting one. Invalid pointers are never written to storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pointer {
    pub oid: String,
    pub size: i64,
}

impl Pointer {
    /// Create a new pointer with the given OID and size.
    pub fn new(oid: impl Into<String>, size: i64) -> Self {
        Pointer {
            oid: oid.into(),
            size,
        }
    }

    /// Create a pointer from file content.
    pub fn from_content(content: &[u8]) -> Self {
        Pointer {
            oid: Oid::from_content(content).to_hex(),
            size: content.len() as i64,
        }
    }

    /// A pointer is valid when its OID is 64 lowercase hex chars and its size
    /// is not negative.
    pub fn is_valid(&self) -> bool {
        self.oid.len() == 64 && is_lower_hex(&self.oid) && self.size >= 0
    }

    /// Fail with [`Error::InvalidPointer`] unless the pointer is valid.
    pub fn validate(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(Error::InvalidPointer(format!(
                "oid {:?} size {}",
                self.oid, self.size
            )))
        }
    }

    /// Storage path relative to the backend root: `ab/cd/ef0123...`.
    ///
    /// OIDs of four characters or fewer have no final segment and are used
    /// as-is.
    pub fn relative_path(&self) -> String {
        if self.oid.len() < 5 {
            return self.oid.clone();
        }
        format!("{}/{}/{}", &self.oid[0..2], &self.oid[2..4], &self.oid[4..])
    }
}

impl std::fmt::Display for Pointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.oid, self.size)
    }
}
