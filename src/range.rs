//! `Range` and `Content-Range` header values.

use std::fmt;

use crate::{Error, Result};

/// A `Range: bytes=N-[M]` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: i64,
    pub end: Option<i64>,
}

impl ByteRange {
    /// Parse a `Range` header. Values not of the form `bytes=N-[M]` return
    /// `None` and the whole object is served.
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes=")?;
        // Only the first range of a multi-range request is honoured.
        let spec = spec.split(',').next()?.trim();
        let (start, end) = spec.split_once('-')?;
        if start.is_empty() || !start.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let start = start.parse().ok()?;
        let end = match end.trim() {
            "" => None,
            e => Some(e.parse().ok()?),
        };
        Some(ByteRange { start, end })
    }

    /// Inclusive `(from, to)` within an object of `size` bytes. An end
    /// before the start or past the object is clamped to the last byte.
    pub fn resolve(&self, size: i64) -> Result<(i64, i64)> {
        if self.start >= size {
            return Err(Error::RangeNotSatisfiable {
                from: self.start,
                size,
            });
        }
        let last = size - 1;
        let to = match self.end {
            Some(end) if end >= self.start && end < last => end,
            _ => last,
        };
        Ok((self.start, to))
    }
}

/// A `Content-Range: bytes S-E/T` declaration on an uploaded chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: i64,
    /// Inclusive.
    pub end: i64,
    pub total: i64,
}

impl ContentRange {
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::InvalidRange(value.to_string());
        let spec = value.trim().strip_prefix("bytes ").ok_or_else(invalid)?;
        let (range, total) = spec.split_once('/').ok_or_else(invalid)?;
        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let number = |s: &str| -> Result<i64> {
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            s.parse().map_err(|_| invalid())
        };
        let range = ContentRange {
            start: number(start)?,
            end: number(end)?,
            total: number(total)?,
        };
        range.validate()?;
        Ok(range)
    }

    pub fn validate(&self) -> Result<()> {
        if self.start < 0 || self.end < self.start || self.end >= self.total {
            return Err(Error::InvalidRange(self.to_string()));
        }
        Ok(())
    }

    /// Number of bytes covered.
    pub fn length(&self) -> i64 {
        self.end - self.start + 1
    }
}

impl fmt::Display for ContentRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes {}-{}/{}", self.start, self.end, self.total)
    }
}
