//! Responses of the transfer protocol.

use std::io::Write;

use chrono::SecondsFormat;

use super::pktline::PktWriter;
use crate::lock::Lock;
use crate::{Error, Result};

/// A `status <code>` response with its arguments and optional data lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub code: u16,
    pub args: Vec<String>,
    /// Sent after a delimiter when present.
    pub lines: Option<Vec<String>>,
}

impl Status {
    pub fn new(code: u16) -> Self {
        Status {
            code,
            args: Vec::new(),
            lines: None,
        }
    }

    pub fn ok() -> Self {
        Status::new(200)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn lines(mut self, lines: Vec<String>) -> Self {
        self.lines = Some(lines);
        self
    }

    /// Error status carrying a one-line message.
    pub fn error(code: u16, message: impl Into<String>) -> Self {
        Status::new(code).lines(vec![message.into()])
    }

    pub fn lock(code: u16, lock: &Lock) -> Self {
        Status {
            code,
            args: lock_args(lock),
            lines: None,
        }
    }

    pub fn write<W: Write>(&self, writer: &mut PktWriter<W>) -> Result<()> {
        writer.write_line(&format!("status {}", self.code))?;
        for arg in &self.args {
            writer.write_line(arg)?;
        }
        if let Some(lines) = &self.lines {
            writer.write_delim()?;
            for line in lines {
                writer.write_line(line)?;
            }
        }
        writer.write_flush()
    }
}

/// Protocol status code of an error. Framing errors have none; they end the
/// session.
pub fn status_code(err: &Error) -> Option<u16> {
    let code = match err {
        Error::Protocol(_) => return None,
        Error::InvalidPointer(_)
        | Error::InvalidRange(_)
        | Error::InvalidPath(_)
        | Error::InvalidArgument(_)
        | Error::RangeNotSatisfiable { .. } => 400,
        Error::SizeMismatch { .. }
        | Error::HashMismatch { .. }
        | Error::ChecksumMismatch { .. }
        | Error::TooLarge { .. } => 422,
        Error::Unauthorized(_) | Error::PermissionDenied(_) => 403,
        Error::NotFound(_) | Error::NotExist(_) => 404,
        Error::LockConflict(_) => 409,
        _ => 500,
    };
    Some(code)
}

/// Client-facing message of an error.
pub fn message(err: &Error) -> String {
    match err {
        Error::HashMismatch { .. } | Error::ChecksumMismatch { .. } => "corrupt data".into(),
        Error::SizeMismatch { .. } => "size mismatch".into(),
        Error::NotFound(_) | Error::NotExist(_) => "not found".into(),
        Error::Storage(_) | Error::Io(_) | Error::Json(_) => "internal error".into(),
        other => other.to_string(),
    }
}

fn timestamp(lock: &Lock) -> String {
    lock.locked_at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// `id=`, `path=`, `locked-at=`, `ownername=` arguments describing a lock.
pub fn lock_args(lock: &Lock) -> Vec<String> {
    vec![
        format!("id={}", lock.id),
        format!("path={}", lock.path),
        format!("locked-at={}", timestamp(lock)),
        format!("ownername={}", lock.owner_name),
    ]
}

/// `list-lock` data lines describing a lock.
pub fn lock_lines(lock: &Lock, ours: bool) -> Vec<String> {
    let id = lock.id;
    vec![
        format!("lock {}", id),
        format!("path {} {}", id, lock.path),
        format!("locked-at {} {}", id, timestamp(lock)),
        format!("ownername {} {}", id, lock.owner_name),
        format!("owner {} {}", id, if ours { "ours" } else { "theirs" }),
    ]
}
