//! Path normalization shared by all backends.

use crate::{Error, Result};

/// Normalize a slash separated storage path.
///
/// Backslashes become slashes, empty and `.` segments are dropped and `..`
/// removes the previous segment. A `..` with nothing left to remove would
/// escape the backend root and is rejected rather than clamped.
pub fn normalize(path: &str) -> Result<String> {
    let path = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Error::InvalidPath(path.clone()));
                }
            }
            s => parts.push(s),
        }
    }
    Ok(parts.join("/"))
}

/// Normalize a path naming an object; the result is never empty.
pub fn object_path(path: &str) -> Result<String> {
    let normalized = normalize(path)?;
    if normalized.is_empty() {
        return Err(Error::InvalidPath(format!("empty object path {:?}", path)));
    }
    Ok(normalized)
}

/// Join a backend base path and a normalized relative path.
pub fn join(base: &str, rel: &str) -> String {
    let base = base.trim_matches('/');
    match (base.is_empty(), rel.is_empty()) {
        (true, _) => rel.to_string(),
        (false, true) => base.to_string(),
        (false, false) => format!("{}/{}", base, rel),
    }
}

/// Listing prefix for the directory `prefix` below `base`: always ends in `/`
/// unless it selects everything.
pub fn dir_prefix(base: &str, prefix: &str) -> Result<String> {
    let joined = join(base, &normalize(prefix)?);
    if joined.is_empty() {
        Ok(joined)
    } else {
        Ok(format!("{}/", joined))
    }
}

/// Strip the backend base path from a full key.
pub fn strip_base<'a>(base: &str, key: &'a str) -> &'a str {
    let base = base.trim_matches('/');
    if base.is_empty() {
        return key;
    }
    key.strip_prefix(base)
        .and_then(|rest| rest.strip_prefix('/'))
        .unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a/b/c").unwrap(), "a/b/c");
        assert_eq!(normalize("/a//b/./c/").unwrap(), "a/b/c");
        assert_eq!(normalize("a\\b\\c").unwrap(), "a/b/c");
        assert_eq!(normalize("a/b/../c").unwrap(), "a/c");
        assert_eq!(normalize("").unwrap(), "");
    }

    #[test]
    fn test_normalize_rejects_escape() {
        assert!(matches!(normalize("../etc/passwd"), Err(Error::InvalidPath(_))));
        assert!(matches!(normalize("a/../../b"), Err(Error::InvalidPath(_))));
        assert!(object_path("a/..").is_err());
    }

    #[test]
    fn test_dir_prefix_and_strip() {
        assert_eq!(dir_prefix("lfs", "tmp1-2").unwrap(), "lfs/tmp1-2/");
        assert_eq!(dir_prefix("", "").unwrap(), "");
        assert_eq!(dir_prefix("/base/", "").unwrap(), "base/");
        assert_eq!(strip_base("base", "base/ab/cd"), "ab/cd");
        assert_eq!(strip_base("", "ab/cd"), "ab/cd");
    }
}
