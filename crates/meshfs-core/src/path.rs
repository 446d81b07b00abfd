//! Paths inside the replicated tree.
//!
//! Paths are absolute, `/`-separated and relative to the sync root. They
//! never contain `.` or `..` components, so a path received from a peer can
//! be joined onto a local directory without escaping it.

use crate::error::{CoreError, Result};

/// The root of the replicated tree.
pub const ROOT: &str = "/";

/// Normalize a tree path: collapse repeated separators, strip the trailing
/// separator and reject `.`/`..` components.
pub fn normalize(path: &str) -> Result<String> {
    let mut out = String::with_capacity(path.len() + 1);
    for component in path.split('/').filter(|c| !c.is_empty()) {
        if component == "." || component == ".." || component.contains('\0') {
            return Err(CoreError::InvalidPath(path.to_string()));
        }
        out.push('/');
        out.push_str(component);
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

/// Parent directory of a normalized path; `None` for the root.
pub fn parent_of(path: &str) -> Option<&str> {
    if path == ROOT {
        return None;
    }
    match path.rfind('/') {
        Some(0) => Some(ROOT),
        Some(idx) => Some(&path[..idx]),
        None => Some(ROOT),
    }
}

/// Last component of a normalized path; empty for the root.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or("")
}

/// Join a directory and a single child name.
pub fn join(dir: &str, name: &str) -> Result<String> {
    if name.is_empty() || name.contains('/') {
        return Err(CoreError::InvalidPath(format!("{}/{}", dir, name)));
    }
    normalize(&format!("{}/{}", dir, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("a//b/").unwrap(), "/a/b");
        assert_eq!(normalize("/").unwrap(), "/");
        assert_eq!(normalize("").unwrap(), "/");
        assert!(normalize("/a/../etc").is_err());
        assert!(normalize("./a").is_err());
    }

    #[test]
    fn test_parent_and_name() {
        assert_eq!(parent_of("/a/b"), Some("/a"));
        assert_eq!(parent_of("/a"), Some("/"));
        assert_eq!(parent_of("/"), None);
        assert_eq!(file_name("/a/b.txt"), "b.txt");
        assert_eq!(file_name("/"), "");
    }

    #[test]
    fn test_join() {
        assert_eq!(join("/", "x").unwrap(), "/x");
        assert_eq!(join("/a", "x").unwrap(), "/a/x");
        assert!(join("/a", "x/y").is_err());
        assert!(join("/a", "..").is_err());
    }
}
