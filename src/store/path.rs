//! Slash-delimited absolute node paths.

use std::fmt;

use crate::store::error::StoreError;

/// An absolute path identifying one node in the remote hierarchy.
///
/// The root is `"/"`. Every other path starts with `/`, has no trailing
/// slash and no empty segments, so the parent of a path is always the
/// prefix up to its last `/`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodePath(String);

impl NodePath {
    /// The root path `"/"`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse and validate a path.
    pub fn new(path: impl Into<String>) -> Result<Self, StoreError> {
        let path = path.into();
        if path == "/" {
            return Ok(Self(path));
        }
        if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
            return Err(StoreError::InvalidPath(path));
        }
        Ok(Self(path))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// The last path segment; empty for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    /// The parent path, or `None` for the root.
    pub fn parent(&self) -> Option<NodePath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_string())),
            None => None,
        }
    }

    /// Append a single child segment.
    pub fn child(&self, name: &str) -> Result<NodePath, StoreError> {
        if name.is_empty() || name.contains('/') {
            return Err(StoreError::InvalidPath(format!("{}/{}", self.0, name)));
        }
        if self.is_root() {
            Ok(Self(format!("/{name}")))
        } else {
            Ok(Self(format!("{}/{}", self.0, name)))
        }
    }

    /// True when `self` is `other` or lies underneath it.
    pub fn starts_with(&self, other: &NodePath) -> bool {
        if other.is_root() {
            return true;
        }
        self.0 == other.0
            || (self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }

    /// Number of segments below the root.
    pub fn depth(&self) -> usize {
        if self.is_root() {
            0
        } else {
            self.0.matches('/').count()
        }
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<&str> for NodePath {
    type Error = StoreError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        NodePath::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parent_and_name() {
        let path = NodePath::new("/a/b/c").unwrap();
        assert_eq!(path.name(), "c");
        assert_eq!(path.parent().unwrap().as_str(), "/a/b");
        assert_eq!(NodePath::new("/a").unwrap().parent(), Some(NodePath::root()));
        assert_eq!(NodePath::root().parent(), None);
        assert_eq!(NodePath::root().name(), "");
    }

    #[test]
    fn test_rejects_malformed_paths() {
        for bad in ["", "a", "/a/", "/a//b"] {
            assert!(NodePath::new(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_child_from_root() {
        let root = NodePath::root();
        assert_eq!(root.child("x").unwrap().as_str(), "/x");
        assert_eq!(root.child("x").unwrap().child("y").unwrap().as_str(), "/x/y");
        assert!(root.child("a/b").is_err());
    }

    #[test]
    fn test_starts_with_respects_segments() {
        let ab = NodePath::new("/a/b").unwrap();
        assert!(ab.starts_with(&NodePath::new("/a").unwrap()));
        assert!(ab.starts_with(&NodePath::root()));
        assert!(!NodePath::new("/ab").unwrap().starts_with(&NodePath::new("/a").unwrap()));
        assert_eq!(ab.depth(), 2);
    }
}
