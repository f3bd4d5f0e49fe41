//! Normalised absolute paths.

use crate::error::{FsError, FsResult};
use std::fmt;

/// Absolute, `/`-separated path without empty, `.` or `..` components.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsPath(String);

impl FsPath {
    pub fn root() -> Self {
        Self("/".to_string())
    }

    pub fn parse(raw: &str) -> FsResult<Self> {
        if raw.is_empty() {
            return Err(FsError::InvalidArgument("path is empty".into()));
        }
        if !raw.starts_with('/') {
            return Err(FsError::InvalidArgument(format!(
                "path must be absolute: {raw}"
            )));
        }
        if raw.contains('\0') {
            return Err(FsError::InvalidArgument(format!(
                "path contains NUL: {raw:?}"
            )));
        }
        let mut parts = Vec::new();
        for part in raw.split('/') {
            match part {
                "" => continue,
                "." | ".." => {
                    return Err(FsError::InvalidArgument(format!(
                        "relative component in path: {raw}"
                    )));
                }
                p => parts.push(p),
            }
        }
        Ok(Self(format!("/{}", parts.join("/"))))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    pub fn depth(&self) -> usize {
        self.components().count()
    }

    /// Last component; `None` for root.
    pub fn name(&self) -> Option<&str> {
        if self.is_root() {
            None
        } else {
            self.0.rsplit('/').next()
        }
    }

    pub fn parent(&self) -> Option<FsPath> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind('/') {
            Some(0) | None => Some(Self::root()),
            Some(n) => Some(Self(self.0[..n].to_string())),
        }
    }

    /// Appends one component; `name` must not contain `/`.
    pub fn join(&self, name: &str) -> FsPath {
        if self.is_root() {
            Self(format!("/{name}"))
        } else {
            Self(format!("{}/{name}", self.0))
        }
    }

    /// Component-wise prefix test; every path starts with itself and with root.
    pub fn starts_with(&self, other: &FsPath) -> bool {
        other.is_root()
            || self.0 == other.0
            || (self.0.starts_with(&other.0) && self.0.as_bytes().get(other.0.len()) == Some(&b'/'))
    }
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for FsPath {
    type Error = FsError;

    fn try_from(raw: &str) -> FsResult<Self> {
        Self::parse(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalisation() {
        assert_eq!(FsPath::parse("/a//b/").unwrap().as_str(), "/a/b");
        assert_eq!(FsPath::parse("///").unwrap(), FsPath::root());
        assert!(FsPath::parse("").is_err());
        assert!(FsPath::parse("a/b").is_err());
        assert!(FsPath::parse("/a/../b").is_err());
        assert!(FsPath::parse("/a/./b").is_err());
    }

    #[test]
    fn test_parent_name_join() {
        let p = FsPath::parse("/x/y/z").unwrap();
        assert_eq!(p.name(), Some("z"));
        assert_eq!(p.parent().unwrap().as_str(), "/x/y");
        assert_eq!(FsPath::parse("/x").unwrap().parent(), Some(FsPath::root()));
        assert_eq!(FsPath::root().parent(), None);
        assert_eq!(FsPath::root().name(), None);
        assert_eq!(FsPath::root().join("a").join("b").as_str(), "/a/b");
        assert_eq!(p.depth(), 3);
    }

    #[test]
    fn test_starts_with_is_component_wise() {
        let a = FsPath::parse("/tmp").unwrap();
        let b = FsPath::parse("/tmp/x").unwrap();
        let c = FsPath::parse("/tmpNew").unwrap();
        assert!(b.starts_with(&a));
        assert!(a.starts_with(&a));
        assert!(!c.starts_with(&a));
        assert!(c.starts_with(&FsPath::root()));
    }
}
