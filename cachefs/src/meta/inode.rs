//! Inode record stored in the meta region, plus the status view handed to clients.

use super::path::FsPath;
use crate::error::{FsError, FsResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub type InodeId = Uuid;

/// Root directory id; every other inode gets a random v4 id.
pub const ROOT_ID: InodeId = Uuid::nil();

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileKind {
    File,
    Directory,
}

/// POSIX-style permission bits (`0o7777` mask).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(u16);

impl Permission {
    pub const DEFAULT: Permission = Permission(0o777);

    pub fn new(mode: u16) -> FsResult<Self> {
        if mode > 0o7777 {
            return Err(FsError::InvalidArgument(format!(
                "permission out of range: {mode:o}"
            )));
        }
        Ok(Self(mode))
    }

    pub fn mode(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

/// Exclusive write lock recorded on a file inode.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteLock {
    pub session: Uuid,
    pub handle: Uuid,
    pub since: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub id: InodeId,
    pub kind: FileKind,
    pub length: u64,
    /// Colocates the file's blocks; regenerated when a file is overwritten.
    pub block_group_id: Uuid,
    pub permission: Permission,
    pub owner: String,
    pub group: String,
    pub access_time: i64,
    pub modification_time: i64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, InodeId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<WriteLock>,
}

impl Inode {
    fn with_kind(
        id: InodeId,
        kind: FileKind,
        permission: Permission,
        owner: &str,
        group: &str,
    ) -> Self {
        let now = now_millis();
        Self {
            id,
            kind,
            length: 0,
            block_group_id: Uuid::new_v4(),
            permission,
            owner: owner.to_string(),
            group: group.to_string(),
            access_time: now,
            modification_time: now,
            children: BTreeMap::new(),
            lock: None,
        }
    }

    pub fn new_file(permission: Permission, owner: &str, group: &str) -> Self {
        Self::with_kind(Uuid::new_v4(), FileKind::File, permission, owner, group)
    }

    pub fn new_directory(permission: Permission, owner: &str, group: &str) -> Self {
        Self::with_kind(Uuid::new_v4(), FileKind::Directory, permission, owner, group)
    }

    pub fn root(permission: Permission, owner: &str, group: &str) -> Self {
        Self::with_kind(ROOT_ID, FileKind::Directory, permission, owner, group)
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn is_file(&self) -> bool {
        self.kind == FileKind::File
    }
}

/// Client-facing snapshot of a path's metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileStatus {
    pub path: FsPath,
    /// `None` for entries served by the secondary filesystem.
    pub id: Option<InodeId>,
    pub kind: FileKind,
    pub length: u64,
    pub block_size: u64,
    pub permission: Permission,
    pub owner: String,
    pub group: String,
    pub access_time: i64,
    pub modification_time: i64,
}

impl FileStatus {
    pub fn from_inode(path: FsPath, inode: &Inode, block_size: u64) -> Self {
        Self {
            path,
            id: Some(inode.id),
            kind: inode.kind,
            length: inode.length,
            block_size,
            permission: inode.permission,
            owner: inode.owner.clone(),
            group: inode.group.clone(),
            access_time: inode.access_time,
            modification_time: inode.modification_time,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }
}

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_bounds() {
        assert!(Permission::new(0o644).is_ok());
        assert!(Permission::new(0o17777).is_err());
        assert_eq!(Permission::new(0o644).unwrap().to_string(), "0644");
    }

    #[test]
    fn test_record_encoding_omits_empty_fields() {
        let file = Inode::new_file(Permission::DEFAULT, "u", "g");
        let raw = serde_json::to_string(&file).unwrap();
        assert!(!raw.contains("children"));
        assert!(!raw.contains("lock"));
        let back: Inode = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, file);
    }
}
