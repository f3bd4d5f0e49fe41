//! Metadata layer
//!
//! Responsibilities:
//! - Path normalisation (`path`).
//! - The inode record and client status view (`inode`).
//! - The directory tree kept in the replicated meta region, including the
//!   per-file write lock (`tree`).

pub mod inode;
pub mod path;
pub mod tree;

pub use inode::{FileKind, FileStatus, Inode, InodeId, Permission, WriteLock};
pub use path::FsPath;
pub use tree::{CreateOutcome, MetaTree, TreeDefaults};
