//! Secondary filesystem delegate
//!
//! Responsibilities:
//! - Describe the stream-oriented filesystem that backs PROXY and DUAL paths
//!   (`SecondaryFs`).
//! - Provide read-through and write-through entry points used by the vfs
//!   layer (`SecondaryDelegate`).
//!
//! Submodules:
//! - `local`: a secondary rooted in a local directory

pub mod local;

use crate::error::{FsError, FsResult};
use crate::meta::inode::{FileKind, FileStatus, Permission};
use crate::meta::path::FsPath;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncSeek, AsyncWrite};

pub use local::LocalDirSecondary;

/// Seekable byte source handed out by `SecondaryFs::open`.
pub trait SecondaryRead: AsyncRead + AsyncSeek + Send + Unpin {}

impl<T: AsyncRead + AsyncSeek + Send + Unpin> SecondaryRead for T {}

pub type SecondaryReader = Box<dyn SecondaryRead>;
pub type SecondaryWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SecondaryStatus {
    pub kind: FileKind,
    pub length: u64,
    pub modification_time: i64,
    pub permission: Permission,
}

impl SecondaryStatus {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    /// Status view for an entry known only to the secondary.
    pub fn to_file_status(
        &self,
        path: FsPath,
        block_size: u64,
        owner: &str,
        group: &str,
    ) -> FileStatus {
        FileStatus {
            path,
            id: None,
            kind: self.kind,
            length: self.length,
            block_size,
            permission: self.permission,
            owner: owner.to_string(),
            group: group.to_string(),
            access_time: self.modification_time,
            modification_time: self.modification_time,
        }
    }
}

#[async_trait]
pub trait SecondaryFs: Send + Sync {
    /// `None` when nothing exists at `path`.
    async fn status(&self, path: &FsPath) -> FsResult<Option<SecondaryStatus>>;

    async fn list(&self, path: &FsPath) -> FsResult<Vec<(FsPath, SecondaryStatus)>>;

    async fn open(&self, path: &FsPath) -> FsResult<SecondaryReader>;

    /// Creates missing parents.
    async fn create(&self, path: &FsPath, overwrite: bool) -> FsResult<SecondaryWriter>;

    async fn append(&self, path: &FsPath) -> FsResult<SecondaryWriter>;

    async fn mkdirs(&self, path: &FsPath) -> FsResult<()>;

    async fn delete(&self, path: &FsPath, recursive: bool) -> FsResult<bool>;

    async fn rename(&self, src: &FsPath, dst: &FsPath) -> FsResult<()>;

    async fn set_permission(&self, path: &FsPath, permission: Permission) -> FsResult<()>;
}

/// How a write-through sink is opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SinkMode {
    Create { overwrite: bool },
    Append,
}

#[derive(Clone)]
pub struct SecondaryDelegate {
    fs: Arc<dyn SecondaryFs>,
}

impl SecondaryDelegate {
    pub fn new(fs: Arc<dyn SecondaryFs>) -> Self {
        Self { fs }
    }

    pub fn fs(&self) -> &dyn SecondaryFs {
        self.fs.as_ref()
    }

    /// Opens a secondary file for reading together with its status.
    pub async fn read_through(
        &self,
        path: &FsPath,
    ) -> FsResult<(SecondaryStatus, SecondaryReader)> {
        let status = self
            .fs
            .status(path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if status.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        let reader = self.fs.open(path).await?;
        tracing::debug!(%path, length = status.length, "reading through secondary");
        Ok((status, reader))
    }

    pub async fn write_through(&self, path: &FsPath, mode: SinkMode) -> FsResult<SecondaryWriter> {
        match mode {
            SinkMode::Create { overwrite } => self.fs.create(path, overwrite).await,
            SinkMode::Append => self.fs.append(path).await,
        }
    }
}
