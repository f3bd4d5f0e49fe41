//! 本地目录作为二级文件系统，用于 PROXY/DUAL 模式的测试与 demo。

use super::{SecondaryFs, SecondaryReader, SecondaryStatus, SecondaryWriter};
use crate::error::{FsError, FsResult};
use crate::meta::inode::{FileKind, Permission};
use crate::meta::path::FsPath;
use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;

pub struct LocalDirSecondary {
    root: PathBuf,
}

fn map_io(path: &FsPath, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_string()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_string()),
        _ => FsError::Io(e),
    }
}

#[cfg(unix)]
fn permission_of(meta: &std::fs::Metadata) -> Permission {
    use std::os::unix::fs::PermissionsExt;
    Permission::new((meta.permissions().mode() & 0o7777) as u16).unwrap_or(Permission::DEFAULT)
}

#[cfg(not(unix))]
fn permission_of(_meta: &std::fs::Metadata) -> Permission {
    Permission::DEFAULT
}

fn status_of(meta: &std::fs::Metadata) -> SecondaryStatus {
    let modification_time = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);
    SecondaryStatus {
        kind: if meta.is_dir() {
            FileKind::Directory
        } else {
            FileKind::File
        },
        length: if meta.is_dir() { 0 } else { meta.len() },
        modification_time,
        permission: permission_of(meta),
    }
}

impl LocalDirSecondary {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn path_for(&self, path: &FsPath) -> PathBuf {
        path.components().fold(self.root.clone(), |acc, c| acc.join(c))
    }

    async fn metadata(&self, path: &FsPath) -> FsResult<Option<std::fs::Metadata>> {
        match fs::metadata(self.path_for(path)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FsError::Io(e)),
        }
    }

    async fn ensure_parent(&self, path: &FsPath) -> FsResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(self.path_for(&parent))
                .await
                .map_err(|e| map_io(&parent, e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl SecondaryFs for LocalDirSecondary {
    async fn status(&self, path: &FsPath) -> FsResult<Option<SecondaryStatus>> {
        Ok(self.metadata(path).await?.as_ref().map(status_of))
    }

    async fn list(&self, path: &FsPath) -> FsResult<Vec<(FsPath, SecondaryStatus)>> {
        let meta = self
            .metadata(path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if !meta.is_dir() {
            return Ok(vec![(path.clone(), status_of(&meta))]);
        }
        let mut entries = fs::read_dir(self.path_for(path))
            .await
            .map_err(|e| map_io(path, e))?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let meta = entry.metadata().await?;
            out.push((path.join(&name), status_of(&meta)));
        }
        Ok(out)
    }

    async fn open(&self, path: &FsPath) -> FsResult<SecondaryReader> {
        let file = fs::File::open(self.path_for(path))
            .await
            .map_err(|e| map_io(path, e))?;
        if file.metadata().await?.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        Ok(Box::new(file))
    }

    async fn create(&self, path: &FsPath, overwrite: bool) -> FsResult<SecondaryWriter> {
        if let Some(meta) = self.metadata(path).await? {
            if meta.is_dir() {
                return Err(FsError::IsADirectory(path.to_string()));
            }
            if !overwrite {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
        }
        self.ensure_parent(path).await?;
        let file = fs::File::create(self.path_for(path))
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn append(&self, path: &FsPath) -> FsResult<SecondaryWriter> {
        match self.metadata(path).await? {
            None => return Err(FsError::NotFound(path.to_string())),
            Some(meta) if meta.is_dir() => return Err(FsError::IsADirectory(path.to_string())),
            Some(_) => {}
        }
        let file = fs::OpenOptions::new()
            .append(true)
            .open(self.path_for(path))
            .await
            .map_err(|e| map_io(path, e))?;
        Ok(Box::new(file))
    }

    async fn mkdirs(&self, path: &FsPath) -> FsResult<()> {
        if let Some(meta) = self.metadata(path).await? {
            if !meta.is_dir() {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
            return Ok(());
        }
        fs::create_dir_all(self.path_for(path))
            .await
            .map_err(|e| map_io(path, e))
    }

    async fn delete(&self, path: &FsPath, recursive: bool) -> FsResult<bool> {
        let Some(meta) = self.metadata(path).await? else {
            return Ok(false);
        };
        let local = self.path_for(path);
        if !meta.is_dir() {
            fs::remove_file(local).await.map_err(|e| map_io(path, e))?;
            return Ok(true);
        }
        if path.is_root() {
            // 根目录保留，只清空内容
            let children = self.list(path).await?;
            if !children.is_empty() && !recursive {
                return Err(FsError::NotEmpty(path.to_string()));
            }
            for (child, _) in children {
                self.delete(&child, true).await?;
            }
            return Ok(true);
        }
        if recursive {
            fs::remove_dir_all(local).await.map_err(|e| map_io(path, e))?;
        } else {
            let mut entries = fs::read_dir(&local).await.map_err(|e| map_io(path, e))?;
            if entries.next_entry().await?.is_some() {
                return Err(FsError::NotEmpty(path.to_string()));
            }
            fs::remove_dir(local).await.map_err(|e| map_io(path, e))?;
        }
        Ok(true)
    }

    async fn rename(&self, src: &FsPath, dst: &FsPath) -> FsResult<()> {
        if self.metadata(src).await?.is_none() {
            return Err(FsError::NotFound(src.to_string()));
        }
        if self.metadata(dst).await?.is_some() {
            return Err(FsError::AlreadyExists(dst.to_string()));
        }
        self.ensure_parent(dst).await?;
        fs::rename(self.path_for(src), self.path_for(dst))
            .await
            .map_err(|e| map_io(src, e))
    }

    #[cfg(unix)]
    async fn set_permission(&self, path: &FsPath, permission: Permission) -> FsResult<()> {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(u32::from(permission.mode()));
        fs::set_permissions(self.path_for(path), perms)
            .await
            .map_err(|e| map_io(path, e))
    }

    #[cfg(not(unix))]
    async fn set_permission(&self, path: &FsPath, _permission: Permission) -> FsResult<()> {
        Err(FsError::Unsupported(format!("permissions on {path}")))
    }
}
