//! 面向客户端的路径级文件系统接口：
//! create/open/append/delete/rename/mkdir/list/stat。
//!
//! Each call resolves the path's mode, obtains a live session from the
//! reconnect coordinator and dispatches to the metadata tree and block store,
//! the secondary filesystem, or both.

use super::handle::{FileReader, FileWriter, PrimaryRead, PrimaryWrite};
use super::mode::{FsMode, ModeResolver};
use super::reconnect::{LinkState, ReconnectCoordinator};
use super::session::{HandleEntry, HandleKind, Session};
use crate::block::{BlockLocation, FileBlocks};
use crate::cadapter::Connector;
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::meta::inode::{FileKind, FileStatus, Inode, Permission, WriteLock};
use crate::meta::path::FsPath;
use crate::secondary::{SecondaryDelegate, SecondaryFs, SinkMode};
use futures::future::try_join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Options for `FileSystem::create`.
#[derive(Clone, Debug, Default)]
pub struct CreateOptions {
    /// Defaults to the configured `default_permission`.
    pub permission: Option<Permission>,
    pub overwrite: bool,
    /// Write buffer size; defaults to `write_buffer_size`.
    pub buffer_size: Option<usize>,
}

impl CreateOptions {
    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            ..Default::default()
        }
    }
}

pub struct FileSystem {
    config: Arc<FsConfig>,
    coordinator: ReconnectCoordinator,
    modes: ModeResolver,
    secondary: Option<SecondaryDelegate>,
}

impl FileSystem {
    pub fn new(config: FsConfig, connector: Arc<dyn Connector>) -> FsResult<Self> {
        Self::build(config, connector, None)
    }

    pub fn with_secondary(
        config: FsConfig,
        connector: Arc<dyn Connector>,
        secondary: Arc<dyn SecondaryFs>,
    ) -> FsResult<Self> {
        Self::build(config, connector, Some(SecondaryDelegate::new(secondary)))
    }

    fn build(
        config: FsConfig,
        connector: Arc<dyn Connector>,
        secondary: Option<SecondaryDelegate>,
    ) -> FsResult<Self> {
        config.validate()?;
        let modes = ModeResolver::new(config.default_mode, &config.path_modes);
        if modes.any_secondary() && secondary.is_none() {
            return Err(FsError::InvalidArgument(
                "PROXY/DUAL modes need a secondary filesystem".into(),
            ));
        }
        let config = Arc::new(config);
        Ok(Self {
            coordinator: ReconnectCoordinator::new(connector, config.clone()),
            config,
            modes,
            secondary,
        })
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn link_state(&self) -> LinkState {
        self.coordinator.state()
    }

    pub fn mode_of(&self, path: &str) -> FsResult<FsMode> {
        Ok(self.modes.resolve(&FsPath::parse(path)?))
    }

    fn secondary_for(&self, path: &FsPath) -> FsResult<&SecondaryDelegate> {
        self.secondary.as_ref().ok_or_else(|| {
            FsError::InvalidArgument(format!("no secondary filesystem configured for {path}"))
        })
    }

    fn secondary_status(
        &self,
        path: FsPath,
        status: &crate::secondary::SecondaryStatus,
    ) -> FileStatus {
        status.to_file_status(path, self.config.block_size, &self.config.user, &self.config.group)
    }

    /// Creates a file and opens it for writing under an exclusive lock.
    pub async fn create(&self, path: &str, options: &CreateOptions) -> FsResult<FileWriter> {
        let path = FsPath::parse(path)?;
        let session = self.coordinator.session().await?;
        match self.modes.resolve(&path) {
            FsMode::Proxy => {
                let sink = self
                    .secondary_for(&path)?
                    .write_through(&path, SinkMode::Create {
                        overwrite: options.overwrite,
                    })
                    .await?;
                let handle = Uuid::new_v4();
                session.register(
                    handle,
                    HandleEntry::new(path.clone(), None, HandleKind::Write, FsMode::Proxy),
                );
                Ok(FileWriter::proxy(path, session, handle, sink, 0))
            }
            mode => {
                let result = self.create_primary(&session, &path, options, mode).await;
                session.observe(result)
            }
        }
    }

    async fn create_primary(
        &self,
        session: &Arc<Session>,
        path: &FsPath,
        options: &CreateOptions,
        mode: FsMode,
    ) -> FsResult<FileWriter> {
        if mode == FsMode::Dual && !options.overwrite {
            if self.secondary_for(path)?.fs().status(path).await?.is_some() {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
        }
        let handle = Uuid::new_v4();
        let stale = |lock: &WriteLock| session.is_stale_lock(lock);
        let permission = options.permission.unwrap_or(self.config.default_permission);
        let outcome = session
            .meta()
            .create(
                path,
                FileKind::File,
                permission,
                options.overwrite,
                Some(session.new_lock(handle)),
                &stale,
            )
            .await?;
        if let Some(old) = &outcome.replaced {
            session
                .blocks()
                .remove_blocks(FileBlocks::from(old), old.length)
                .await?;
        }
        let inode = outcome.inode;
        session.register(
            handle,
            HandleEntry::new(path.clone(), Some(inode.id), HandleKind::Write, mode),
        );

        let mirror = if mode == FsMode::Dual {
            let sink = self
                .secondary_for(path)?
                .write_through(path, SinkMode::Create { overwrite: true })
                .await;
            match sink {
                Ok(sink) => Some(sink),
                Err(e) => {
                    session.unregister(handle);
                    self.discard_primary(session, path).await;
                    return Err(e);
                }
            }
        } else {
            None
        };
        debug!(%path, id = %inode.id, %mode, "opened for write");
        FileWriter::primary(
            path.clone(),
            PrimaryWrite {
                session: session.clone(),
                handle,
                file: FileBlocks::from(&inode),
                layout: session.blocks().layout(),
                buffer_limit: options
                    .buffer_size
                    .unwrap_or(self.config.write_buffer_size)
                    .max(1),
                length: 0,
                mirror,
            },
        )
        .await
    }

    /// Opens an existing file for appending under the same exclusive lock as `create`.
    pub async fn append(&self, path: &str, buffer_size: Option<usize>) -> FsResult<FileWriter> {
        let path = FsPath::parse(path)?;
        let session = self.coordinator.session().await?;
        match self.modes.resolve(&path) {
            FsMode::Proxy => {
                let delegate = self.secondary_for(&path)?;
                let length = delegate
                    .fs()
                    .status(&path)
                    .await?
                    .map(|s| s.length)
                    .unwrap_or(0);
                let sink = delegate.write_through(&path, SinkMode::Append).await?;
                let handle = Uuid::new_v4();
                session.register(
                    handle,
                    HandleEntry::new(path.clone(), None, HandleKind::Append, FsMode::Proxy),
                );
                Ok(FileWriter::proxy(path, session, handle, sink, length))
            }
            mode => {
                let result = self.append_primary(&session, &path, buffer_size, mode).await;
                session.observe(result)
            }
        }
    }

    async fn append_primary(
        &self,
        session: &Arc<Session>,
        path: &FsPath,
        buffer_size: Option<usize>,
        mode: FsMode,
    ) -> FsResult<FileWriter> {
        if mode == FsMode::Dual && session.meta().try_resolve(path).await?.is_none() {
            self.populate(session, path).await?;
        }
        let handle = Uuid::new_v4();
        let stale = |lock: &WriteLock| session.is_stale_lock(lock);
        let inode = session
            .meta()
            .acquire_write_lock(path, session.new_lock(handle), &stale)
            .await?;
        session.register(
            handle,
            HandleEntry::new(path.clone(), Some(inode.id), HandleKind::Append, mode),
        );

        let opened = async {
            let mirror = if mode == FsMode::Dual {
                Some(
                    self.secondary_for(path)?
                        .write_through(path, SinkMode::Append)
                        .await?,
                )
            } else {
                None
            };
            FileWriter::primary(
                path.clone(),
                PrimaryWrite {
                    session: session.clone(),
                    handle,
                    file: FileBlocks::from(&inode),
                    layout: session.blocks().layout(),
                    buffer_limit: buffer_size.unwrap_or(self.config.write_buffer_size).max(1),
                    length: inode.length,
                    mirror,
                },
            )
            .await
        }
        .await;
        if opened.is_err() {
            session.unregister(handle);
            if let Err(e) = session
                .meta()
                .commit_write(inode.id, handle, inode.length, true)
                .await
            {
                debug!(%path, error = %e, "could not release write lock after failed append");
            }
        } else {
            debug!(%path, id = %inode.id, length = inode.length, "opened for append");
        }
        opened
    }

    /// Opens a file for reading. Any number of readers may coexist with a writer.
    pub async fn open(&self, path: &str, buffer_size: Option<usize>) -> FsResult<FileReader> {
        let path = FsPath::parse(path)?;
        let session = self.coordinator.session().await?;
        let result = match self.modes.resolve(&path) {
            FsMode::Proxy => self.open_secondary(&session, &path).await,
            FsMode::Primary => {
                self.open_primary(&session, &path, buffer_size, FsMode::Primary)
                    .await
            }
            FsMode::Dual => self.open_dual(&session, &path, buffer_size).await,
        };
        session.observe(result)
    }

    async fn open_primary(
        &self,
        session: &Arc<Session>,
        path: &FsPath,
        buffer_size: Option<usize>,
        mode: FsMode,
    ) -> FsResult<FileReader> {
        let inode = session.meta().resolve(path).await?;
        if inode.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        let inode = session
            .meta()
            .touch_access(inode.id)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let handle = Uuid::new_v4();
        session.register(
            handle,
            HandleEntry::new(path.clone(), Some(inode.id), HandleKind::Read, mode),
        );
        Ok(FileReader::primary(
            path.clone(),
            PrimaryRead {
                session: session.clone(),
                handle,
                file: FileBlocks::from(&inode),
                length: inode.length,
                read_buffer_size: buffer_size.unwrap_or(self.config.read_buffer_size),
                prefetch_blocks: self.config.prefetch_blocks,
            },
        ))
    }

    async fn open_secondary(&self, session: &Arc<Session>, path: &FsPath) -> FsResult<FileReader> {
        let (status, source) = self.secondary_for(path)?.read_through(path).await?;
        let handle = Uuid::new_v4();
        session.register(
            handle,
            HandleEntry::new(path.clone(), None, HandleKind::Read, self.modes.resolve(path)),
        );
        Ok(FileReader::proxy(
            path.clone(),
            session.clone(),
            handle,
            source,
            status.length,
        ))
    }

    async fn open_dual(
        &self,
        session: &Arc<Session>,
        path: &FsPath,
        buffer_size: Option<usize>,
    ) -> FsResult<FileReader> {
        if session.meta().try_resolve(path).await?.is_none() {
            match self.populate(session, path).await {
                Ok(()) => {}
                // 其他客户端正在加载同一文件：直接从二级文件系统读取
                Err(FsError::AlreadyInUse(_)) | Err(FsError::AlreadyExists(_)) => {
                    return self.open_secondary(session, path).await;
                }
                Err(e) => return Err(e),
            }
        }
        self.open_primary(session, path, buffer_size, FsMode::Dual).await
    }

    /// Copies a secondary file into primary storage (read-through caching).
    async fn populate(&self, session: &Arc<Session>, path: &FsPath) -> FsResult<()> {
        let (status, mut source) = self.secondary_for(path)?.read_through(path).await?;
        let handle = Uuid::new_v4();
        let stale = |lock: &WriteLock| session.is_stale_lock(lock);
        let outcome = session
            .meta()
            .create(
                path,
                FileKind::File,
                status.permission,
                false,
                Some(session.new_lock(handle)),
                &stale,
            )
            .await?;
        session.register(
            handle,
            HandleEntry::new(path.clone(), Some(outcome.inode.id), HandleKind::Write, FsMode::Dual),
        );
        let mut writer = FileWriter::primary(
            path.clone(),
            PrimaryWrite {
                session: session.clone(),
                handle,
                file: FileBlocks::from(&outcome.inode),
                layout: session.blocks().layout(),
                buffer_limit: self.config.write_buffer_size,
                length: 0,
                mirror: None,
            },
        )
        .await?;

        let copied = async {
            let mut chunk = vec![0u8; self.config.write_buffer_size];
            let mut total = 0u64;
            loop {
                let n = source.read(&mut chunk).await?;
                if n == 0 {
                    break;
                }
                writer.write(&chunk[..n]).await?;
                total += n as u64;
            }
            writer.close().await?;
            Ok::<_, FsError>(total)
        }
        .await;
        match copied {
            Ok(total) => {
                session
                    .meta()
                    .set_times(path, Some(status.modification_time), None)
                    .await?;
                info!(%path, bytes = total, "populated from secondary");
                Ok(())
            }
            Err(e) => {
                let _ = writer.close().await;
                self.discard_primary(session, path).await;
                Err(e)
            }
        }
    }

    /// Best-effort removal of a primary file whose creation could not complete.
    async fn discard_primary(&self, session: &Arc<Session>, path: &FsPath) {
        if let Err(e) = self.delete_primary(session, path, false).await {
            warn!(%path, error = %e, "could not discard partially created file");
        }
    }

    /// Returns `false` when nothing existed at `path`.
    pub async fn delete(&self, path: &str, recursive: bool) -> FsResult<bool> {
        let path = FsPath::parse(path)?;
        let session = self.coordinator.session().await?;
        let result = match self.modes.resolve(&path) {
            FsMode::Proxy => self.secondary_for(&path)?.fs().delete(&path, recursive).await,
            FsMode::Primary => self.delete_primary(&session, &path, recursive).await,
            FsMode::Dual => {
                let secondary = self.secondary_for(&path)?.fs().delete(&path, recursive).await?;
                let primary = self.delete_primary(&session, &path, recursive).await?;
                Ok(secondary || primary)
            }
        };
        session.observe(result)
    }

    async fn delete_primary(
        &self,
        session: &Arc<Session>,
        path: &FsPath,
        recursive: bool,
    ) -> FsResult<bool> {
        let Some(released) = session.meta().delete(path, recursive).await? else {
            return Ok(false);
        };
        let blocks = session.blocks();
        try_join_all(
            released
                .iter()
                .map(|file: &Inode| blocks.remove_blocks(FileBlocks::from(file), file.length)),
        )
        .await?;
        Ok(true)
    }

    /// Moves `src` to `dst`; ids, content and block placement are preserved.
    pub async fn rename(&self, src: &str, dst: &str) -> FsResult<()> {
        let src = FsPath::parse(src)?;
        let dst = FsPath::parse(dst)?;
        let mode = self.modes.resolve(&src);
        if self.modes.resolve(&dst) != mode {
            return Err(FsError::Unsupported(format!(
                "rename across modes: {src} -> {dst}"
            )));
        }
        let session = self.coordinator.session().await?;
        let result = match mode {
            FsMode::Proxy => self.secondary_for(&src)?.fs().rename(&src, &dst).await,
            FsMode::Primary => session.meta().rename(&src, &dst).await,
            FsMode::Dual => self.rename_dual(&session, &src, &dst).await,
        };
        session.observe(result)
    }

    async fn rename_dual(
        &self,
        session: &Arc<Session>,
        src: &FsPath,
        dst: &FsPath,
    ) -> FsResult<()> {
        let in_secondary = match self.secondary_for(src)?.fs().rename(src, dst).await {
            Ok(()) => true,
            Err(FsError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        match session.meta().rename(src, dst).await {
            Err(FsError::NotFound(_)) if in_secondary => Ok(()),
            other => other,
        }
    }

    /// Creates a directory. `permission` defaults to the parent's.
    pub async fn mkdir(
        &self,
        path: &str,
        permission: Option<Permission>,
        create_parents: bool,
    ) -> FsResult<()> {
        let path = FsPath::parse(path)?;
        let session = self.coordinator.session().await?;
        let mode = self.modes.resolve(&path);
        let result = async {
            // 先校验父目录，失败时两侧都不应留下新目录
            if !create_parents {
                if let Some(parent) = path.parent() {
                    let parent_is_dir = match mode {
                        FsMode::Proxy => self
                            .secondary_for(&path)?
                            .fs()
                            .status(&parent)
                            .await?
                            .is_some_and(|s| s.is_dir()),
                        _ => session
                            .meta()
                            .try_resolve(&parent)
                            .await?
                            .is_some_and(|inode| inode.is_dir()),
                    };
                    if !parent_is_dir {
                        return Err(FsError::NotFound(parent.to_string()));
                    }
                }
            }
            if mode == FsMode::Dual {
                if let Some(existing) = session.meta().try_resolve(&path).await? {
                    if !existing.is_dir() {
                        return Err(FsError::AlreadyExists(path.to_string()));
                    }
                }
            }
            if mode.uses_secondary() {
                let secondary = self.secondary_for(&path)?.fs();
                secondary.mkdirs(&path).await?;
                if let Some(permission) = permission {
                    secondary.set_permission(&path, permission).await?;
                }
            }
            if mode != FsMode::Proxy {
                session.meta().mkdir(&path, permission, create_parents).await?;
            }
            Ok(())
        }
        .await;
        session.observe(result)
    }

    pub async fn mkdirs(&self, path: &str) -> FsResult<()> {
        self.mkdir(path, None, true).await
    }

    /// Immediate children of a directory (or the file itself).
    pub async fn list_status(&self, path: &str) -> FsResult<Vec<FileStatus>> {
        let path = FsPath::parse(path)?;
        let session = self.coordinator.session().await?;
        let mode = self.modes.resolve(&path);
        let result = async {
            let block_size = self.config.block_size;
            let mut out = Vec::new();
            let mut found = false;
            if mode != FsMode::Proxy {
                match session.meta().list(&path).await {
                    Ok(children) => {
                        found = true;
                        out.extend(
                            children
                                .iter()
                                .map(|(p, inode)| {
                                    FileStatus::from_inode(p.clone(), inode, block_size)
                                }),
                        );
                    }
                    Err(FsError::NotFound(_)) if mode == FsMode::Dual => {}
                    Err(e) => return Err(e),
                }
            }
            if mode.uses_secondary() {
                let known = out.iter().map(|s| s.path.clone()).collect::<BTreeSet<_>>();
                match self.secondary_for(&path)?.fs().list(&path).await {
                    Ok(children) => {
                        found = true;
                        out.extend(
                            children
                                .iter()
                                .filter(|(p, _)| !known.contains(p))
                                .map(|(p, status)| self.secondary_status(p.clone(), status)),
                        );
                    }
                    Err(FsError::NotFound(_)) if found => {}
                    Err(e) => return Err(e),
                }
            }
            if found {
                Ok(out)
            } else {
                Err(FsError::NotFound(path.to_string()))
            }
        }
        .await;
        session.observe(result)
    }

    /// Non-failing status query.
    pub async fn try_file_status(&self, path: &str) -> FsResult<Option<FileStatus>> {
        let path = FsPath::parse(path)?;
        let session = self.coordinator.session().await?;
        let mode = self.modes.resolve(&path);
        let result = async {
            if mode != FsMode::Proxy {
                if let Some(inode) = session.meta().try_resolve(&path).await? {
                    return Ok(Some(FileStatus::from_inode(
                        path.clone(),
                        &inode,
                        self.config.block_size,
                    )));
                }
            }
            if mode.uses_secondary() {
                let status = self.secondary_for(&path)?.fs().status(&path).await?;
                return Ok(status.map(|s| self.secondary_status(path.clone(), &s)));
            }
            Ok(None)
        }
        .await;
        session.observe(result)
    }

    pub async fn get_file_status(&self, path: &str) -> FsResult<FileStatus> {
        self.try_file_status(path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    pub async fn exists(&self, path: &str) -> FsResult<bool> {
        Ok(self.try_file_status(path).await?.is_some())
    }

    async fn primary_session(&self, path: &FsPath, op: &str) -> FsResult<Arc<Session>> {
        if self.modes.resolve(path) == FsMode::Proxy {
            return Err(FsError::Unsupported(format!("{op} on PROXY path {path}")));
        }
        self.coordinator.session().await
    }

    /// `None` leaves the corresponding time unchanged.
    pub async fn set_times(
        &self,
        path: &str,
        modification_time: Option<i64>,
        access_time: Option<i64>,
    ) -> FsResult<()> {
        let path = FsPath::parse(path)?;
        let session = self.primary_session(&path, "set_times").await?;
        let result = session.meta().set_times(&path, modification_time, access_time).await;
        session.observe(result).map(|_| ())
    }

    /// Applies to `path` only, never to its descendants.
    pub async fn set_permission(&self, path: &str, permission: Permission) -> FsResult<()> {
        let path = FsPath::parse(path)?;
        let session = self.coordinator.session().await?;
        let mode = self.modes.resolve(&path);
        let result = async {
            if mode.uses_secondary() {
                self.secondary_for(&path)?
                    .fs()
                    .set_permission(&path, permission)
                    .await?;
            }
            if mode != FsMode::Proxy {
                session.meta().set_permission(&path, permission).await?;
            }
            Ok(())
        }
        .await;
        session.observe(result)
    }

    /// Applies to `path` only, never to its descendants.
    pub async fn set_owner(&self, path: &str, owner: &str, group: &str) -> FsResult<()> {
        let path = FsPath::parse(path)?;
        let session = self.primary_session(&path, "set_owner").await?;
        let result = session.meta().set_owner(&path, owner, group).await;
        session.observe(result).map(|_| ())
    }

    /// One location per block group covering `[offset, offset + len)`.
    pub async fn get_block_locations(
        &self,
        path: &str,
        offset: u64,
        len: u64,
    ) -> FsResult<Vec<BlockLocation>> {
        let path = FsPath::parse(path)?;
        let session = self.primary_session(&path, "get_block_locations").await?;
        let result = async {
            let inode = session.meta().resolve(&path).await?;
            session.affinity().locate(&inode, offset, len)
        }
        .await;
        session.observe(result)
    }

    fn ensure_management(&self) -> FsResult<()> {
        if self.config.management_enabled {
            Ok(())
        } else {
            Err(FsError::Unsupported("space reporting is disabled".into()))
        }
    }

    /// Bytes stored in the data region across all nodes.
    pub async fn used_space(&self) -> FsResult<u64> {
        self.ensure_management()?;
        let session = self.coordinator.session().await?;
        let result = session.backend().used_space().await;
        session.observe(result)
    }

    pub async fn capacity_space(&self) -> FsResult<u64> {
        self.ensure_management()?;
        let session = self.coordinator.session().await?;
        let result = session.backend().capacity().await;
        session.observe(result)
    }

    /// Handles registered with the current session.
    pub async fn open_handles(&self) -> Vec<HandleEntry> {
        match self.coordinator.current().await {
            Some(session) => session.open_handles(),
            None => Vec::new(),
        }
    }
}
