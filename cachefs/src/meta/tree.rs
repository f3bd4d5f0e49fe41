//! Metadata tree over the replicated meta region.
//!
//! Every record write happens while the writer holds that record's substrate
//! lock, so two clients racing on one path observe a single winner. Multi-lock
//! operations take ancestors before descendants and unrelated directories in
//! id order. Moves between different parents additionally hold one
//! cluster-wide rename lock, taken before any directory lock.

use super::inode::{FileKind, Inode, InodeId, Permission, ROOT_ID, WriteLock, now_millis};
use super::path::FsPath;
use crate::cadapter::{CacheBackend, CacheKey, KeyGuard, Region};
use crate::error::{FsError, FsResult};
use bytes::Bytes;
use futures::future::try_join_all;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Decides whether a write lock was left behind by a retired session.
pub type StaleLock<'a> = &'a (dyn Fn(&WriteLock) -> bool + Send + Sync);

/// Serialises moves between different parent directories.
const RENAME_LOCK: &str = "lock/rename";

/// Owner/permission stamped on inodes the tree creates implicitly.
#[derive(Clone, Debug)]
pub struct TreeDefaults {
    pub owner: String,
    pub group: String,
    pub permission: Permission,
}

/// An inode loaded while its key lock is held.
pub struct LockedInode {
    pub inode: Inode,
    _guard: KeyGuard,
}

#[derive(Debug)]
pub struct CreateOutcome {
    pub inode: Inode,
    /// File displaced by an overwriting create; its blocks are the caller's to release.
    pub replaced: Option<Inode>,
}

pub struct MetaTree {
    backend: Arc<dyn CacheBackend>,
    defaults: TreeDefaults,
}

fn split(path: &FsPath) -> FsResult<(FsPath, &str)> {
    match (path.parent(), path.name()) {
        (Some(parent), Some(name)) => Ok((parent, name)),
        _ => Err(FsError::InvalidArgument(format!(
            "operation needs a non-root path: {path}"
        ))),
    }
}

impl MetaTree {
    pub fn new(backend: Arc<dyn CacheBackend>, defaults: TreeDefaults) -> Self {
        Self { backend, defaults }
    }

    fn record_key(id: InodeId) -> CacheKey {
        CacheKey::new(format!("inode/{id}"))
    }

    fn lock_key(id: InodeId) -> String {
        format!("lock/inode/{id}")
    }

    pub async fn load(&self, id: InodeId) -> FsResult<Option<Inode>> {
        match self.backend.get(Region::Meta, &Self::record_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, inode: &Inode) -> FsResult<()> {
        let raw = serde_json::to_vec(inode)?;
        self.backend
            .put(Region::Meta, &Self::record_key(inode.id), Bytes::from(raw))
            .await
    }

    async fn erase(&self, id: InodeId) -> FsResult<()> {
        self.backend
            .remove(Region::Meta, &Self::record_key(id))
            .await
            .map(|_| ())
    }

    async fn lock_id(&self, id: InodeId) -> FsResult<KeyGuard> {
        self.backend.lock(&Self::lock_key(id)).await
    }

    /// Locks `id` and loads it; `None` if the record is gone.
    pub async fn lock_inode(&self, id: InodeId) -> FsResult<Option<LockedInode>> {
        let guard = self.lock_id(id).await?;
        Ok(self.load(id).await?.map(|inode| LockedInode {
            inode,
            _guard: guard,
        }))
    }

    /// Creates the root directory if the cluster does not have one.
    pub async fn ensure_root(&self) -> FsResult<()> {
        let _guard = self.lock_id(ROOT_ID).await?;
        if self.load(ROOT_ID).await?.is_none() {
            let root = Inode::root(
                self.defaults.permission,
                &self.defaults.owner,
                &self.defaults.group,
            );
            self.store(&root).await?;
            info!("initialised root directory");
        }
        Ok(())
    }

    /// Non-failing lookup: `None` when any component is missing or not a directory.
    pub async fn try_resolve(&self, path: &FsPath) -> FsResult<Option<Inode>> {
        let mut current = match self.load(ROOT_ID).await? {
            Some(root) => root,
            None => return Ok(None),
        };
        for name in path.components() {
            if !current.is_dir() {
                return Ok(None);
            }
            let Some(&child) = current.children.get(name) else {
                return Ok(None);
            };
            current = match self.load(child).await? {
                Some(inode) => inode,
                None => return Ok(None),
            };
        }
        Ok(Some(current))
    }

    pub async fn resolve(&self, path: &FsPath) -> FsResult<Inode> {
        self.try_resolve(path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Locks the directory currently reachable at `path`, retrying if it was
    /// moved or replaced while the lock was awaited.
    async fn lock_directory(&self, path: &FsPath) -> FsResult<LockedInode> {
        loop {
            let dir = self.resolve(path).await?;
            if !dir.is_dir() {
                return Err(FsError::NotADirectory(path.to_string()));
            }
            let guard = self.lock_id(dir.id).await?;
            match self.try_resolve(path).await? {
                Some(current) if current.id == dir.id => {
                    return Ok(LockedInode {
                        inode: current,
                        _guard: guard,
                    });
                }
                _ => debug!(%path, "directory moved while locking, retrying"),
            }
        }
    }

    /// Locks two distinct directories: ancestors first, otherwise by id.
    async fn lock_pair(&self, a: &FsPath, b: &FsPath) -> FsResult<(LockedInode, LockedInode)> {
        let a_first = if b.starts_with(a) {
            true
        } else if a.starts_with(b) {
            false
        } else {
            self.resolve(a).await?.id < self.resolve(b).await?.id
        };
        if a_first {
            let first = self.lock_directory(a).await?;
            let second = self.lock_directory(b).await?;
            Ok((first, second))
        } else {
            let second = self.lock_directory(b).await?;
            let first = self.lock_directory(a).await?;
            Ok((first, second))
        }
    }

    async fn link_child(&self, parent: &mut LockedInode, name: &str, id: InodeId) -> FsResult<()> {
        parent.inode.children.insert(name.to_string(), id);
        parent.inode.modification_time = now_millis();
        self.store(&parent.inode).await
    }

    /// Lock-free walk down `names`: the deepest existing directory, its path
    /// and how many components it covers. A file in the way is an error.
    async fn deepest_existing(&self, names: &[String]) -> FsResult<(FsPath, Inode, usize)> {
        let mut current = FsPath::root();
        let mut deepest = self.resolve(&current).await?;
        let mut covered = 0;
        while covered < names.len() {
            let Some(&id) = deepest.children.get(names[covered].as_str()) else {
                break;
            };
            let Some(child) = self.load(id).await? else {
                break;
            };
            let child_path = current.join(&names[covered]);
            if !child.is_dir() {
                return Err(if covered + 1 == names.len() {
                    FsError::AlreadyExists(child_path.to_string())
                } else {
                    FsError::NotADirectory(child_path.to_string())
                });
            }
            current = child_path;
            deepest = child;
            covered += 1;
        }
        Ok((current, deepest, covered))
    }

    /// Creates `path` as a directory. Missing intermediate directories are
    /// created when `create_parents` is set and inherit their parent's
    /// permission; existing ancestors are never modified. An existing
    /// directory at `path` is returned unchanged.
    pub async fn mkdir(
        &self,
        path: &FsPath,
        permission: Option<Permission>,
        create_parents: bool,
    ) -> FsResult<Inode> {
        let names = path.components().map(str::to_string).collect::<Vec<_>>();
        if names.is_empty() {
            return self.resolve(path).await;
        }
        let last = names.len() - 1;

        // 无锁找到最深的已存在祖先，只在真正缺失的层级上加锁
        let (mut current, deepest, start) = self.deepest_existing(&names).await?;
        if start == names.len() {
            return Ok(deepest);
        }

        let mut result = None;
        for (i, name) in names.iter().enumerate().skip(start) {
            let child_path = current.join(name);
            let mut parent = self.lock_directory(&current).await?;
            let existing = match parent.inode.children.get(name.as_str()).copied() {
                Some(id) => self.load(id).await?,
                None => None,
            };
            let dir = match existing {
                Some(inode) if inode.is_dir() => inode,
                Some(_) if i == last => {
                    return Err(FsError::AlreadyExists(child_path.to_string()));
                }
                Some(_) => return Err(FsError::NotADirectory(child_path.to_string())),
                None => {
                    if i != last && !create_parents {
                        return Err(FsError::NotFound(child_path.to_string()));
                    }
                    let inherited = parent.inode.permission;
                    let permission = if i == last {
                        permission.unwrap_or(inherited)
                    } else {
                        inherited
                    };
                    let dir = Inode::new_directory(
                        permission,
                        &self.defaults.owner,
                        &self.defaults.group,
                    );
                    self.store(&dir).await?;
                    self.link_child(&mut parent, name, dir.id).await?;
                    debug!(path = %child_path, "created directory");
                    dir
                }
            };
            drop(parent);
            current = child_path;
            result = Some(dir);
        }
        result.ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Creates a file or directory inode at `path`, auto-creating ancestors.
    ///
    /// With `overwrite`, an existing unlocked file is atomically replaced by a
    /// fresh inode; a file held by a live writer is never replaced.
    pub async fn create(
        &self,
        path: &FsPath,
        kind: FileKind,
        permission: Permission,
        overwrite: bool,
        lock: Option<WriteLock>,
        is_stale: StaleLock<'_>,
    ) -> FsResult<CreateOutcome> {
        let (parent_path, name) =
            split(path).map_err(|_| FsError::AlreadyExists(path.to_string()))?;
        self.mkdir(&parent_path, None, true).await?;
        let mut parent = self.lock_directory(&parent_path).await?;

        let replaced = match parent.inode.children.get(name).copied() {
            None => None,
            Some(_) if !overwrite || kind == FileKind::Directory => {
                return Err(FsError::AlreadyExists(path.to_string()));
            }
            Some(old_id) => match self.lock_inode(old_id).await? {
                None => None,
                Some(old) => {
                    if old.inode.is_dir() {
                        return Err(FsError::IsADirectory(path.to_string()));
                    }
                    if let Some(held) = &old.inode.lock {
                        if !is_stale(held) {
                            return Err(FsError::AlreadyInUse(path.to_string()));
                        }
                        warn!(
                            %path,
                            session = %held.session,
                            "replacing file locked by a retired session"
                        );
                    }
                    Some(old)
                }
            },
        };

        let mut inode = match kind {
            FileKind::File => {
                Inode::new_file(permission, &self.defaults.owner, &self.defaults.group)
            }
            FileKind::Directory => {
                Inode::new_directory(permission, &self.defaults.owner, &self.defaults.group)
            }
        };
        inode.lock = lock;
        self.store(&inode).await?;
        self.link_child(&mut parent, name, inode.id).await?;

        let replaced = match replaced {
            Some(old) => {
                self.erase(old.inode.id).await?;
                info!(%path, old = %old.inode.id, new = %inode.id, "overwrote file");
                Some(old.inode)
            }
            None => None,
        };
        Ok(CreateOutcome { inode, replaced })
    }

    /// Immediate children of a directory, or the file itself.
    pub async fn list(&self, path: &FsPath) -> FsResult<Vec<(FsPath, Inode)>> {
        let inode = self.resolve(path).await?;
        if inode.is_file() {
            return Ok(vec![(path.clone(), inode)]);
        }
        let loads = inode.children.iter().map(|(name, id)| async move {
            Ok::<_, FsError>(self.load(*id).await?.map(|child| (path.join(name), child)))
        });
        Ok(try_join_all(loads).await?.into_iter().flatten().collect())
    }

    /// Removes `path`. Returns `None` when nothing was there, otherwise every
    /// file inode detached by the removal so their blocks can be released.
    pub async fn delete(&self, path: &FsPath, recursive: bool) -> FsResult<Option<Vec<Inode>>> {
        if path.is_root() {
            return self.clear_root(recursive).await;
        }
        let (parent_path, name) = split(path)?;
        let mut parent = match self.lock_directory(&parent_path).await {
            Ok(parent) => parent,
            Err(FsError::NotFound(_)) | Err(FsError::NotADirectory(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let Some(id) = parent.inode.children.get(name).copied() else {
            return Ok(None);
        };
        let Some(child) = self.lock_inode(id).await? else {
            parent.inode.children.remove(name);
            self.store(&parent.inode).await?;
            return Ok(None);
        };
        if child.inode.is_dir() && !child.inode.children.is_empty() && !recursive {
            return Err(FsError::NotEmpty(path.to_string()));
        }

        parent.inode.children.remove(name);
        parent.inode.modification_time = now_millis();
        self.store(&parent.inode).await?;
        self.erase(id).await?;
        let LockedInode { inode: child, _guard } = child;
        drop(_guard);
        drop(parent);

        if child.is_dir() {
            let released = self
                .reclaim_subtree(child.children.values().copied().collect())
                .await?;
            info!(%path, files = released.len(), "deleted directory tree");
            Ok(Some(released))
        } else {
            debug!(%path, "deleted file");
            Ok(Some(vec![child]))
        }
    }

    async fn clear_root(&self, recursive: bool) -> FsResult<Option<Vec<Inode>>> {
        let mut root = self.lock_directory(&FsPath::root()).await?;
        if root.inode.children.is_empty() {
            return Ok(if recursive { Some(Vec::new()) } else { None });
        }
        if !recursive {
            return Err(FsError::NotEmpty("/".into()));
        }
        let children = std::mem::take(&mut root.inode.children);
        root.inode.modification_time = now_millis();
        self.store(&root.inode).await?;
        drop(root);
        let released = self.reclaim_subtree(children.into_values().collect()).await?;
        info!(files = released.len(), "cleared root directory");
        Ok(Some(released))
    }

    /// Erases detached inodes depth-first. Each directory is erased under its
    /// lock, so a create racing into the detached tree fails to resolve it.
    async fn reclaim_subtree(&self, roots: Vec<InodeId>) -> FsResult<Vec<Inode>> {
        let mut pending = roots;
        let mut released = Vec::new();
        while let Some(id) = pending.pop() {
            let Some(locked) = self.lock_inode(id).await? else {
                continue;
            };
            self.erase(id).await?;
            let LockedInode { inode, .. } = locked;
            if inode.is_dir() {
                pending.extend(inode.children.values().copied());
            } else {
                released.push(inode);
            }
        }
        Ok(released)
    }

    /// Moves `src` to `dst`, keeping the inode id (and every descendant id).
    /// Missing parents of `dst` are created once the move is known to be
    /// valid; an existing `dst` is rejected.
    pub async fn rename(&self, src: &FsPath, dst: &FsPath) -> FsResult<()> {
        if src.is_root() || dst.is_root() {
            return Err(FsError::InvalidArgument(
                "cannot rename the root directory".into(),
            ));
        }
        if src == dst {
            self.resolve(src).await?;
            return Ok(());
        }
        if dst.starts_with(src) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {src} into its own subtree {dst}"
            )));
        }
        let (src_parent, src_name) = split(src)?;
        let (dst_parent, dst_name) = split(dst)?;
        if self.try_resolve(src).await?.is_none() {
            return Err(FsError::NotFound(src.to_string()));
        }
        if self.try_resolve(dst).await?.is_some() {
            return Err(FsError::AlreadyExists(dst.to_string()));
        }
        let dst_names = dst_parent.components().map(str::to_string).collect::<Vec<_>>();
        let (_, _, existing) = self.deepest_existing(&dst_names).await?;
        if existing < dst_names.len() {
            self.mkdir(&dst_parent, None, true).await?;
        }

        if src_parent == dst_parent {
            let mut parent = self.lock_directory(&src_parent).await?;
            let id = parent
                .inode
                .children
                .get(src_name)
                .copied()
                .ok_or_else(|| FsError::NotFound(src.to_string()))?;
            if parent.inode.children.contains_key(dst_name) {
                return Err(FsError::AlreadyExists(dst.to_string()));
            }
            parent.inode.children.remove(src_name);
            self.link_child(&mut parent, dst_name, id).await?;
        } else {
            // 跨目录移动串行化，避免两个交叉的移动形成环
            let _serial = self.backend.lock(RENAME_LOCK).await?;
            let (mut from, mut to) = self.lock_pair(&src_parent, &dst_parent).await?;
            let id = from
                .inode
                .children
                .get(src_name)
                .copied()
                .ok_or_else(|| FsError::NotFound(src.to_string()))?;
            if to.inode.children.contains_key(dst_name) {
                return Err(FsError::AlreadyExists(dst.to_string()));
            }
            if self.ancestor_ids(&dst_parent).await?.contains(&id) {
                return Err(FsError::InvalidArgument(format!(
                    "cannot move {src} into its own subtree {dst}"
                )));
            }
            // 先挂到新父目录，再从旧父目录摘除
            self.link_child(&mut to, dst_name, id).await?;
            from.inode.children.remove(src_name);
            from.inode.modification_time = now_millis();
            self.store(&from.inode).await?;
        }
        info!(%src, %dst, "renamed");
        Ok(())
    }

    /// Ids of every directory on the way from the root to `path`, inclusive.
    async fn ancestor_ids(&self, path: &FsPath) -> FsResult<Vec<InodeId>> {
        let mut current = self.resolve(&FsPath::root()).await?;
        let mut ids = vec![current.id];
        for name in path.components() {
            let child = current
                .children
                .get(name)
                .copied()
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            current = self
                .load(child)
                .await?
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            ids.push(current.id);
        }
        Ok(ids)
    }

    async fn update<F>(&self, path: &FsPath, apply: F) -> FsResult<Inode>
    where
        F: FnOnce(&mut Inode) + Send,
    {
        let id = self.resolve(path).await?.id;
        let mut locked = self
            .lock_inode(id)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        apply(&mut locked.inode);
        self.store(&locked.inode).await?;
        Ok(locked.inode)
    }

    /// `None` leaves the corresponding time unchanged.
    pub async fn set_times(
        &self,
        path: &FsPath,
        modification_time: Option<i64>,
        access_time: Option<i64>,
    ) -> FsResult<Inode> {
        self.update(path, |inode| {
            if let Some(t) = modification_time {
                inode.modification_time = t;
            }
            if let Some(t) = access_time {
                inode.access_time = t;
            }
        })
        .await
    }

    pub async fn set_permission(&self, path: &FsPath, permission: Permission) -> FsResult<Inode> {
        self.update(path, |inode| inode.permission = permission).await
    }

    pub async fn set_owner(&self, path: &FsPath, owner: &str, group: &str) -> FsResult<Inode> {
        if owner.is_empty() || group.is_empty() {
            return Err(FsError::InvalidArgument("owner and group must be non-empty".into()));
        }
        self.update(path, |inode| {
            inode.owner = owner.to_string();
            inode.group = group.to_string();
        })
        .await
    }

    pub async fn touch_access(&self, id: InodeId) -> FsResult<Option<Inode>> {
        let Some(mut locked) = self.lock_inode(id).await? else {
            return Ok(None);
        };
        locked.inode.access_time = now_millis();
        self.store(&locked.inode).await?;
        Ok(Some(locked.inode))
    }

    /// Takes the exclusive write lock on an existing file.
    pub async fn acquire_write_lock(
        &self,
        path: &FsPath,
        lock: WriteLock,
        is_stale: StaleLock<'_>,
    ) -> FsResult<Inode> {
        let found = self.resolve(path).await?;
        if found.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        let mut locked = self
            .lock_inode(found.id)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if let Some(held) = &locked.inode.lock {
            if !is_stale(held) {
                return Err(FsError::AlreadyInUse(path.to_string()));
            }
            warn!(%path, session = %held.session, "reclaiming write lock of a retired session");
        }
        locked.inode.lock = Some(lock);
        self.store(&locked.inode).await?;
        debug!(%path, id = %locked.inode.id, "write lock acquired");
        Ok(locked.inode)
    }

    /// Locks a file inode and checks that `handle` still owns its write lock.
    /// Fails with `NotFound` once the file has been deleted or replaced.
    pub async fn lock_owned_file(&self, id: InodeId, handle: uuid::Uuid) -> FsResult<LockedInode> {
        let locked = self
            .lock_inode(id)
            .await?
            .ok_or_else(|| FsError::NotFound(format!("inode {id} was removed")))?;
        match &locked.inode.lock {
            Some(held) if held.handle == handle => Ok(locked),
            _ => Err(FsError::AlreadyInUse(format!(
                "write lock on inode {id} is no longer held by handle {handle}"
            ))),
        }
    }

    /// Records the written length and times; with `release` the write lock is
    /// dropped in the same record update.
    pub async fn commit_write(
        &self,
        id: InodeId,
        handle: uuid::Uuid,
        length: u64,
        release: bool,
    ) -> FsResult<Inode> {
        let mut locked = self.lock_owned_file(id, handle).await?;
        let now = now_millis();
        locked.inode.length = length;
        locked.inode.modification_time = now;
        locked.inode.access_time = now;
        if release {
            locked.inode.lock = None;
        }
        self.store(&locked.inode).await?;
        if release {
            debug!(%id, length, "write lock released");
        }
        Ok(locked.inode)
    }
}
