//! Cluster session and the table of handles opened under it.

use super::mode::FsMode;
use crate::block::{AffinityResolver, BlockStore};
use crate::cadapter::CacheBackend;
use crate::config::FsConfig;
use crate::error::{FsError, FsResult};
use crate::meta::inode::{InodeId, WriteLock, now_millis};
use crate::meta::path::FsPath;
use crate::meta::tree::{MetaTree, TreeDefaults};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::warn;
use uuid::Uuid;

pub type HandleId = Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandleKind {
    Read,
    Write,
    Append,
}

#[derive(Clone, Debug)]
pub struct HandleEntry {
    pub path: FsPath,
    /// `None` for handles served by the secondary filesystem.
    pub file: Option<InodeId>,
    pub kind: HandleKind,
    pub mode: FsMode,
    pub opened_at: i64,
}

impl HandleEntry {
    pub fn new(path: FsPath, file: Option<InodeId>, kind: HandleKind, mode: FsMode) -> Self {
        Self {
            path,
            file,
            kind,
            mode,
            opened_at: now_millis(),
        }
    }
}

/// Ids of this client's torn-down sessions. Write locks they left behind
/// may be taken over.
#[derive(Default)]
pub struct RetiredSessions {
    ids: RwLock<HashSet<Uuid>>,
}

impl RetiredSessions {
    pub fn retire(&self, id: Uuid) {
        self.ids
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id);
    }

    pub fn contains(&self, id: &Uuid) -> bool {
        self.ids
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

pub struct Session {
    id: Uuid,
    backend: Arc<dyn CacheBackend>,
    meta: MetaTree,
    blocks: BlockStore,
    affinity: AffinityResolver,
    active: AtomicBool,
    handles: Mutex<HashMap<HandleId, HandleEntry>>,
    retired: Arc<RetiredSessions>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn new(
        backend: Arc<dyn CacheBackend>,
        config: &FsConfig,
        retired: Arc<RetiredSessions>,
    ) -> Self {
        let layout = config.layout();
        let defaults = TreeDefaults {
            owner: config.user.clone(),
            group: config.group.clone(),
            permission: config.default_permission,
        };
        Self {
            id: Uuid::new_v4(),
            meta: MetaTree::new(backend.clone(), defaults),
            blocks: BlockStore::new(backend.clone(), layout, config.block_cache_capacity),
            affinity: AffinityResolver::new(backend.clone(), layout),
            backend,
            active: AtomicBool::new(true),
            handles: Mutex::new(HashMap::new()),
            retired,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn meta(&self) -> &MetaTree {
        &self.meta
    }

    pub fn blocks(&self) -> &BlockStore {
        &self.blocks
    }

    pub fn affinity(&self) -> &AffinityResolver {
        &self.affinity
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn ensure_active(&self) -> FsResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(FsError::ConnectivityLost(format!(
                "session {} was invalidated",
                self.id
            )))
        }
    }

    /// Flags the session after a connectivity error; the coordinator
    /// replaces it on the next operation.
    pub fn mark_faulted(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            warn!(session = %self.id, "cluster session faulted");
        }
    }

    /// Passes `result` through, marking the session faulted on connectivity loss.
    pub fn observe<T>(&self, result: FsResult<T>) -> FsResult<T> {
        if let Err(e) = &result {
            if e.is_connectivity() {
                self.mark_faulted();
            }
        }
        result
    }

    /// Tears the session down: every registered handle is dropped from the
    /// table and the session's write locks become reclaimable.
    pub fn invalidate(&self) -> usize {
        self.active.store(false, Ordering::SeqCst);
        self.retired.retire(self.id);
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = handles.len();
        handles.clear();
        dropped
    }

    pub fn register(&self, handle: HandleId, entry: HandleEntry) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, entry);
    }

    pub fn unregister(&self, handle: HandleId) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle);
    }

    pub fn open_handles(&self) -> Vec<HandleEntry> {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn new_lock(&self, handle: HandleId) -> WriteLock {
        WriteLock {
            session: self.id,
            handle,
            since: now_millis(),
        }
    }

    pub fn is_stale_lock(&self, lock: &WriteLock) -> bool {
        lock.session != self.id && self.retired.contains(&lock.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::Connector;
    use crate::cadapter::memory::InMemoryCluster;

    async fn session(retired: Arc<RetiredSessions>) -> Session {
        let cluster = InMemoryCluster::new(1, 0);
        Session::new(cluster.connect().await.unwrap(), &FsConfig::default(), retired)
    }

    #[tokio::test]
    async fn test_handle_table_and_invalidate() {
        let retired = Arc::new(RetiredSessions::default());
        let s = session(retired.clone()).await;
        let file = Uuid::new_v4();
        let path = FsPath::parse("/f").unwrap();
        for _ in 0..2 {
            s.register(
                Uuid::new_v4(),
                HandleEntry::new(path.clone(), Some(file), HandleKind::Read, FsMode::Primary),
            );
        }
        let writer = Uuid::new_v4();
        s.register(
            writer,
            HandleEntry::new(path, Some(file), HandleKind::Append, FsMode::Primary),
        );
        assert_eq!(s.open_handles().len(), 3);

        s.unregister(writer);
        let open = s.open_handles();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|h| h.file == Some(file) && h.kind == HandleKind::Read));

        assert_eq!(s.invalidate(), 2);
        assert!(s.open_handles().is_empty());
        assert!(s.ensure_active().unwrap_err().is_connectivity());
        assert!(retired.contains(&s.id()));
    }

    #[tokio::test]
    async fn test_stale_lock_predicate() {
        let retired = Arc::new(RetiredSessions::default());
        let old = session(retired.clone()).await;
        let fresh = session(retired.clone()).await;
        let lock = old.new_lock(Uuid::new_v4());

        assert!(!fresh.is_stale_lock(&lock));
        old.invalidate();
        assert!(fresh.is_stale_lock(&lock));
        assert!(!fresh.is_stale_lock(&fresh.new_lock(Uuid::new_v4())));
    }

    #[tokio::test]
    async fn test_observe_marks_faulted() {
        let s = session(Arc::new(RetiredSessions::default())).await;
        let _ = s.observe::<()>(Err(FsError::NotFound("/x".into())));
        assert!(s.is_active());
        let _ = s.observe::<()>(Err(FsError::ConnectivityLost("gone".into())));
        assert!(!s.is_active());
    }
}
