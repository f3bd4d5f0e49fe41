//! 进程内集群实现：用于测试与 demo，模拟分区/复制缓存与断连。
//!
//! Nodes sit on a SHA-256 consistent-hash ring. The meta region is shared by
//! all nodes (replicated); the data region is partitioned by affinity key.
//! `stop`/`start` simulate an outage: every session handed out before a
//! restart keeps failing with `ConnectivityLost`.

use super::{CacheBackend, CacheKey, Connector, KeyGuard, NodeId, Region};
use crate::error::{FsError, FsResult};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

const VIRTUAL_NODES: usize = 64;

fn hash64(input: &str) -> u64 {
    let digest = Sha256::digest(input.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

struct HashRing {
    ring: BTreeMap<u64, NodeId>,
    nodes: Vec<NodeId>,
}

impl HashRing {
    fn new(nodes: Vec<NodeId>) -> Self {
        let mut ring = BTreeMap::new();
        for node in &nodes {
            for v in 0..VIRTUAL_NODES {
                ring.insert(hash64(&format!("{node}#{v}")), node.clone());
            }
        }
        Self { ring, nodes }
    }

    fn locate(&self, key: &str) -> Option<NodeId> {
        let h = hash64(key);
        self.ring
            .range(h..)
            .next()
            .or_else(|| self.ring.iter().next())
            .map(|(_, node)| node.clone())
    }
}

#[derive(Default)]
struct LockTable {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl LockTable {
    async fn acquire(self: &Arc<Self>, key: String) -> TableGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            slots.entry(key.clone()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        TableGuard {
            table: self.clone(),
            key,
            guard: Some(guard),
        }
    }
}

struct TableGuard {
    table: Arc<LockTable>,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TableGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self
            .table
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // 无人等待时回收槽位
        let idle = slots
            .get(&self.key)
            .map(|slot| Arc::strong_count(slot) == 1)
            .unwrap_or(false);
        if idle {
            slots.remove(&self.key);
        }
    }
}

#[derive(Default)]
struct ClusterState {
    meta: HashMap<String, Bytes>,
    partitions: HashMap<NodeId, HashMap<String, Bytes>>,
}

struct ClusterInner {
    ring: HashRing,
    node_capacity: u64,
    online: AtomicBool,
    generation: AtomicU64,
    state: RwLock<ClusterState>,
    locks: Arc<LockTable>,
}

/// In-process stand-in for the distributed cache cluster.
#[derive(Clone)]
pub struct InMemoryCluster {
    inner: Arc<ClusterInner>,
}

impl InMemoryCluster {
    pub fn new(node_count: usize, node_capacity: u64) -> Self {
        let nodes = (0..node_count)
            .map(|i| NodeId(format!("node-{i}")))
            .collect::<Vec<_>>();
        Self {
            inner: Arc::new(ClusterInner {
                ring: HashRing::new(nodes),
                node_capacity,
                online: AtomicBool::new(true),
                generation: AtomicU64::new(1),
                state: RwLock::new(ClusterState::default()),
                locks: Arc::new(LockTable::default()),
            }),
        }
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.inner.ring.nodes.clone()
    }

    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Makes the cluster unreachable; existing sessions start failing.
    pub fn stop(&self) {
        self.inner.online.store(false, Ordering::SeqCst);
        info!(generation = self.generation(), "in-memory cluster stopped");
    }

    /// Brings the cluster back under a new generation, optionally losing
    /// all stored data.
    pub fn start(&self, wipe: bool) {
        if wipe {
            let mut state = self
                .inner
                .state
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            *state = ClusterState::default();
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.online.store(true, Ordering::SeqCst);
        info!(generation, wipe, "in-memory cluster started");
    }

    pub fn restart(&self, wipe: bool) {
        self.stop();
        self.start(wipe);
    }

    /// Node physically holding data-region `key`, if stored.
    pub fn holder_of(&self, key: &str) -> Option<NodeId> {
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        state
            .partitions
            .iter()
            .find(|(_, part)| part.contains_key(key))
            .map(|(node, _)| node.clone())
    }

    pub fn data_entries(&self) -> usize {
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        state.partitions.values().map(|p| p.len()).sum()
    }
}

#[async_trait]
impl Connector for InMemoryCluster {
    async fn connect(&self) -> FsResult<Arc<dyn CacheBackend>> {
        if !self.is_online() {
            return Err(FsError::ConnectivityLost("cluster is unreachable".into()));
        }
        let generation = self.generation();
        debug!(generation, "opened in-memory cluster session");
        Ok(Arc::new(ClusterSession {
            inner: self.inner.clone(),
            generation,
        }))
    }
}

/// Session bound to one cluster generation.
struct ClusterSession {
    inner: Arc<ClusterInner>,
    generation: u64,
}

impl ClusterSession {
    fn check(&self) -> FsResult<()> {
        let online = self.inner.online.load(Ordering::SeqCst);
        if !online || self.inner.generation.load(Ordering::SeqCst) != self.generation {
            return Err(FsError::ConnectivityLost(format!(
                "cluster session of generation {} is gone",
                self.generation
            )));
        }
        Ok(())
    }

    fn data_node(&self, key: &CacheKey) -> FsResult<NodeId> {
        self.inner
            .ring
            .locate(key.affinity_key())
            .ok_or_else(|| FsError::ConnectivityLost("cluster has no data nodes".into()))
    }
}

#[async_trait]
impl CacheBackend for ClusterSession {
    async fn ping(&self) -> FsResult<()> {
        self.check()
    }

    async fn get(&self, region: Region, key: &CacheKey) -> FsResult<Option<Bytes>> {
        self.check()?;
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let value = match region {
            Region::Meta => state.meta.get(&key.key).cloned(),
            Region::Data => {
                let node = self.data_node(key)?;
                state
                    .partitions
                    .get(&node)
                    .and_then(|p| p.get(&key.key))
                    .cloned()
            }
        };
        Ok(value)
    }

    async fn put(&self, region: Region, key: &CacheKey, value: Bytes) -> FsResult<()> {
        self.check()?;
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match region {
            Region::Meta => {
                state.meta.insert(key.key.clone(), value);
            }
            Region::Data => {
                let node = self.data_node(key)?;
                state
                    .partitions
                    .entry(node)
                    .or_default()
                    .insert(key.key.clone(), value);
            }
        }
        Ok(())
    }

    async fn remove(&self, region: Region, key: &CacheKey) -> FsResult<bool> {
        self.check()?;
        let mut state = self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let removed = match region {
            Region::Meta => state.meta.remove(&key.key).is_some(),
            Region::Data => {
                let node = self.data_node(key)?;
                state
                    .partitions
                    .get_mut(&node)
                    .and_then(|p| p.remove(&key.key))
                    .is_some()
            }
        };
        Ok(removed)
    }

    async fn lock(&self, key: &str) -> FsResult<KeyGuard> {
        self.check()?;
        let guard = self
            .inner
            .locks
            .acquire(format!("{}:{key}", self.generation))
            .await;
        // 等待期间集群可能已重启
        self.check()?;
        Ok(Box::new(guard))
    }

    fn affinity_node(&self, affinity_key: &str) -> Option<NodeId> {
        self.inner.ring.locate(affinity_key)
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.inner.ring.nodes.clone()
    }

    async fn used_space(&self) -> FsResult<u64> {
        self.check()?;
        let state = self
            .inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        Ok(state
            .partitions
            .values()
            .flat_map(|p| p.values())
            .map(|v| v.len() as u64)
            .sum())
    }

    async fn capacity(&self) -> FsResult<u64> {
        self.check()?;
        Ok(self.inner.node_capacity * self.inner.ring.nodes.len() as u64)
    }
}
