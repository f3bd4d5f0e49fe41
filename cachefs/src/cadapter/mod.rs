//! Cache substrate adapter (cAdapter)
//!
//! Responsibilities:
//! - Describe the narrow capability the filesystem consumes from the
//!   replicated/partitioned key-value cache: keyed get/put/remove in two
//!   regions, per-key pessimistic locks and the affinity function used to
//!   place data.
//! - Hand out fresh cluster sessions through `Connector`; a session that loses
//!   its cluster reports `ConnectivityLost` from every call.
//!
//! Submodules:
//! - `memory`: in-process cluster used by tests and the demo binary

pub mod memory;

use crate::error::FsResult;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Cache region. Metadata is replicated to every node; data is partitioned.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Region {
    Meta,
    Data,
}

/// Identifier of a cluster node (partition owner).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A key plus the optional affinity key that decides its placement.
///
/// Keys sharing an affinity key land on the same node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub key: String,
    pub affinity: Option<String>,
}

impl CacheKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            affinity: None,
        }
    }

    pub fn with_affinity(key: impl Into<String>, affinity: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            affinity: Some(affinity.into()),
        }
    }

    pub fn affinity_key(&self) -> &str {
        self.affinity.as_deref().unwrap_or(&self.key)
    }
}

/// Held for as long as a key lock must stay taken; dropping releases it.
pub type KeyGuard = Box<dyn Send + Sync>;

/// One live session against the cache cluster.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Cheap liveness probe.
    async fn ping(&self) -> FsResult<()>;

    async fn get(&self, region: Region, key: &CacheKey) -> FsResult<Option<Bytes>>;

    async fn put(&self, region: Region, key: &CacheKey, value: Bytes) -> FsResult<()>;

    /// Returns whether a value was present.
    async fn remove(&self, region: Region, key: &CacheKey) -> FsResult<bool>;

    /// Pessimistic cluster-wide lock on `key`, held until the guard drops.
    async fn lock(&self, key: &str) -> FsResult<KeyGuard>;

    /// Node owning `affinity_key`. `put` places data with the same function.
    fn affinity_node(&self, affinity_key: &str) -> Option<NodeId>;

    fn nodes(&self) -> Vec<NodeId>;

    /// Bytes stored in the data region across all nodes.
    async fn used_space(&self) -> FsResult<u64>;

    async fn capacity(&self) -> FsResult<u64>;
}

/// Establishes new sessions; owned by whoever composes the filesystem.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> FsResult<Arc<dyn CacheBackend>>;
}
