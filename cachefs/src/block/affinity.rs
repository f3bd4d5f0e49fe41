//! Block-location reporting for locality-aware schedulers.

use super::affinity_key;
use super::layout::BlockLayout;
use crate::cadapter::{CacheBackend, NodeId};
use crate::error::{FsError, FsResult};
use crate::meta::inode::Inode;
use serde::Serialize;
use std::sync::Arc;

/// A contiguous file range and the node holding it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BlockLocation {
    pub offset: u64,
    pub length: u64,
    pub nodes: Vec<NodeId>,
}

pub struct AffinityResolver {
    backend: Arc<dyn CacheBackend>,
    layout: BlockLayout,
}

impl AffinityResolver {
    pub fn new(backend: Arc<dyn CacheBackend>, layout: BlockLayout) -> Self {
        Self { backend, layout }
    }

    /// One entry per block group touched by `[offset, offset + len)`, clipped
    /// to the file length. Uses the same function that placed the data.
    pub fn locate(&self, file: &Inode, offset: u64, len: u64) -> FsResult<Vec<BlockLocation>> {
        if file.is_dir() {
            return Err(FsError::IsADirectory(file.id.to_string()));
        }
        let end = offset.saturating_add(len).min(file.length);
        if offset >= end {
            return Ok(Vec::new());
        }
        let span = self.layout.group_span();
        let mut out = Vec::new();
        let mut cursor = offset;
        while cursor < end {
            let group = cursor / span;
            let group_end = ((group + 1) * span).min(end);
            let node = self
                .backend
                .affinity_node(&affinity_key(file.block_group_id, group))
                .ok_or_else(|| FsError::ConnectivityLost("cluster has no data nodes".into()))?;
            out.push(BlockLocation {
                offset: cursor,
                length: group_end - cursor,
                nodes: vec![node],
            });
            cursor = group_end;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::Connector;
    use crate::cadapter::memory::InMemoryCluster;
    use crate::meta::inode::Permission;

    #[tokio::test]
    async fn test_one_location_per_group() {
        let cluster = InMemoryCluster::new(3, 0);
        let resolver =
            AffinityResolver::new(cluster.connect().await.unwrap(), BlockLayout::new(10, 2));
        let mut file = Inode::new_file(Permission::DEFAULT, "u", "g");
        file.length = 95;

        let all = resolver.locate(&file, 0, u64::MAX).unwrap();
        assert_eq!(all.len(), 5);
        assert_eq!((all[0].offset, all[0].length), (0, 20));
        assert_eq!((all[4].offset, all[4].length), (80, 15));
        assert_eq!(all.iter().map(|l| l.length).sum::<u64>(), 95);

        let mid = resolver.locate(&file, 15, 10).unwrap();
        assert_eq!(mid.len(), 2);
        assert_eq!((mid[0].offset, mid[0].length), (15, 5));
        assert_eq!((mid[1].offset, mid[1].length), (20, 5));

        assert!(resolver.locate(&file, 95, 10).unwrap().is_empty());
        assert!(resolver.locate(&file, 3, 0).unwrap().is_empty());
    }
}
