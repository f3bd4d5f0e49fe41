//! 块存储：文件数据以定长块存放在数据区，同组块共享亲和键。
//!
//! Block `i` of file `f` lives under `block/{f}/{i}` and is placed by the
//! affinity key of its group, so a whole group sits on one node. Only the
//! last block of a file may be short.

use super::affinity_key;
use super::layout::{BlockLayout, split_range};
use crate::cadapter::{CacheBackend, CacheKey, Region};
use crate::error::{FsError, FsResult};
use crate::meta::inode::{Inode, InodeId};
use bytes::{Bytes, BytesMut};
use futures::future::try_join_all;
use moka::future::Cache;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Identity under which a file's blocks are stored and placed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileBlocks {
    pub id: InodeId,
    pub block_group_id: Uuid,
}

impl From<&Inode> for FileBlocks {
    fn from(inode: &Inode) -> Self {
        Self {
            id: inode.id,
            block_group_id: inode.block_group_id,
        }
    }
}

pub struct BlockStore {
    backend: Arc<dyn CacheBackend>,
    layout: BlockLayout,
    /// 仅缓存完整块：完整块写入后不再变化
    block_cache: Option<Cache<(InodeId, u64), Bytes>>,
}

impl BlockStore {
    pub fn new(backend: Arc<dyn CacheBackend>, layout: BlockLayout, cache_capacity: u64) -> Self {
        let block_cache = (cache_capacity > 0).then(|| Cache::new(cache_capacity));
        Self {
            backend,
            layout,
            block_cache,
        }
    }

    pub fn layout(&self) -> BlockLayout {
        self.layout
    }

    fn key_for(&self, file: FileBlocks, index: u64) -> CacheKey {
        CacheKey::with_affinity(
            format!("block/{}/{index}", file.id),
            affinity_key(file.block_group_id, self.layout.group_of(index)),
        )
    }

    pub async fn read_block(&self, file: FileBlocks, index: u64) -> FsResult<Bytes> {
        if let Some(cache) = &self.block_cache {
            if let Some(hit) = cache.get(&(file.id, index)).await {
                return Ok(hit);
            }
        }
        let data = self
            .backend
            .get(Region::Data, &self.key_for(file, index))
            .await?
            .ok_or_else(|| FsError::NotFound(format!("block {index} of file {}", file.id)))?;
        if let Some(cache) = &self.block_cache {
            if data.len() as u64 == self.layout.block_size {
                cache.insert((file.id, index), data.clone()).await;
            }
        }
        Ok(data)
    }

    pub async fn write_block(&self, file: FileBlocks, index: u64, data: Bytes) -> FsResult<()> {
        if data.len() as u64 > self.layout.block_size {
            return Err(FsError::InvalidArgument(format!(
                "block of {} bytes exceeds block size {}",
                data.len(),
                self.layout.block_size
            )));
        }
        if let Some(cache) = &self.block_cache {
            cache.invalidate(&(file.id, index)).await;
        }
        self.backend
            .put(Region::Data, &self.key_for(file, index), data)
            .await
    }

    /// Reads `[offset, offset + len)` clipped to `file_len`; blocks are fetched concurrently.
    pub async fn read_range(
        &self,
        file: FileBlocks,
        file_len: u64,
        offset: u64,
        len: usize,
    ) -> FsResult<Bytes> {
        if offset >= file_len || len == 0 {
            return Ok(Bytes::new());
        }
        let len = (len as u64).min(file_len - offset) as usize;
        let spans = split_range(self.layout, offset, len);
        let blocks =
            try_join_all(spans.iter().map(|span| self.read_block(file, span.block_index))).await?;

        let mut out = BytesMut::with_capacity(len);
        for (span, block) in spans.iter().zip(blocks) {
            let start = span.offset_in_block as usize;
            let end = start + span.len;
            if block.len() < end {
                return Err(FsError::NotFound(format!(
                    "block {} of file {} is shorter than the committed length",
                    span.block_index, file.id
                )));
            }
            out.extend_from_slice(&block[start..end]);
        }
        Ok(out.freeze())
    }

    /// Removes every block of a file, including tail blocks written past the
    /// committed `length`. Returns how many blocks were dropped.
    pub async fn remove_blocks(&self, file: FileBlocks, length: u64) -> FsResult<u64> {
        let committed = self.layout.blocks_for(length);
        let mut removed = 0;
        let mut index = 0;
        loop {
            if let Some(cache) = &self.block_cache {
                cache.invalidate(&(file.id, index)).await;
            }
            let existed = self
                .backend
                .remove(Region::Data, &self.key_for(file, index))
                .await?;
            if existed {
                removed += 1;
            } else if index >= committed {
                break;
            }
            index += 1;
        }
        debug!(file = %file.id, removed, "released blocks");
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::Connector;
    use crate::cadapter::memory::InMemoryCluster;

    fn file() -> FileBlocks {
        FileBlocks {
            id: Uuid::new_v4(),
            block_group_id: Uuid::new_v4(),
        }
    }

    async fn store(cluster: &InMemoryCluster) -> BlockStore {
        BlockStore::new(cluster.connect().await.unwrap(), BlockLayout::new(8, 2), 16)
    }

    #[tokio::test]
    async fn test_read_range_across_blocks() {
        let cluster = InMemoryCluster::new(3, 0);
        let store = store(&cluster).await;
        let f = file();
        store.write_block(f, 0, Bytes::from_static(b"01234567")).await.unwrap();
        store.write_block(f, 1, Bytes::from_static(b"89abcdef")).await.unwrap();
        store.write_block(f, 2, Bytes::from_static(b"ghi")).await.unwrap();

        let got = store.read_range(f, 19, 6, 8).await.unwrap();
        assert_eq!(&got[..], b"6789abcd");
        // 超出文件长度的部分被裁剪
        let tail = store.read_range(f, 19, 15, 100).await.unwrap();
        assert_eq!(&tail[..], b"fghi");
        assert!(store.read_range(f, 19, 19, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_group_blocks_share_a_node() {
        let cluster = InMemoryCluster::new(4, 0);
        let store = store(&cluster).await;
        let f = file();
        for i in 0..6 {
            store.write_block(f, i, Bytes::from(vec![i as u8; 8])).await.unwrap();
        }
        for group in 0..3u64 {
            let a = cluster.holder_of(&format!("block/{}/{}", f.id, group * 2));
            let b = cluster.holder_of(&format!("block/{}/{}", f.id, group * 2 + 1));
            assert!(a.is_some());
            assert_eq!(a, b);
        }
    }

    #[tokio::test]
    async fn test_oversized_block_rejected() {
        let cluster = InMemoryCluster::new(1, 0);
        let store = store(&cluster).await;
        let err = store
            .write_block(file(), 0, Bytes::from(vec![0u8; 9]))
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_remove_includes_uncommitted_tail() {
        let cluster = InMemoryCluster::new(2, 0);
        let store = store(&cluster).await;
        let f = file();
        for i in 0..4 {
            store.write_block(f, i, Bytes::from(vec![1u8; 8])).await.unwrap();
        }
        // 只提交了前两块的长度
        assert_eq!(store.remove_blocks(f, 16).await.unwrap(), 4);
        assert_eq!(cluster.data_entries(), 0);
        assert!(store.read_block(f, 0).await.unwrap_err().is_not_found());
    }
}
