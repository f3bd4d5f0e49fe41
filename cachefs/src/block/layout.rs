//! 块布局：文件偏移到块/组的换算，以及按块拆分文件范围。

/// 512 KiB blocks.
pub const DEFAULT_BLOCK_SIZE: u64 = 512 * 1024;
/// Consecutive blocks sharing one affinity key.
pub const DEFAULT_GROUP_SIZE: u64 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLayout {
    pub block_size: u64,
    pub group_size: u64,
}

impl Default for BlockLayout {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE, DEFAULT_GROUP_SIZE)
    }
}

impl BlockLayout {
    pub const fn new(block_size: u64, group_size: u64) -> Self {
        Self {
            block_size,
            group_size,
        }
    }

    pub fn block_index_of(&self, offset: u64) -> u64 {
        offset / self.block_size
    }

    pub fn within_block_offset(&self, offset: u64) -> u64 {
        offset % self.block_size
    }

    pub fn block_start(&self, index: u64) -> u64 {
        index * self.block_size
    }

    pub fn group_of(&self, block_index: u64) -> u64 {
        block_index / self.group_size
    }

    /// Bytes covered by one affinity group.
    pub fn group_span(&self) -> u64 {
        self.block_size * self.group_size
    }

    /// Number of blocks needed to hold `length` bytes.
    pub fn blocks_for(&self, length: u64) -> u64 {
        length.div_ceil(self.block_size)
    }
}

/// 文件范围在某个 block 内的一段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub block_index: u64,
    pub offset_in_block: u64,
    pub len: usize,
}

/// 将文件的 [offset, offset+len) 拆分为若干 block 局部范围。
pub fn split_range(layout: BlockLayout, mut offset: u64, len: usize) -> Vec<BlockSpan> {
    let mut remaining = len as u64;
    let mut out = Vec::new();
    while remaining > 0 {
        let index = layout.block_index_of(offset);
        let off = layout.within_block_offset(offset);
        let take = (layout.block_size - off).min(remaining);
        out.push(BlockSpan {
            block_index: index,
            offset_in_block: off,
            len: take as usize,
        });
        offset += take;
        remaining -= take;
    }
    out
}
