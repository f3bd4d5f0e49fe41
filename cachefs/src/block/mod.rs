//! Block layer
//!
//! Responsibilities:
//! - Split file data into fixed-size blocks and group consecutive blocks
//!   under one affinity key (`layout`).
//! - Store and fetch blocks in the partitioned data region (`store`).
//! - Report which node holds which byte range of a file (`affinity`).

pub mod affinity;
pub mod layout;
pub mod store;

use uuid::Uuid;

/// Placement key shared by all blocks of one group of one file.
pub fn affinity_key(block_group_id: Uuid, group: u64) -> String {
    format!("{block_group_id}/{group}")
}

pub use affinity::{AffinityResolver, BlockLocation};
pub use layout::{BlockLayout, BlockSpan};
pub use store::{BlockStore, FileBlocks};
