//! Named options recognised by the filesystem core.
//!
//! Loading happens outside the crate; callers hand in an `FsConfig` built in
//! code or decoded from JSON. Every field has a default so partial documents
//! are accepted.

use crate::block::layout::{BlockLayout, DEFAULT_BLOCK_SIZE, DEFAULT_GROUP_SIZE};
use crate::error::{FsError, FsResult};
use crate::meta::inode::Permission;
use crate::vfs::mode::FsMode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Routes every path under `prefix` to `mode`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathModeRule {
    pub prefix: String,
    pub mode: FsMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Mode for paths that no rule in `path_modes` matches.
    pub default_mode: FsMode,
    /// Longest matching prefix wins.
    pub path_modes: Vec<PathModeRule>,
    pub block_size: u64,
    /// Blocks per affinity group.
    pub group_size: u64,
    pub write_buffer_size: usize,
    pub read_buffer_size: usize,
    /// Extra sequential blocks fetched together with a read miss.
    pub prefetch_blocks: u64,
    /// Entries in the local cache of complete blocks; 0 disables it.
    pub block_cache_capacity: u64,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub user: String,
    pub group: String,
    pub default_permission: Permission,
    /// Enables used/capacity space reporting.
    pub management_enabled: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            default_mode: FsMode::Primary,
            path_modes: Vec::new(),
            block_size: DEFAULT_BLOCK_SIZE,
            group_size: DEFAULT_GROUP_SIZE,
            write_buffer_size: 64 * 1024,
            read_buffer_size: 64 * 1024,
            prefetch_blocks: 0,
            block_cache_capacity: 1024,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 50,
            user: "cachefs".to_string(),
            group: "cachefs".to_string(),
            default_permission: Permission::DEFAULT,
            management_enabled: true,
        }
    }
}

impl FsConfig {
    /// Decode and validate a JSON document.
    pub fn from_json(raw: &str) -> FsResult<Self> {
        let config: FsConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> FsResult<()> {
        if self.block_size == 0 {
            return Err(FsError::InvalidArgument("block_size must be positive".into()));
        }
        if self.group_size == 0 {
            return Err(FsError::InvalidArgument("group_size must be positive".into()));
        }
        if self.write_buffer_size == 0 || self.read_buffer_size == 0 {
            return Err(FsError::InvalidArgument(
                "buffer sizes must be positive".into(),
            ));
        }
        if self.reconnect_attempts == 0 {
            return Err(FsError::InvalidArgument(
                "reconnect_attempts must be at least 1".into(),
            ));
        }
        if self.user.is_empty() || self.group.is_empty() {
            return Err(FsError::InvalidArgument(
                "default user and group must be set".into(),
            ));
        }
        Ok(())
    }

    pub fn layout(&self) -> BlockLayout {
        BlockLayout::new(self.block_size, self.group_size)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = FsConfig::from_json(
            r#"{
                "default_mode": "DUAL",
                "block_size": 4096,
                "path_modes": [{ "prefix": "/tmp", "mode": "PRIMARY" }]
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.default_mode, FsMode::Dual);
        assert_eq!(cfg.block_size, 4096);
        assert_eq!(cfg.group_size, DEFAULT_GROUP_SIZE);
        assert_eq!(cfg.path_modes.len(), 1);
        assert_eq!(cfg.default_permission, Permission::DEFAULT);
    }

    #[test]
    fn test_rejects_zero_sizes() {
        let err = FsConfig::from_json(r#"{ "group_size": 0 }"#).unwrap_err();
        assert!(matches!(err, FsError::InvalidArgument(_)));

        let cfg = FsConfig {
            write_buffer_size: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = FsConfig::from_json("{ not json").unwrap_err();
        assert!(matches!(err, FsError::Codec(_)));
    }
}
