//! 端到端演示：在进程内集群上依次执行
//! create/append/read/rename/locate/delete/reconnect。

use super::fs::{CreateOptions, FileSystem};
use crate::cadapter::memory::InMemoryCluster;
use crate::error::{FsError, FsResult};
use tracing::info;

/// Runs the walkthrough under `base`, verifying every step.
pub async fn walkthrough(fs: &FileSystem, cluster: &InMemoryCluster, base: &str) -> FsResult<()> {
    let file = format!("{base}/walkthrough/data.bin");
    let moved = format!("{base}/walkthrough/renamed.bin");
    let block_size = fs.config().block_size as usize;

    // 1) 跨块写入
    let first = (0..block_size + block_size / 2)
        .map(|i| (i % 251) as u8)
        .collect::<Vec<_>>();
    let mut writer = fs.create(&file, &CreateOptions::overwrite()).await?;
    writer.write(&first).await?;
    writer.close().await?;
    info!(path = %file, bytes = first.len(), "created");

    // 2) 追加
    let mut writer = fs.append(&file, None).await?;
    writer.write(b"appended tail").await?;
    writer.close().await?;

    // 3) 读回校验
    let mut reader = fs.open(&file, None).await?;
    let content = reader.read_to_end().await?;
    let mut expected = first.clone();
    expected.extend_from_slice(b"appended tail");
    if content != expected {
        return Err(FsError::InvalidArgument(format!("content mismatch in {file}")));
    }
    drop(reader);

    // 4) 重命名并查询块位置
    fs.rename(&file, &moved).await?;
    if fs.mode_of(&moved)? != super::mode::FsMode::Proxy {
        for location in fs.get_block_locations(&moved, 0, u64::MAX).await? {
            info!(
                offset = location.offset,
                length = location.length,
                nodes = ?location.nodes,
                "block location"
            );
        }
    }
    for status in fs.list_status(&format!("{base}/walkthrough")).await? {
        info!(
            path = %status.path,
            length = status.length,
            permission = %status.permission,
            "listed"
        );
    }

    // 5) 集群重启：旧句柄失效，新句柄可用
    let mut stale = fs.open(&moved, None).await?;
    cluster.restart(false);
    // 新操作触发重连，旧会话随之作废
    if !fs.exists(&moved).await? {
        return Err(FsError::NotFound(moved));
    }
    match stale.read_to_end().await {
        Err(e) if e.is_connectivity() => info!("stale handle rejected after restart"),
        other => {
            return Err(FsError::InvalidArgument(format!(
                "stale handle survived restart: {:?}",
                other.map(|v| v.len())
            )));
        }
    }
    let mut fresh = fs.open(&moved, None).await?;
    let again = fresh.read_to_end().await?;
    info!(bytes = again.len(), link = ?fs.link_state(), "reopened after reconnect");

    // 6) 删除
    fs.delete(&format!("{base}/walkthrough"), true).await?;
    if fs.exists(&moved).await? {
        return Err(FsError::InvalidArgument(format!("{moved} survived delete")));
    }
    if fs.config().management_enabled {
        info!(
            used = fs.used_space().await?,
            capacity = fs.capacity_space().await?,
            "space after cleanup"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FsConfig;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_walkthrough_on_primary() {
        let cluster = InMemoryCluster::new(3, 1 << 30);
        let config = FsConfig {
            block_size: 1024,
            group_size: 4,
            ..Default::default()
        };
        let fs = FileSystem::new(config, Arc::new(cluster.clone())).unwrap();
        walkthrough(&fs, &cluster, "/demo").await.unwrap();
    }
}
