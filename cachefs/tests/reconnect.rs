use cachefs::cadapter::memory::InMemoryCluster;
use cachefs::{CreateOptions, FileSystem, FsConfig, FsError, LinkState};
use std::sync::Arc;

fn config() -> FsConfig {
    FsConfig {
        block_size: 1024,
        group_size: 8,
        write_buffer_size: 2048,
        reconnect_attempts: 2,
        reconnect_backoff_ms: 1,
        ..Default::default()
    }
}

fn client(cluster: &InMemoryCluster) -> FileSystem {
    FileSystem::new(config(), Arc::new(cluster.clone())).unwrap()
}

async fn write_file(fs: &FileSystem, path: &str, data: &[u8]) {
    let mut w = fs.create(path, &CreateOptions::overwrite()).await.unwrap();
    w.write(data).await.unwrap();
    w.close().await.unwrap();
}

#[tokio::test]
async fn test_stale_handles_fail_after_restart() {
    let cluster = InMemoryCluster::new(3, 0);
    let fs = client(&cluster);
    write_file(&fs, "/data/file", &[7u8; 5000]).await;

    let mut reader = fs.open("/data/file", None).await.unwrap();
    let mut writer = fs.create("/data/other", &CreateOptions::default()).await.unwrap();
    assert_eq!(fs.open_handles().await.len(), 2);

    cluster.restart(false);

    // 旧句柄在集群恢复后失效
    let mut buf = [0u8; 64];
    assert!(reader.read(&mut buf).await.unwrap_err().is_connectivity());
    assert!(writer.write(&[1u8; 4096]).await.unwrap_err().is_connectivity());

    // 新打开的句柄走新会话
    let mut fresh = fs.open("/data/file", None).await.unwrap();
    assert_eq!(fresh.read_to_end().await.unwrap(), vec![7u8; 5000]);
    assert_eq!(fs.link_state(), LinkState::Connected);
    assert!(writer.write(b"x").await.unwrap_err().is_connectivity());
    assert!(writer.close().await.unwrap_err().is_connectivity());
    assert!(fs.open_handles().await.len() <= 1);
}

#[tokio::test]
async fn test_restart_with_data_loss() {
    let cluster = InMemoryCluster::new(2, 0);
    let fs = client(&cluster);
    write_file(&fs, "/lost/file", b"gone soon").await;
    let mut reader = fs.open("/lost/file", None).await.unwrap();

    cluster.restart(true);

    assert!(matches!(
        fs.get_file_status("/lost/file").await,
        Err(FsError::NotFound(_))
    ));
    assert!(fs.exists("/").await.unwrap());
    let mut buf = [0u8; 8];
    assert!(reader.read(&mut buf).await.unwrap_err().is_connectivity());

    write_file(&fs, "/lost/file", b"back").await;
    assert_eq!(
        fs.open("/lost/file", None)
            .await
            .unwrap()
            .read_to_end()
            .await
            .unwrap(),
        b"back"
    );
}

#[tokio::test]
async fn test_unreachable_cluster_surfaces_connectivity_error() {
    let cluster = InMemoryCluster::new(1, 0);
    let fs = client(&cluster);
    write_file(&fs, "/f", b"1").await;

    cluster.stop();
    let err = fs.exists("/f").await.unwrap_err();
    assert!(err.is_connectivity());
    assert_eq!(fs.link_state(), LinkState::Disconnected);
    assert!(fs.create("/g", &CreateOptions::default()).await.unwrap_err().is_connectivity());

    cluster.start(false);
    assert!(fs.exists("/f").await.unwrap());
    assert_eq!(fs.link_state(), LinkState::Connected);
}

#[tokio::test]
async fn test_stale_lock_is_reclaimed_by_same_client() {
    let cluster = InMemoryCluster::new(2, 0);
    let fs = client(&cluster);
    let other = client(&cluster);
    write_file(&fs, "/locked", b"v1").await;

    let mut abandoned = fs.append("/locked", None).await.unwrap();
    assert!(matches!(
        other.append("/locked", None).await.err(),
        Some(FsError::AlreadyInUse(_))
    ));

    cluster.restart(false);

    // 其他客户端无法判断该锁是否过期
    assert!(matches!(
        other.append("/locked", None).await.err(),
        Some(FsError::AlreadyInUse(_))
    ));
    // 持锁会话已被本客户端淘汰，可以接管
    let mut w = fs.append("/locked", None).await.unwrap();
    w.write(b"+v2").await.unwrap();
    w.close().await.unwrap();
    assert!(abandoned.close().await.unwrap_err().is_connectivity());

    let content = other.open("/locked", None).await.unwrap().read_to_end().await.unwrap();
    assert_eq!(content, b"v1+v2");
}

#[tokio::test]
async fn test_clients_share_single_writer_rule() {
    let cluster = InMemoryCluster::new(3, 0);
    let a = client(&cluster);
    let b = client(&cluster);

    let mut w = a.create("/shared", &CreateOptions::default()).await.unwrap();
    w.write(b"from a").await.unwrap();
    assert!(matches!(
        b.create("/shared", &CreateOptions::overwrite()).await.err(),
        Some(FsError::AlreadyInUse(_))
    ));
    assert!(matches!(
        b.create("/shared", &CreateOptions::default()).await.err(),
        Some(FsError::AlreadyExists(_))
    ));
    w.close().await.unwrap();

    assert_eq!(
        b.open("/shared", None).await.unwrap().read_to_end().await.unwrap(),
        b"from a"
    );
    let mut w = b.append("/shared", None).await.unwrap();
    w.write(b", then b").await.unwrap();
    w.close().await.unwrap();
    assert_eq!(
        a.open("/shared", None).await.unwrap().read_to_end().await.unwrap(),
        b"from a, then b"
    );
}
