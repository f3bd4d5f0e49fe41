use async_trait::async_trait;
use bytes::Bytes;
use cachefs::cadapter::memory::InMemoryCluster;
use cachefs::cadapter::{CacheBackend, CacheKey, Connector, KeyGuard, NodeId, Region};
use cachefs::{CreateOptions, FileKind, FileSystem, FsConfig, FsError, FsResult};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Barrier;

const BLOCK: u64 = 4096;

/// Backend that stalls a few milliseconds on reads and lock acquisition so
/// concurrent tree operations interleave.
struct Jittery {
    inner: Arc<dyn CacheBackend>,
    ticks: AtomicU64,
}

impl Jittery {
    async fn pause(&self) {
        let n = self.ticks.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(1 + n % 3)).await;
    }
}

#[async_trait]
impl CacheBackend for Jittery {
    async fn ping(&self) -> FsResult<()> {
        self.inner.ping().await
    }

    async fn get(&self, region: Region, key: &CacheKey) -> FsResult<Option<Bytes>> {
        self.pause().await;
        self.inner.get(region, key).await
    }

    async fn put(&self, region: Region, key: &CacheKey, value: Bytes) -> FsResult<()> {
        self.inner.put(region, key, value).await
    }

    async fn remove(&self, region: Region, key: &CacheKey) -> FsResult<bool> {
        self.inner.remove(region, key).await
    }

    async fn lock(&self, key: &str) -> FsResult<KeyGuard> {
        self.pause().await;
        self.inner.lock(key).await
    }

    fn affinity_node(&self, affinity_key: &str) -> Option<NodeId> {
        self.inner.affinity_node(affinity_key)
    }

    fn nodes(&self) -> Vec<NodeId> {
        self.inner.nodes()
    }

    async fn used_space(&self) -> FsResult<u64> {
        self.inner.used_space().await
    }

    async fn capacity(&self) -> FsResult<u64> {
        self.inner.capacity().await
    }
}

struct JitteryCluster(InMemoryCluster);

#[async_trait]
impl Connector for JitteryCluster {
    async fn connect(&self) -> FsResult<Arc<dyn CacheBackend>> {
        Ok(Arc::new(Jittery {
            inner: self.0.connect().await?,
            ticks: AtomicU64::new(0),
        }))
    }
}

fn config() -> FsConfig {
    FsConfig {
        block_size: BLOCK,
        group_size: 4,
        write_buffer_size: 8192,
        read_buffer_size: 8192,
        ..Default::default()
    }
}

fn setup() -> (InMemoryCluster, Arc<FileSystem>) {
    let cluster = InMemoryCluster::new(4, 1 << 30);
    let fs = FileSystem::new(config(), Arc::new(cluster.clone())).unwrap();
    (cluster, Arc::new(fs))
}

fn setup_jittery() -> (InMemoryCluster, Arc<FileSystem>) {
    let cluster = InMemoryCluster::new(4, 1 << 30);
    let fs = FileSystem::new(config(), Arc::new(JitteryCluster(cluster.clone()))).unwrap();
    (cluster, Arc::new(fs))
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(13).wrapping_add(seed)).collect()
}

async fn write_file(fs: &FileSystem, path: &str, data: &[u8]) {
    let mut w = fs.create(path, &CreateOptions::default()).await.unwrap();
    w.write(data).await.unwrap();
    w.close().await.unwrap();
}

/// Every entry reachable from the root, by path.
async fn reachable(fs: &FileSystem) -> HashMap<String, cachefs::FileStatus> {
    let mut found = HashMap::new();
    let mut pending = vec!["/".to_string()];
    while let Some(dir) = pending.pop() {
        for status in fs.list_status(&dir).await.unwrap() {
            let path = status.path.to_string();
            if status.kind == FileKind::Directory {
                pending.push(path.clone());
            }
            assert!(found.insert(path, status).is_none());
        }
    }
    found
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crossed_renames_never_detach_subtrees() {
    let (_cluster, fs) = setup_jittery();
    for round in 0..20 {
        let base = format!("/r{round}");
        write_file(&fs, &format!("{base}/p/a/fa"), b"a").await;
        write_file(&fs, &format!("{base}/q/b/fb"), b"b").await;
        let mut ids = BTreeSet::new();
        for path in ["p/a", "p/a/fa", "q/b", "q/b/fb"] {
            let status = fs.get_file_status(&format!("{base}/{path}")).await.unwrap();
            ids.insert(status.id.unwrap());
        }

        let barrier = Arc::new(Barrier::new(2));
        let moves = [
            (format!("{base}/p/a"), format!("{base}/q/b/x")),
            (format!("{base}/q/b"), format!("{base}/p/a/y")),
        ];
        let mut tasks = Vec::new();
        for (src, dst) in moves {
            let fs = fs.clone();
            let barrier = barrier.clone();
            tasks.push(tokio::spawn(async move {
                barrier.wait().await;
                fs.rename(&src, &dst).await
            }));
        }
        for task in tasks {
            match task.await.unwrap() {
                Ok(())
                | Err(FsError::NotFound(_))
                | Err(FsError::InvalidArgument(_))
                | Err(FsError::AlreadyExists(_)) => {}
                Err(e) => panic!("unexpected error in round {round}: {e}"),
            }
        }

        let visible = reachable(&fs)
            .await
            .into_values()
            .filter_map(|s| s.id)
            .collect::<BTreeSet<_>>();
        assert!(ids.is_subset(&visible), "round {round} lost a subtree");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mkdirs_share_ancestors() {
    let (_cluster, fs) = setup_jittery();
    const N: usize = 12;
    let barrier = Arc::new(Barrier::new(N));
    let mut tasks = Vec::new();
    for i in 0..N {
        let fs = fs.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            fs.mkdirs(&format!("/shared/t{}/leaf{i}", i % 3)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let tree = reachable(&fs).await;
    let tops = tree
        .keys()
        .filter(|p| p.matches('/').count() == 2)
        .cloned()
        .collect::<BTreeSet<_>>();
    assert_eq!(
        tops,
        ["/shared/t0", "/shared/t1", "/shared/t2"]
            .into_iter()
            .map(String::from)
            .collect()
    );
    for i in 0..N {
        let leaf = format!("/shared/t{}/leaf{i}", i % 3);
        assert_eq!(tree[&leaf].kind, FileKind::Directory);
    }
    assert_eq!(tree.len(), 1 + 3 + N);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_recursive_delete_has_one_winner() {
    let (cluster, fs) = setup();
    for i in 0..4 {
        write_file(&fs, &format!("/victim/sub{i}/file"), &pattern(2 * BLOCK as usize, i)).await;
    }
    assert!(cluster.data_entries() > 0);

    const N: usize = 6;
    let barrier = Arc::new(Barrier::new(N));
    let mut tasks = Vec::new();
    for _ in 0..N {
        let fs = fs.clone();
        let barrier = barrier.clone();
        tasks.push(tokio::spawn(async move {
            barrier.wait().await;
            fs.delete("/victim", true).await
        }));
    }
    let mut deleted = 0;
    for task in tasks {
        if task.await.unwrap().unwrap() {
            deleted += 1;
        }
    }
    assert_eq!(deleted, 1);
    assert!(!fs.exists("/victim").await.unwrap());
    assert!(fs.list_status("/").await.unwrap().is_empty());
    assert_eq!(cluster.data_entries(), 0);
}

#[tokio::test]
async fn test_reader_follows_file_across_rename() {
    let (_cluster, fs) = setup();
    let data = pattern(5 * BLOCK as usize + 123, 9);
    write_file(&fs, "/src/dir/file", &data).await;

    let mut reader = fs.open("/src/dir/file", None).await.unwrap();
    let mut head = [0u8; 100];
    assert_eq!(reader.read(&mut head).await.unwrap(), 100);
    fs.rename("/src/dir", "/elsewhere/dir").await.unwrap();

    // 后续块按 inode 读取，不依赖路径
    let rest = reader.read_to_end().await.unwrap();
    assert_eq!(&head[..], &data[..100]);
    assert_eq!(rest, &data[100..]);
    assert!(!fs.exists("/src/dir/file").await.unwrap());
}

#[tokio::test]
async fn test_buffered_reader_outlives_delete() {
    let (cluster, fs) = setup();
    // 小于一次预读，打开后首次读取即缓冲全文件
    let data = pattern(6000, 3);
    write_file(&fs, "/small", &data).await;

    let mut reader = fs.open("/small", None).await.unwrap();
    let mut head = [0u8; 10];
    assert_eq!(reader.read(&mut head).await.unwrap(), 10);
    assert!(fs.delete("/small", false).await.unwrap());
    assert_eq!(cluster.data_entries(), 0);

    let rest = reader.read_to_end().await.unwrap();
    assert_eq!(&head[..], &data[..10]);
    assert_eq!(rest, &data[10..]);
}
