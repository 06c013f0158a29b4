#[path = "common/mod.rs"]
mod common;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use common::{small_config, NetworkRegistry, TestNetwork, TestNode};
use kadshare::download::{DownloadReport, SpaceProbe};
use kadshare::{
    Contact, DownloadConfig, DownloadEngine, DownloadError, DownloadPlanner, FileChangesNotifier,
    FileDescriptor, OnlineContacts,
};

const CHUNK: u64 = 64 * 1024;
const BUCKET: &str = "shared";
const NAME: &str = "video.bin";

fn payload(len: u64) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn descriptor(size: u64, version: u64) -> FileDescriptor {
    FileDescriptor {
        bucket_id: BUCKET.into(),
        name: NAME.into(),
        hex_prefix: "9f3c".into(),
        version,
        size,
    }
}

fn download_config() -> DownloadConfig {
    DownloadConfig {
        max_chunk_size: CHUNK,
        min_free_reserve: 0,
        ..DownloadConfig::default()
    }
}

/// Free space per directory; anything unlisted reports `default`.
struct FakeSpace {
    default: u64,
    dirs: HashMap<PathBuf, u64>,
}

impl FakeSpace {
    fn plenty() -> Self {
        Self {
            default: u64::MAX,
            dirs: HashMap::new(),
        }
    }
}

impl SpaceProbe for FakeSpace {
    fn available_space(&self, dir: &Path) -> std::io::Result<u64> {
        Ok(self.dirs.get(dir).copied().unwrap_or(self.default))
    }
}

#[derive(Default)]
struct RecordingNotifier {
    seen: Mutex<Vec<(String, PathBuf)>>,
}

#[async_trait]
impl FileChangesNotifier for RecordingNotifier {
    async fn file_downloaded(&self, file: &FileDescriptor, path: &Path) {
        self.seen
            .lock()
            .await
            .push((file.name.clone(), path.to_path_buf()));
    }
}

struct Harness {
    registry: Arc<NetworkRegistry>,
    requester: TestNode,
    holders: Vec<TestNode>,
}

impl Harness {
    /// A requester plus `holders` nodes that each share `data` as version 1.
    async fn new(holders: u32, data: &[u8]) -> Self {
        let registry = Arc::new(NetworkRegistry::default());
        let requester = TestNode::new(registry.clone(), 1, small_config(20)).await;
        let mut nodes = Vec::new();
        for index in 0..holders {
            let node = TestNode::new(registry.clone(), 10 + index, small_config(20)).await;
            node.files.insert(BUCKET, NAME, 1, data.to_vec()).await;
            nodes.push(node);
        }
        Self {
            registry,
            requester,
            holders: nodes,
        }
    }

    fn engine_with(&self, config: DownloadConfig, space: FakeSpace) -> DownloadEngine<TestNetwork> {
        let rpc = self.requester.dht.rpc().clone();
        let online: Arc<dyn OnlineContacts> = Arc::new(self.requester.dht.clone());
        DownloadEngine::new(DownloadPlanner::new(rpc.clone(), config), rpc, online)
            .with_space_probe(Arc::new(space))
    }

    fn engine(&self) -> DownloadEngine<TestNetwork> {
        self.engine_with(download_config(), FakeSpace::plenty())
    }

    fn candidates(&self) -> Vec<Contact> {
        self.holders.iter().map(|h| h.contact()).collect()
    }

    fn endpoint(&self, holder: usize) -> String {
        self.holders[holder].contact().endpoint
    }
}

async fn read(report: &DownloadReport) -> Vec<u8> {
    tokio::fs::read(&report.path).await.expect("read downloaded file")
}

#[tokio::test]
async fn small_file_comes_from_first_responsive_holder() {
    let data = payload(10_000);
    let net = Harness::new(3, &data).await;
    net.registry.set_failure(&net.endpoint(0), true).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join(NAME);

    let report = net
        .engine()
        .download(
            &descriptor(data.len() as u64, 1),
            &target,
            net.candidates(),
            &CancellationToken::new(),
        )
        .await
        .expect("download succeeds");

    assert_eq!(report.path, target);
    assert_eq!(report.served_by, vec![net.holders[1].contact().id]);
    assert_eq!(read(&report).await, data);
    assert!(!net.registry.any_calls_to(&net.endpoint(2)).await);
}

#[tokio::test]
async fn empty_file_is_written_without_fetching_bytes() {
    let net = Harness::new(1, &[]).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join(NAME);

    let report = net
        .engine()
        .download(&descriptor(0, 1), &target, net.candidates(), &CancellationToken::new())
        .await
        .expect("download succeeds");

    assert!(read(&report).await.is_empty());
    assert_eq!(net.registry.calls_to(&net.endpoint(0), "download_chunk").await, 0);
}

#[tokio::test]
async fn wrong_version_everywhere_is_invalid_operation() {
    let data = payload(5_000);
    let net = Harness::new(2, &data).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let err = net
        .engine()
        .download(
            &descriptor(data.len() as u64, 7),
            &dir.path().join(NAME),
            net.candidates(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("no holder has version 7");
    assert!(matches!(err, DownloadError::InvalidOperation(_)));
}

#[tokio::test]
async fn big_file_is_split_across_holders() {
    let data = payload(10 * CHUNK);
    let net = Harness::new(4, &data).await;
    let notifier = Arc::new(RecordingNotifier::default());
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join("nested").join(NAME);

    let report = net
        .engine()
        .with_notifier(notifier.clone())
        .download(
            &descriptor(data.len() as u64, 1),
            &target,
            net.candidates(),
            &CancellationToken::new(),
        )
        .await
        .expect("download succeeds");

    assert_eq!(read(&report).await, data);
    assert_eq!(report.rounds, 1);
    assert_eq!(report.served_by.len(), 4);
    assert!(!target.with_file_name("video.bin.part").exists());
    for holder in 0..4 {
        assert!(net.registry.calls_to(&net.endpoint(holder), "download_chunk").await >= 1);
    }
    let seen = notifier.seen.lock().await;
    assert_eq!(seen.as_slice(), &[(NAME.to_string(), target.clone())]);
}

#[tokio::test]
async fn failed_holder_share_is_redistributed() {
    let data = payload(10 * CHUNK);
    let net = Harness::new(4, &data).await;
    net.registry.fail_chunks_after(&net.endpoint(1), 0).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let report = net
        .engine()
        .download(
            &descriptor(data.len() as u64, 1),
            &dir.path().join(NAME),
            net.candidates(),
            &CancellationToken::new(),
        )
        .await
        .expect("download succeeds");

    assert_eq!(read(&report).await, data);
    assert_eq!(report.rounds, 2);
    assert!(!report.served_by.contains(&net.holders[1].contact().id));
    assert_eq!(report.served_by.len(), 3);
}

#[tokio::test]
async fn replacement_holder_comes_from_online_contacts() {
    let data = payload(10 * CHUNK);
    let net = Harness::new(2, &data).await;
    net.registry.fail_chunks_after(&net.endpoint(0), 2).await;
    net.requester
        .dht
        .add_contact(net.holders[1].contact())
        .await;
    let dir = tempfile::tempdir().expect("tempdir");

    let report = net
        .engine()
        .download(
            &descriptor(data.len() as u64, 1),
            &dir.path().join(NAME),
            vec![net.holders[0].contact()],
            &CancellationToken::new(),
        )
        .await
        .expect("download succeeds");

    assert_eq!(read(&report).await, data);
    assert_eq!(report.rounds, 2);
    assert_eq!(
        report.served_by,
        vec![net.holders[0].contact().id, net.holders[1].contact().id]
    );
}

#[tokio::test]
async fn idle_holder_takes_over_when_busy_holders_fail() {
    let data = payload(3 * CHUNK);
    let net = Harness::new(3, &data).await;
    net.registry.fail_chunks_after(&net.endpoint(0), 1).await;
    net.registry.fail_chunks_after(&net.endpoint(1), 0).await;
    let dir = tempfile::tempdir().expect("tempdir");

    let report = net
        .engine()
        .download(
            &descriptor(data.len() as u64, 1),
            &dir.path().join(NAME),
            net.candidates(),
            &CancellationToken::new(),
        )
        .await
        .expect("the healthy holder finishes the file");

    assert_eq!(read(&report).await, data);
    assert!(report.rounds >= 2);
    assert!(report.served_by.contains(&net.holders[2].contact().id));
    assert!(!report.served_by.contains(&net.holders[1].contact().id));
}

#[tokio::test]
async fn exhausted_holders_leave_exact_missing_ranges() {
    let data = payload(10 * CHUNK);
    let net = Harness::new(1, &data).await;
    net.registry.fail_chunks_after(&net.endpoint(0), 4).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let target = dir.path().join(NAME);

    let err = net
        .engine()
        .download(
            &descriptor(data.len() as u64, 1),
            &target,
            net.candidates(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("only part of the file is available");

    match err {
        DownloadError::FilePartiallyDownloaded {
            remaining,
            temp_path,
        } => {
            assert_eq!(remaining.len(), 1);
            assert_eq!(remaining[0].start, 4 * CHUNK);
            assert_eq!(remaining[0].end, 10 * CHUNK - 1);
            assert_eq!(temp_path, dir.path().join("video.bin.part"));
            let partial = tokio::fs::read(&temp_path).await.expect("temp file kept");
            assert_eq!(&partial[..(4 * CHUNK) as usize], &data[..(4 * CHUNK) as usize]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!target.exists());
}

#[tokio::test]
async fn big_file_without_holders_is_invalid_operation() {
    let data = payload(3 * CHUNK);
    let net = Harness::new(2, &data).await;
    for holder in 0..2 {
        net.registry.set_failure(&net.endpoint(holder), true).await;
    }
    let dir = tempfile::tempdir().expect("tempdir");

    let err = net
        .engine()
        .download(
            &descriptor(data.len() as u64, 1),
            &dir.path().join(NAME),
            net.candidates(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("nobody answers");
    assert!(matches!(err, DownloadError::InvalidOperation(_)));
    assert!(!dir.path().join("video.bin.part").exists());
}

#[tokio::test]
async fn cancelled_download_leaves_no_temp_file() {
    let data = payload(4 * CHUNK);
    let net = Harness::new(2, &data).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = net
        .engine()
        .download(
            &descriptor(data.len() as u64, 1),
            &dir.path().join(NAME),
            net.candidates(),
            &cancel,
        )
        .await
        .expect_err("cancelled");
    assert!(matches!(err, DownloadError::Cancelled));
    assert!(!dir.path().join("video.bin.part").exists());
    assert!(!dir.path().join(NAME).exists());
}

#[tokio::test]
async fn cancel_during_transfer_discards_temp_file() {
    let data = payload(4 * CHUNK);
    let net = Harness::new(2, &data).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let cancel = CancellationToken::new();
    net.registry
        .cancel_on(&net.endpoint(0), "download_chunk", cancel.clone())
        .await;

    let err = net
        .engine()
        .download(
            &descriptor(data.len() as u64, 1),
            &dir.path().join(NAME),
            net.candidates(),
            &cancel,
        )
        .await
        .expect_err("cancelled mid-transfer");
    assert!(matches!(err, DownloadError::Cancelled));
    assert!(!dir.path().join("video.bin.part").exists());
    assert!(!dir.path().join(NAME).exists());
}

#[tokio::test]
async fn cancel_while_seeking_replacements_is_reported_as_cancelled() {
    let data = payload(10 * CHUNK);
    let net = Harness::new(2, &data).await;
    net.registry.fail_chunks_after(&net.endpoint(0), 2).await;
    net.requester
        .dht
        .add_contact(net.holders[1].contact())
        .await;
    let cancel = CancellationToken::new();
    net.registry
        .cancel_on(&net.endpoint(1), "file_exists", cancel.clone())
        .await;
    let dir = tempfile::tempdir().expect("tempdir");

    let err = net
        .engine()
        .download(
            &descriptor(data.len() as u64, 1),
            &dir.path().join(NAME),
            vec![net.holders[0].contact()],
            &cancel,
        )
        .await
        .expect_err("cancelled while probing");
    assert!(matches!(err, DownloadError::Cancelled));
    assert!(!dir.path().join("video.bin.part").exists());
    assert_eq!(net.registry.calls_to(&net.endpoint(1), "download_chunk").await, 0);
}

#[tokio::test]
async fn full_volume_relocates_to_alternate_directory() {
    let data = payload(2_000);
    let net = Harness::new(1, &data).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let primary = dir.path().join("primary");
    let alternate = dir.path().join("alternate");

    let config = DownloadConfig {
        alternate_dirs: vec![alternate.clone()],
        ..download_config()
    };
    let space = FakeSpace {
        default: u64::MAX,
        dirs: HashMap::from([(primary.clone(), 100)]),
    };

    let report = net
        .engine_with(config, space)
        .download(
            &descriptor(data.len() as u64, 1),
            &primary.join(NAME),
            net.candidates(),
            &CancellationToken::new(),
        )
        .await
        .expect("download succeeds");

    assert_eq!(report.path, alternate.join(NAME));
    assert_eq!(read(&report).await, data);
}

#[tokio::test]
async fn no_room_anywhere_is_reported_before_any_transfer() {
    let data = payload(2_000);
    let net = Harness::new(1, &data).await;
    let dir = tempfile::tempdir().expect("tempdir");
    let config = DownloadConfig {
        min_free_reserve: 500,
        alternate_dirs: vec![dir.path().join("alternate")],
        ..download_config()
    };
    let space = FakeSpace {
        default: 1_000,
        dirs: HashMap::new(),
    };

    let err = net
        .engine_with(config, space)
        .download(
            &descriptor(data.len() as u64, 1),
            &dir.path().join(NAME),
            net.candidates(),
            &CancellationToken::new(),
        )
        .await
        .expect_err("volume too small");

    match err {
        DownloadError::NotEnoughDriveSpace {
            required,
            available,
        } => {
            assert_eq!(required, 2_500);
            assert_eq!(available, 1_000);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!net.registry.any_calls_to(&net.endpoint(0)).await);
}
