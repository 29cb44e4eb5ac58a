use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream;
use nusgrab_fetch::{
    CancelToken, HttpClient, HttpError, HttpResponse, TicketForge, TransferEngine, TransferOptions,
};
use nusgrab_io::{Device, MemVfs, NoopEntropy, StorageLayout, Vfs, WriteQueue};
use nusgrab_queue::{
    BatchContext, Installer, OP_DOWNLOAD, OP_INSTALL, OperationQueue, QueueEntry, QueueError,
    SpaceOracle,
};
use nusgrab_tmd::TitleMetadata;
use sha2::{Digest, Sha256};

const GIB: u64 = 1024 * 1024 * 1024;

fn build_tmd(title_id: u64, contents: &[(u32, u16, u64)]) -> Vec<u8> {
    const INFO_OFF: usize = 0x204;
    const CONTENTS_OFF: usize = 0xB04;

    let n = contents.len();
    let mut tmd = vec![0u8; CONTENTS_OFF + n * 0x30];
    tmd[0x18C..0x194].copy_from_slice(&title_id.to_be_bytes());
    tmd[0x1DE..0x1E0].copy_from_slice(&(n as u16).to_be_bytes());
    for (i, (id, flags, size)) in contents.iter().enumerate() {
        let off = CONTENTS_OFF + i * 0x30;
        tmd[off..off + 4].copy_from_slice(&id.to_be_bytes());
        tmd[off + 4..off + 6].copy_from_slice(&(i as u16).to_be_bytes());
        tmd[off + 6..off + 8].copy_from_slice(&flags.to_be_bytes());
        tmd[off + 8..off + 16].copy_from_slice(&size.to_be_bytes());
    }
    tmd[INFO_OFF + 2..INFO_OFF + 4].copy_from_slice(&(n as u16).to_be_bytes());
    let content_digest = Sha256::digest(&tmd[CONTENTS_OFF..]);
    tmd[INFO_OFF + 4..INFO_OFF + 36].copy_from_slice(&content_digest);
    let info_digest = Sha256::digest(&tmd[INFO_OFF..CONTENTS_OFF]);
    tmd[0x1E4..0x204].copy_from_slice(&info_digest);
    tmd
}

fn metadata(title_id: u64, sizes: &[u64]) -> TitleMetadata {
    let contents: Vec<(u32, u16, u64)> = sizes
        .iter()
        .enumerate()
        .map(|(i, size)| (i as u32 + 1, 0x2001, *size))
        .collect();
    TitleMetadata::parse(build_tmd(title_id, &contents)).unwrap()
}

fn entry(title_id: u64, sizes: &[u64], ops: u8, download: Device, to_usb: bool) -> QueueEntry {
    QueueEntry {
        metadata: metadata(title_id, sizes),
        display_name: None,
        ops,
        download_device: download,
        install_to_usb: to_usb,
        keep_files: true,
        folder: None,
    }
}

#[derive(Default)]
struct MockState {
    responses: Mutex<VecDeque<Result<HttpResponse, HttpError>>>,
    urls: Mutex<Vec<String>>,
}

#[derive(Clone, Default)]
struct MockClient {
    state: Arc<MockState>,
}

impl MockClient {
    fn push_404(&self) {
        self.push_body(404, Vec::new());
    }

    fn push_body(&self, status: u16, bytes: Vec<u8>) {
        let chunks: Vec<Result<Bytes, HttpError>> = if bytes.is_empty() {
            Vec::new()
        } else {
            vec![Ok(Bytes::from(bytes))]
        };
        self.state
            .responses
            .lock()
            .unwrap()
            .push_back(Ok(HttpResponse {
                status,
                content_length: None,
                range_start: None,
                body: stream::iter(chunks).boxed(),
            }));
    }

    fn push_error(&self, error: HttpError) {
        self.state.responses.lock().unwrap().push_back(Err(error));
    }

    fn urls(&self) -> Vec<String> {
        self.state.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HttpClient for MockClient {
    async fn get(
        &self,
        url: &str,
        _resume_from: Option<u64>,
        _fresh: bool,
    ) -> Result<HttpResponse, HttpError> {
        self.state.urls.lock().unwrap().push(url.to_string());
        self.state
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("no scripted response for {url}"))
    }
}

struct FixedForge;

impl TicketForge for FixedForge {
    fn ticket(&self, _title_id: u64, _title_version: u16) -> Vec<u8> {
        b"forged-ticket".to_vec()
    }

    fn certificate_chain(&self) -> Vec<u8> {
        b"cert-chain".to_vec()
    }
}

#[derive(Default)]
struct RecordingInstaller {
    calls: Mutex<Vec<(u64, PathBuf, Device)>>,
    fail_with: Option<i32>,
}

#[async_trait]
impl Installer for RecordingInstaller {
    async fn install(
        &self,
        metadata: &TitleMetadata,
        source: &Path,
        target: Device,
        _cancel: &CancelToken,
    ) -> i32 {
        self.calls
            .lock()
            .unwrap()
            .push((metadata.title_id(), source.to_path_buf(), target));
        self.fail_with.unwrap_or(0)
    }
}

struct StubOracle {
    free: HashMap<Device, u64>,
}

impl StubOracle {
    fn new(free: &[(Device, u64)]) -> Self {
        Self {
            free: free.iter().copied().collect(),
        }
    }
}

impl SpaceOracle for StubOracle {
    fn free_bytes(&self, device: Device) -> Option<u64> {
        self.free.get(&device).copied()
    }

    fn total_bytes(&self, device: Device) -> Option<u64> {
        self.free.get(&device).copied()
    }
}

struct Rig {
    client: MockClient,
    engine: TransferEngine<MockClient>,
    queue: Arc<WriteQueue>,
    vfs: MemVfs,
    layout: StorageLayout,
}

fn rig() -> Rig {
    let vfs = MemVfs::new();
    let shared: Arc<dyn Vfs> = Arc::new(vfs.clone());
    let queue = Arc::new(WriteQueue::start(Arc::clone(&shared), Arc::new(NoopEntropy)).unwrap());
    let client = MockClient::default();
    let options = TransferOptions::default()
        .base_url("http://cdn")
        .max_attempts(1)
        .retry_countdown(Duration::ZERO);
    let engine = TransferEngine::new(
        client.clone(),
        Arc::clone(&queue),
        shared,
        Arc::new(NoopEntropy),
        options,
    );
    let layout = StorageLayout {
        usb_root: PathBuf::from("/storage/usb"),
        sd_root: PathBuf::from("/storage/sd"),
        mlc_root: PathBuf::from("/storage/mlc"),
    };
    Rig {
        client,
        engine,
        queue,
        vfs,
        layout,
    }
}

#[test]
fn test_duplicate_install_to_same_target_is_rejected() {
    let mut queue = OperationQueue::new();
    queue
        .enqueue(entry(1, &[100], OP_INSTALL, Device::Sd, true))
        .unwrap();

    let err = queue
        .enqueue(entry(1, &[100], OP_INSTALL, Device::Sd, true))
        .unwrap_err();
    assert_eq!(
        err,
        nusgrab_queue::EnqueueError::DuplicateInstall {
            device: Device::Usb
        }
    );
    assert_eq!(queue.len(), 1);

    // Same title to the other install target is a different job.
    queue
        .enqueue(entry(1, &[100], OP_INSTALL, Device::Sd, false))
        .unwrap();
    assert_eq!(queue.len(), 2);
}

#[test]
fn test_duplicate_download_to_same_device_is_rejected() {
    let mut queue = OperationQueue::new();
    queue
        .enqueue(entry(1, &[100], OP_DOWNLOAD, Device::Sd, false))
        .unwrap();

    let err = queue
        .enqueue(entry(1, &[100], OP_DOWNLOAD, Device::Sd, false))
        .unwrap_err();
    assert_eq!(
        err,
        nusgrab_queue::EnqueueError::DuplicateDownload { device: Device::Sd }
    );

    queue
        .enqueue(entry(1, &[100], OP_DOWNLOAD, Device::Usb, false))
        .unwrap();
    assert_eq!(queue.len(), 2);
}

#[test]
fn test_download_and_install_of_same_title_coexist() {
    let mut queue = OperationQueue::new();
    queue
        .enqueue(entry(1, &[100], OP_DOWNLOAD, Device::Sd, false))
        .unwrap();
    queue
        .enqueue(entry(1, &[100], OP_INSTALL, Device::Sd, false))
        .unwrap();
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn test_admission_shortfall_makes_no_network_calls() {
    let rig = rig();
    let mut queue = OperationQueue::new();
    // 5 GiB of retained download against a 4 GiB SD card.
    queue
        .enqueue(entry(
            1,
            &[3 * GIB, 2 * GIB],
            OP_DOWNLOAD,
            Device::Sd,
            false,
        ))
        .unwrap();

    let installer = RecordingInstaller::default();
    let oracle = StubOracle::new(&[(Device::Sd, 4 * GIB)]);
    let ctx = BatchContext {
        engine: &rig.engine,
        installer: &installer,
        forge: &FixedForge,
        oracle: &oracle,
        layout: &rig.layout,
    };

    let err = queue.process(&ctx, &CancelToken::new()).await.unwrap_err();
    match err {
        QueueError::InsufficientSpace {
            device,
            required,
            available,
        } => {
            assert_eq!(device, Device::Sd);
            assert_eq!(required, 5 * GIB);
            assert_eq!(available, 4 * GIB);
        }
        other => panic!("expected a space error, got {other:?}"),
    }

    // Nothing moved: no requests, no installs, entry still queued.
    assert!(rig.client.urls().is_empty());
    assert!(installer.calls.lock().unwrap().is_empty());
    assert_eq!(queue.len(), 1);
}

#[tokio::test]
async fn test_install_space_is_charged_to_the_install_target() {
    let rig = rig();
    let mut queue = OperationQueue::new();
    queue
        .enqueue(entry(1, &[GIB], OP_INSTALL, Device::Sd, false))
        .unwrap();

    let installer = RecordingInstaller::default();
    // Plenty on SD, nothing on internal storage where the install goes.
    let oracle = StubOracle::new(&[(Device::Sd, 10 * GIB), (Device::Mlc, GIB / 2)]);
    let ctx = BatchContext {
        engine: &rig.engine,
        installer: &installer,
        forge: &FixedForge,
        oracle: &oracle,
        layout: &rig.layout,
    };

    let err = queue.process(&ctx, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::InsufficientSpace {
            device: Device::Mlc,
            ..
        }
    ));
}

#[tokio::test]
async fn test_batch_drains_in_order_and_installs() {
    let rig = rig();
    let mut queue = OperationQueue::new();
    queue
        .enqueue(entry(
            0x0005_0000_0000_0001,
            &[4],
            OP_DOWNLOAD | OP_INSTALL,
            Device::Usb,
            true,
        ))
        .unwrap();
    queue
        .enqueue(entry(
            0x0005_0000_0000_0002,
            &[6],
            OP_DOWNLOAD | OP_INSTALL,
            Device::Usb,
            true,
        ))
        .unwrap();

    // Per title: no CDN ticket, then one content file.
    rig.client.push_404();
    rig.client.push_body(200, vec![0xAA; 4]);
    rig.client.push_404();
    rig.client.push_body(200, vec![0xBB; 6]);

    let installer = RecordingInstaller::default();
    let oracle = StubOracle::new(&[(Device::Usb, GIB)]);
    let ctx = BatchContext {
        engine: &rig.engine,
        installer: &installer,
        forge: &FixedForge,
        oracle: &oracle,
        layout: &rig.layout,
    };
    let progress = queue.progress();

    queue.process(&ctx, &CancelToken::new()).await.unwrap();
    rig.queue.flush().await.unwrap();

    assert!(queue.is_empty());
    let calls = installer.calls.lock().unwrap();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].0, 0x0005_0000_0000_0001);
    assert_eq!(
        calls[0].1,
        Path::new("/storage/usb/0005000000000001")
    );
    assert_eq!(calls[0].2, Device::Usb);
    assert_eq!(calls[1].0, 0x0005_0000_0000_0002);

    let snapshot = progress.borrow().clone();
    assert_eq!(snapshot.item, 2);
    assert_eq!(snapshot.items, 2);
    assert_eq!(snapshot.bytes_done, 10);
    assert_eq!(snapshot.bytes_total, 10);

    assert_eq!(
        rig.vfs
            .contents(Path::new("/storage/usb/0005000000000001/00000001.app"))
            .unwrap(),
        vec![0xAA; 4]
    );
}

#[tokio::test]
async fn test_failure_keeps_failed_and_unstarted_entries_queued() {
    let rig = rig();
    let mut queue = OperationQueue::new();
    queue
        .enqueue(entry(1, &[4], OP_DOWNLOAD | OP_INSTALL, Device::Usb, true))
        .unwrap();
    queue
        .enqueue(entry(2, &[6], OP_DOWNLOAD | OP_INSTALL, Device::Usb, true))
        .unwrap();
    queue
        .enqueue(entry(3, &[8], OP_DOWNLOAD | OP_INSTALL, Device::Usb, true))
        .unwrap();

    // First title succeeds, second dies on its content transfer.
    rig.client.push_404();
    rig.client.push_body(200, vec![0xAA; 4]);
    rig.client.push_404();
    rig.client.push_error(HttpError::Network("reset".into()));

    let installer = RecordingInstaller::default();
    let oracle = StubOracle::new(&[(Device::Usb, GIB)]);
    let ctx = BatchContext {
        engine: &rig.engine,
        installer: &installer,
        forge: &FixedForge,
        oracle: &oracle,
        layout: &rig.layout,
    };

    let err = queue.process(&ctx, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, QueueError::Transfer(_)));

    // The completed entry is consumed; the failed one and the one after
    // it stay queued for a later attempt.
    assert_eq!(queue.len(), 2);
    let remaining: Vec<u64> = queue.iter().map(|e| e.metadata.title_id()).collect();
    assert_eq!(remaining, vec![2, 3]);
    assert_eq!(installer.calls.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_install_stops_the_batch() {
    let rig = rig();
    let mut queue = OperationQueue::new();
    queue
        .enqueue(entry(1, &[4], OP_INSTALL, Device::Usb, false))
        .unwrap();
    queue
        .enqueue(entry(2, &[4], OP_INSTALL, Device::Usb, false))
        .unwrap();

    let installer = RecordingInstaller {
        fail_with: Some(-0x1F),
        ..Default::default()
    };
    let oracle = StubOracle::new(&[(Device::Mlc, GIB)]);
    let ctx = BatchContext {
        engine: &rig.engine,
        installer: &installer,
        forge: &FixedForge,
        oracle: &oracle,
        layout: &rig.layout,
    };

    let err = queue.process(&ctx, &CancelToken::new()).await.unwrap_err();
    assert!(matches!(err, QueueError::InstallFailed { code: -0x1F }));
    assert_eq!(queue.len(), 2);
}

#[tokio::test]
async fn test_cancelled_batch_stops_between_entries() {
    let rig = rig();
    let mut queue = OperationQueue::new();
    queue
        .enqueue(entry(1, &[4], OP_INSTALL, Device::Usb, false))
        .unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();

    let installer = RecordingInstaller::default();
    let oracle = StubOracle::new(&[(Device::Mlc, GIB)]);
    let ctx = BatchContext {
        engine: &rig.engine,
        installer: &installer,
        forge: &FixedForge,
        oracle: &oracle,
        layout: &rig.layout,
    };

    let err = queue.process(&ctx, &cancel).await.unwrap_err();
    assert!(matches!(err, QueueError::Cancelled));
    assert_eq!(queue.len(), 1);
    assert!(installer.calls.lock().unwrap().is_empty());
}

#[test]
fn test_queue_record_round_trips_through_serde() {
    let original = entry(0x0005_0000_0000_0042, &[128], OP_DOWNLOAD, Device::Sd, false);
    let json = serde_json::to_string(&original.to_record()).unwrap();
    let record: nusgrab_queue::QueueRecord = serde_json::from_str(&json).unwrap();
    let restored = QueueEntry::from_record(record).unwrap();

    assert_eq!(restored.metadata.title_id(), original.metadata.title_id());
    assert_eq!(restored.metadata.raw(), original.metadata.raw());
    assert_eq!(restored.ops, OP_DOWNLOAD);
    assert_eq!(restored.download_device, Device::Sd);
}
