//! The operation queue: admission, draining, claim accounting.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;

use nusgrab_fetch::{
    CancelToken, FetchError, FetchOutcome, HttpClient, TicketForge, TitleRequest, TransferEngine,
    folder_name,
};
use nusgrab_io::{Device, StorageLayout};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::entry::QueueEntry;
use crate::error::{EnqueueError, QueueError};
use crate::install::Installer;
use crate::space::{SpaceAccountant, SpaceOracle};

/// Aggregate snapshot across one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchProgress {
    /// 1-based index of the entry being worked on.
    pub item: usize,
    pub items: usize,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Everything a batch needs besides the entries themselves.
pub struct BatchContext<'a, C> {
    pub engine: &'a TransferEngine<C>,
    pub installer: &'a dyn Installer,
    pub forge: &'a dyn TicketForge,
    pub oracle: &'a dyn SpaceOracle,
    pub layout: &'a StorageLayout,
}

/// FIFO batch of download/install jobs with all-or-nothing admission.
#[derive(Debug)]
pub struct OperationQueue {
    entries: VecDeque<QueueEntry>,
    progress: watch::Sender<BatchProgress>,
    /// The previously completed entry, released only once its successor
    /// has begun, so its data stays inspectable through the transition.
    last_done: Option<QueueEntry>,
}

impl Default for OperationQueue {
    fn default() -> Self {
        let (progress, _) = watch::channel(BatchProgress::default());
        Self {
            entries: VecDeque::new(),
            progress,
            last_done: None,
        }
    }
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueueEntry> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_done = None;
    }

    /// Latest batch snapshot.
    pub fn progress(&self) -> watch::Receiver<BatchProgress> {
        self.progress.subscribe()
    }

    /// Add an entry, refusing duplicates.
    ///
    /// Two entries conflict when they install the same title to the same
    /// target, or download the same title to the same device. Anything
    /// else (same title, different device or different operation) is
    /// allowed.
    pub fn enqueue(&mut self, entry: QueueEntry) -> Result<(), EnqueueError> {
        for existing in &self.entries {
            if existing.metadata.title_id() != entry.metadata.title_id() {
                continue;
            }
            if existing.installs()
                && entry.installs()
                && existing.install_device() == entry.install_device()
            {
                return Err(EnqueueError::DuplicateInstall {
                    device: entry.install_device(),
                });
            }
            if existing.downloads()
                && entry.downloads()
                && existing.download_device == entry.download_device
            {
                return Err(EnqueueError::DuplicateDownload {
                    device: entry.download_device,
                });
            }
        }
        debug!(title_id = %entry.metadata.title_id_hex(), ops = entry.ops, "queued");
        self.entries.push_back(entry);
        Ok(())
    }

    /// Bytes each device class must hold for the whole batch.
    ///
    /// An install claims the raw content size on its target; a download
    /// that retains its files claims content plus hash-tree sidecars on
    /// the download device.
    fn required_bytes(&self) -> HashMap<Device, u64> {
        let mut required: HashMap<Device, u64> = HashMap::new();
        for entry in &self.entries {
            if entry.installs() {
                *required.entry(entry.install_device()).or_insert(0) +=
                    entry.metadata.install_size();
            }
            if entry.downloads() && entry.keep_files {
                *required.entry(entry.download_device).or_insert(0) +=
                    entry.metadata.download_size();
            }
        }
        required
    }

    fn title_directory(entry: &QueueEntry, layout: &StorageLayout) -> PathBuf {
        let name = match &entry.folder {
            Some(folder) => folder.clone(),
            None => folder_name(
                entry.display_name.as_deref(),
                entry.metadata.title_id(),
                entry.metadata.title_version(),
            ),
        };
        layout.root(entry.download_device).join(name)
    }

    /// Run the whole batch: admission first, then drain in insertion
    /// order. Stops at the first failure or cancellation, leaving the
    /// failed and unstarted entries queued.
    pub async fn process<C: HttpClient>(
        &mut self,
        ctx: &BatchContext<'_, C>,
        cancel: &CancelToken,
    ) -> Result<(), QueueError> {
        let mut accountant = SpaceAccountant::new(ctx.oracle);

        // All-or-nothing: any shortfall aborts before the first transfer.
        for (device, required) in self.required_bytes() {
            if required == 0 {
                continue;
            }
            let available = accountant.free_bytes(device).unwrap_or(0);
            if available < required {
                warn!(%device, required, available, "batch refused, not enough space");
                return Err(QueueError::InsufficientSpace {
                    device,
                    required,
                    available,
                });
            }
        }

        let items = self.entries.len();
        let bytes_total = self
            .entries
            .iter()
            .filter(|e| e.downloads())
            .map(|e| e.metadata.download_size())
            .sum();
        let mut snapshot = BatchProgress {
            item: 0,
            items,
            bytes_done: 0,
            bytes_total,
        };
        self.progress.send_replace(snapshot.clone());

        while let Some(entry) = self.entries.front() {
            if cancel.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            snapshot.item += 1;
            self.progress.send_replace(snapshot.clone());

            if entry.downloads() {
                let request = TitleRequest {
                    metadata: &entry.metadata,
                    display_name: entry.display_name.as_deref(),
                    folder: entry.folder.as_deref(),
                    root: ctx.layout.root(entry.download_device),
                };
                match ctx.engine.download_title(&request, ctx.forge, cancel).await {
                    FetchOutcome::Success => {}
                    FetchOutcome::Cancelled => return Err(QueueError::Cancelled),
                    FetchOutcome::Retryable(e) | FetchOutcome::Fatal(e) => {
                        warn!(title_id = %entry.metadata.title_id_hex(), error = %e, "batch stopped");
                        return Err(QueueError::Transfer(e));
                    }
                    // download_title forges missing tickets itself; kept
                    // for match completeness.
                    FetchOutcome::NeedsFallbackTicket => {
                        return Err(QueueError::Transfer(FetchError::NotFound));
                    }
                }
            }

            if entry.installs() {
                let source = Self::title_directory(entry, ctx.layout);
                let target = entry.install_device();
                let code = ctx
                    .installer
                    .install(&entry.metadata, &source, target, cancel)
                    .await;
                if code != 0 {
                    warn!(title_id = %entry.metadata.title_id_hex(), code, "install failed");
                    return Err(QueueError::InstallFailed { code });
                }
                accountant.claim(target, entry.metadata.install_size());
            }

            if entry.downloads() {
                snapshot.bytes_done += entry.metadata.download_size();
            }
            self.progress.send_replace(snapshot.clone());

            // Release the previous entry only now that this one is done.
            self.last_done = self.entries.pop_front();
        }

        self.last_done = None;
        Ok(())
    }
}
