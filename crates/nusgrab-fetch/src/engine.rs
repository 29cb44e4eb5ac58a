//! The transfer engine: resumable CDN fetches with classified outcomes.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use nusgrab_io::{EntropySink, Vfs, WriteHandle, WriteQueue, WriteQueueError};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::error::{FetchError, HttpError};
use crate::http::{BodyStream, HttpClient};
use crate::progress::{SpeedEstimator, TitleProgress, TransferProgress, eta};

/// What a URL is expected to hold; decides how a 404 is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    /// Title metadata. Missing means the title is not published.
    Metadata,
    /// License ticket. Missing means a fallback ticket must be forged.
    Ticket,
    /// Content or hash-tree data.
    Content,
}

/// How one transfer ended.
#[derive(Debug)]
pub enum FetchOutcome {
    Success,

    /// The CDN has no ticket for this title; the caller should forge one.
    NeedsFallbackTicket,

    /// Cancelled cooperatively. Bytes already queued still drain through
    /// the write worker.
    Cancelled,

    /// Failed, worth offering a retry.
    Retryable(FetchError),

    /// Failed for good (missing title, bad metadata, storage fault).
    Fatal(FetchError),
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, FetchOutcome::Success)
    }
}

/// Engine configuration.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use nusgrab_fetch::TransferOptions;
///
/// let options = TransferOptions::default()
///     .max_attempts(5)
///     .retry_countdown(Duration::from_secs(3));
/// ```
#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Total connection attempts per transfer, initial try included.
    pub max_attempts: u32,

    /// Whether network-class failures retry without asking.
    pub auto_retry: bool,

    /// Wait before an automatic retry, checked against cancellation
    /// once per second.
    pub retry_countdown: Duration,

    /// CDN base; title paths are appended as `{base}/{title id as hex}`.
    pub base_url: String,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            auto_retry: true,
            retry_countdown: Duration::from_secs(9),
            base_url: "http://ccs.cdn.wup.shop.nintendo.net/ccs/download".into(),
        }
    }
}

impl TransferOptions {
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    #[must_use]
    pub fn auto_retry(mut self, enabled: bool) -> Self {
        self.auto_retry = enabled;
        self
    }

    #[must_use]
    pub fn retry_countdown(mut self, wait: Duration) -> Self {
        self.retry_countdown = wait;
        self
    }

    #[must_use]
    pub fn base_url(mut self, base: impl Into<String>) -> Self {
        self.base_url = base.into();
        self
    }
}

/// Failure of a single connection attempt, before classification.
enum Attempt {
    Http(HttpError),
    Status(u16),
    /// The server answered a range request with a 200, or a 206 whose
    /// start offset is not the one asked for.
    RangeMismatch,
    Storage(WriteQueueError),
    Cancelled,
}

/// Streams CDN payloads into the write queue or into memory.
pub struct TransferEngine<C> {
    client: C,
    queue: Arc<WriteQueue>,
    vfs: Arc<dyn Vfs>,
    entropy: Arc<dyn EntropySink>,
    options: TransferOptions,
    progress: watch::Sender<TransferProgress>,
    title_progress: watch::Sender<TitleProgress>,
}

impl<C: HttpClient> TransferEngine<C> {
    pub fn new(
        client: C,
        queue: Arc<WriteQueue>,
        vfs: Arc<dyn Vfs>,
        entropy: Arc<dyn EntropySink>,
        options: TransferOptions,
    ) -> Self {
        let (progress, _) = watch::channel(TransferProgress::default());
        let (title_progress, _) = watch::channel(TitleProgress::default());
        Self {
            client,
            queue,
            vfs,
            entropy,
            options,
            progress,
            title_progress,
        }
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    pub(crate) fn vfs(&self) -> &dyn Vfs {
        self.vfs.as_ref()
    }

    pub(crate) fn queue(&self) -> &WriteQueue {
        &self.queue
    }

    /// Latest per-transfer snapshot.
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.subscribe()
    }

    /// Latest per-title aggregate snapshot.
    pub fn title_progress(&self) -> watch::Receiver<TitleProgress> {
        self.title_progress.subscribe()
    }

    pub(crate) fn send_title_progress(&self, snapshot: TitleProgress) {
        self.title_progress.send_replace(snapshot);
    }

    /// Stream `url` to `path` through the write queue.
    ///
    /// `expected` is the size the metadata promises. A destination
    /// already at that size is skipped; a longer one is discarded and
    /// refetched; anything in between resumes with a byte range.
    pub async fn fetch_to_file(
        &self,
        url: &str,
        kind: PayloadKind,
        path: &Path,
        expected: Option<u64>,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        let mut fresh = false;
        let mut range_restarted = false;
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return FetchOutcome::Cancelled;
            }

            let on_disk = match self.vfs.size(path) {
                Ok(len) => len.unwrap_or(0),
                Err(e) => return FetchOutcome::Fatal(WriteQueueError::Open(e).into()),
            };
            let resume_from = match expected {
                Some(total) if total > 0 && on_disk == total => {
                    debug!(url, total, "already complete, skipping");
                    return FetchOutcome::Success;
                }
                Some(total) if on_disk > total => {
                    warn!(url, on_disk, total, "partial larger than expected, restarting");
                    let _ = self.vfs.remove(path);
                    None
                }
                _ if on_disk > 0 => Some(on_disk),
                _ => None,
            };

            let failed = match self
                .attempt_file(url, path, expected, resume_from, fresh, attempt, cancel)
                .await
            {
                Ok(()) => return FetchOutcome::Success,
                Err(failed) => failed,
            };

            match failed {
                Attempt::Cancelled => return FetchOutcome::Cancelled,
                Attempt::RangeMismatch => {
                    if range_restarted {
                        return FetchOutcome::Retryable(FetchError::Network(
                            "server rejected range resume twice".into(),
                        ));
                    }
                    warn!(url, "server mishandled range request, restarting from zero");
                    range_restarted = true;
                    fresh = true;
                    let _ = self.vfs.remove(path);
                }
                Attempt::Status(404) => {
                    return match kind {
                        PayloadKind::Metadata => FetchOutcome::Fatal(FetchError::NotFound),
                        PayloadKind::Ticket => FetchOutcome::NeedsFallbackTicket,
                        PayloadKind::Content => {
                            let _ = self.vfs.remove(path);
                            FetchOutcome::Retryable(FetchError::Protocol { status: 404 })
                        }
                    };
                }
                Attempt::Status(status) => {
                    // Whatever landed before the status was read is garbage.
                    let _ = self.vfs.remove(path);
                    return FetchOutcome::Retryable(FetchError::Protocol { status });
                }
                Attempt::Http(HttpError::Tls(message)) => {
                    return FetchOutcome::Retryable(FetchError::Trust(message));
                }
                Attempt::Http(HttpError::Network(message)) => {
                    attempt += 1;
                    if !self.options.auto_retry || attempt >= self.options.max_attempts {
                        return FetchOutcome::Retryable(FetchError::Network(message));
                    }
                    warn!(url, attempt, "network failure, retrying: {message}");
                    // Settle queued writes so the next resume offset is
                    // what is actually on disk.
                    if let Err(e) = self.queue.flush().await {
                        return FetchOutcome::Fatal(e.into());
                    }
                    if !self.countdown(cancel).await {
                        return FetchOutcome::Cancelled;
                    }
                }
                Attempt::Storage(e) => return FetchOutcome::Fatal(e.into()),
            }
        }
    }

    /// Fetch `url` whole into `buf` (metadata-sized payloads).
    pub async fn fetch_to_buffer(
        &self,
        url: &str,
        kind: PayloadKind,
        buf: &mut Vec<u8>,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return FetchOutcome::Cancelled;
            }
            buf.clear();

            let failed = match self.attempt_buffer(url, buf, attempt, cancel).await {
                Ok(()) => return FetchOutcome::Success,
                Err(failed) => failed,
            };

            match failed {
                Attempt::Cancelled => return FetchOutcome::Cancelled,
                Attempt::Status(404) => {
                    return match kind {
                        PayloadKind::Metadata => FetchOutcome::Fatal(FetchError::NotFound),
                        PayloadKind::Ticket => FetchOutcome::NeedsFallbackTicket,
                        PayloadKind::Content => {
                            FetchOutcome::Retryable(FetchError::Protocol { status: 404 })
                        }
                    };
                }
                Attempt::Status(status) => {
                    return FetchOutcome::Retryable(FetchError::Protocol { status });
                }
                Attempt::Http(HttpError::Tls(message)) => {
                    return FetchOutcome::Retryable(FetchError::Trust(message));
                }
                Attempt::Http(HttpError::Network(message)) => {
                    attempt += 1;
                    if !self.options.auto_retry || attempt >= self.options.max_attempts {
                        return FetchOutcome::Retryable(FetchError::Network(message));
                    }
                    warn!(url, attempt, "network failure, retrying: {message}");
                    if !self.countdown(cancel).await {
                        return FetchOutcome::Cancelled;
                    }
                }
                Attempt::RangeMismatch => {
                    return FetchOutcome::Retryable(FetchError::Network(
                        "unexpected partial response".into(),
                    ));
                }
                Attempt::Storage(e) => return FetchOutcome::Fatal(e.into()),
            }
        }
    }

    async fn attempt_file(
        &self,
        url: &str,
        path: &Path,
        expected: Option<u64>,
        resume_from: Option<u64>,
        fresh: bool,
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<(), Attempt> {
        debug!(url, ?resume_from, attempt, "starting transfer");
        let started = Instant::now();

        let mut response = self
            .client
            .get(url, resume_from, fresh)
            .await
            .map_err(Attempt::Http)?;

        match (resume_from, response.status) {
            (None, 200) => {}
            (Some(offset), 206) => {
                if response.range_start != Some(offset) {
                    return Err(Attempt::RangeMismatch);
                }
            }
            (Some(_), 200) => return Err(Attempt::RangeMismatch),
            (_, status) => return Err(Attempt::Status(status)),
        }

        let offset = resume_from.unwrap_or(0);
        let total = expected.or_else(|| response.content_length.map(|n| n + offset));

        let handle = if offset > 0 {
            self.queue.open_append(path).await
        } else {
            self.queue.open(path, expected.unwrap_or(0)).await
        }
        .map_err(Attempt::Storage)?;

        let mut written = 0u64;
        let streamed = self
            .stream_to_queue(
                &mut response.body,
                handle,
                offset,
                total,
                attempt,
                cancel,
                &mut written,
            )
            .await;
        let closed = self.queue.close(handle).await;
        streamed?;
        closed.map_err(Attempt::Storage)?;

        if written == 0 && offset == 0 && expected.is_none_or(|t| t > 0) {
            return Err(Attempt::Http(HttpError::Network("empty response".into())));
        }
        if let Some(total) = expected {
            let got = offset + written;
            if got != total {
                return Err(Attempt::Http(HttpError::Network(format!(
                    "transfer ended at {got} of {total} bytes"
                ))));
            }
        }

        self.entropy
            .feed(&started.elapsed().as_nanos().to_le_bytes());
        debug!(url, written, "transfer done");
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_to_queue(
        &self,
        body: &mut BodyStream,
        handle: WriteHandle,
        offset: u64,
        total: Option<u64>,
        attempt: u32,
        cancel: &CancelToken,
        written: &mut u64,
    ) -> Result<(), Attempt> {
        let mut estimator = SpeedEstimator::new(offset);

        while let Some(chunk) = body.next().await {
            if cancel.is_cancelled() {
                return Err(Attempt::Cancelled);
            }
            let chunk = chunk.map_err(Attempt::Http)?;
            self.queue
                .write(handle, &chunk)
                .await
                .map_err(Attempt::Storage)?;
            *written += chunk.len() as u64;
            self.entropy.feed(&(chunk.len() as u64).to_le_bytes());

            let bytes_done = offset + *written;
            let rate_bps = estimator.sample(bytes_done);
            self.progress.send_replace(TransferProgress {
                bytes_done,
                total,
                rate_bps,
                eta: eta(rate_bps, total, bytes_done),
                attempt,
            });
        }
        Ok(())
    }

    async fn attempt_buffer(
        &self,
        url: &str,
        buf: &mut Vec<u8>,
        attempt: u32,
        cancel: &CancelToken,
    ) -> Result<(), Attempt> {
        debug!(url, attempt, "fetching into memory");

        let mut response = self
            .client
            .get(url, None, false)
            .await
            .map_err(Attempt::Http)?;
        if response.status != 200 {
            return Err(Attempt::Status(response.status));
        }

        while let Some(chunk) = response.body.next().await {
            if cancel.is_cancelled() {
                return Err(Attempt::Cancelled);
            }
            let chunk = chunk.map_err(Attempt::Http)?;
            buf.extend_from_slice(&chunk);
        }

        if buf.is_empty() {
            return Err(Attempt::Http(HttpError::Network("empty response".into())));
        }
        Ok(())
    }

    /// Wait out the retry countdown. Returns false when cancelled.
    async fn countdown(&self, cancel: &CancelToken) -> bool {
        let mut remaining = self.options.retry_countdown;
        while !remaining.is_zero() {
            if cancel.is_cancelled() {
                return false;
            }
            let step = remaining.min(Duration::from_secs(1));
            tokio::time::sleep(step).await;
            remaining -= step;
        }
        !cancel.is_cancelled()
    }
}
