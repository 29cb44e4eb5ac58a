//! Whole-title orchestration: metadata, ticket, certificate and every
//! content file of one title, laid out the way an installer expects.

use std::path::{Path, PathBuf};

use nusgrab_io::WriteQueueError;
use nusgrab_tmd::{TitleMetadata, h3_size};
use tracing::{debug, warn};

use crate::cancel::CancelToken;
use crate::engine::{FetchOutcome, PayloadKind, TransferEngine};
use crate::http::HttpClient;
use crate::progress::TitleProgress;

/// Produces the license ticket and certificate chain when the CDN does
/// not serve one. The surrounding application owns the key material.
pub trait TicketForge: Send + Sync {
    /// A ticket good enough for the installer to accept the title.
    fn ticket(&self, title_id: u64, title_version: u16) -> Vec<u8>;

    /// The certificate chain written as `title.cert`.
    fn certificate_chain(&self) -> Vec<u8>;
}

/// One title to download.
pub struct TitleRequest<'a> {
    pub metadata: &'a TitleMetadata,

    /// Display name used to derive the folder, when no override is set.
    pub display_name: Option<&'a str>,

    /// Folder name override, used verbatim.
    pub folder: Option<&'a str>,

    /// Device root the title folder goes under.
    pub root: &'a Path,
}

impl TitleRequest<'_> {
    /// The directory everything for this title lands in.
    pub fn directory(&self) -> PathBuf {
        let name = match self.folder {
            Some(folder) => folder.to_string(),
            None => folder_name(
                self.display_name,
                self.metadata.title_id(),
                self.metadata.title_version(),
            ),
        };
        self.root.join(name)
    }
}

/// Derive a folder name: sanitised display name, the title id in
/// brackets, and the version when it is not the initial one.
pub fn folder_name(display_name: Option<&str>, title_id: u64, version: u16) -> String {
    let mut name = match display_name.map(sanitize) {
        Some(clean) if !clean.is_empty() => format!("{clean} [{title_id:016x}]"),
        _ => format!("{title_id:016x}"),
    };
    if version > 0 {
        name.push_str(&format!(" [v{version}]"));
    }
    name
}

// Keeps only characters every target filesystem accepts.
fn sanitize(name: &str) -> String {
    let mut clean = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            c if c.is_alphanumeric() => clean.push(c),
            ' ' | '-' | '_' | '.' | '(' | ')' => clean.push(c),
            _ => clean.push('_'),
        }
    }
    clean.trim().trim_end_matches('.').to_string()
}

impl<C: HttpClient> TransferEngine<C> {
    /// Fetch and parse the metadata for `title_id`.
    ///
    /// `version` picks a specific release; `None` means the latest.
    pub async fn fetch_title_metadata(
        &self,
        title_id: u64,
        version: Option<u16>,
        cancel: &CancelToken,
    ) -> Result<TitleMetadata, FetchOutcome> {
        let base = self.title_base(title_id);
        let url = match version {
            Some(v) => format!("{base}/tmd.{v}"),
            None => format!("{base}/tmd"),
        };

        let mut buf = Vec::new();
        match self
            .fetch_to_buffer(&url, PayloadKind::Metadata, &mut buf, cancel)
            .await
        {
            FetchOutcome::Success => {
                TitleMetadata::parse(buf).map_err(|e| FetchOutcome::Fatal(e.into()))
            }
            other => Err(other),
        }
    }

    /// Download one complete title into `request.directory()`.
    ///
    /// Writes `title.tmd` from the parsed metadata, `title.tik` from the
    /// CDN (or the forge when the CDN has none), `title.cert` from the
    /// forge, then every content file and the hash-tree sidecars of
    /// hashed contents. Files already at their expected size are
    /// skipped, so an interrupted title can be requested again.
    pub async fn download_title(
        &self,
        request: &TitleRequest<'_>,
        forge: &dyn TicketForge,
        cancel: &CancelToken,
    ) -> FetchOutcome {
        let meta = request.metadata;
        let title_id = meta.title_id();
        let base = self.title_base(title_id);
        let dir = request.directory();

        debug!(title_id = %meta.title_id_hex(), dir = %dir.display(), "downloading title");
        if let Err(e) = self.vfs().create_dir_all(&dir) {
            return FetchOutcome::Fatal(WriteQueueError::Open(e).into());
        }

        let items = meta.contents().len();
        let bytes_total = meta.download_size();
        let mut snapshot = TitleProgress {
            item: 0,
            items,
            bytes_done: 0,
            bytes_total,
        };
        self.send_title_progress(snapshot.clone());

        if let Err(e) = self.write_whole(&dir.join("title.tmd"), meta.raw()).await {
            return FetchOutcome::Fatal(e.into());
        }

        let ticket_path = dir.join("title.tik");
        if !self.exists(&ticket_path) {
            let mut ticket = Vec::new();
            match self
                .fetch_to_buffer(&format!("{base}/cetk"), PayloadKind::Ticket, &mut ticket, cancel)
                .await
            {
                FetchOutcome::Success => {}
                FetchOutcome::NeedsFallbackTicket => {
                    warn!(title_id = %meta.title_id_hex(), "no ticket on the CDN, forging one");
                    ticket = forge.ticket(title_id, meta.title_version());
                }
                other => return other,
            }
            if let Err(e) = self.write_whole(&ticket_path, &ticket).await {
                return FetchOutcome::Fatal(e.into());
            }
        }

        let cert_path = dir.join("title.cert");
        if !self.exists(&cert_path) {
            if let Err(e) = self
                .write_whole(&cert_path, &forge.certificate_chain())
                .await
            {
                return FetchOutcome::Fatal(e.into());
            }
        }

        for (i, content) in meta.contents().iter().enumerate() {
            snapshot.item = i + 1;
            self.send_title_progress(snapshot.clone());

            let url = format!("{base}/{:08x}", content.id);
            let path = dir.join(format!("{:08x}.app", content.id));
            match self
                .fetch_to_file(&url, PayloadKind::Content, &path, Some(content.size), cancel)
                .await
            {
                FetchOutcome::Success => {}
                other => return other,
            }
            snapshot.bytes_done += content.size;

            if content.is_hashed() {
                let url = format!("{base}/{:08x}.h3", content.id);
                let path = dir.join(format!("{:08x}.h3", content.id));
                let expected = h3_size(content.size);
                match self
                    .fetch_to_file(&url, PayloadKind::Content, &path, Some(expected), cancel)
                    .await
                {
                    FetchOutcome::Success => {}
                    other => return other,
                }
                snapshot.bytes_done += expected;
            }

            self.send_title_progress(snapshot.clone());
        }

        FetchOutcome::Success
    }

    fn title_base(&self, title_id: u64) -> String {
        format!("{}/{title_id:016x}", self.options().base_url)
    }

    fn exists(&self, path: &Path) -> bool {
        matches!(self.vfs().size(path), Ok(Some(_)))
    }

    async fn write_whole(&self, path: &Path, bytes: &[u8]) -> Result<(), WriteQueueError> {
        let handle = self.queue().open(path, bytes.len() as u64).await?;
        self.queue().write(handle, bytes).await?;
        self.queue().close(handle).await
    }
}
