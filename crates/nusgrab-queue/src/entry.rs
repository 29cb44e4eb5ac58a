//! Queue entries and their persistable form.

use nusgrab_io::Device;
use nusgrab_tmd::{TitleMetadata, TmdError};
use serde::{Deserialize, Serialize};

/// Entry downloads its title to the download device.
pub const OP_DOWNLOAD: u8 = 0x01;

/// Entry installs its title after any download.
pub const OP_INSTALL: u8 = 0x02;

/// One queued batch job. Owns its parsed metadata exclusively.
#[derive(Debug)]
pub struct QueueEntry {
    pub metadata: TitleMetadata,

    /// Display name used to derive the title folder.
    pub display_name: Option<String>,

    /// Bitmask of `OP_DOWNLOAD` and `OP_INSTALL`.
    pub ops: u8,

    /// Where downloaded files go.
    pub download_device: Device,

    /// Install target: USB when set, internal storage otherwise.
    pub install_to_usb: bool,

    /// Keep downloaded files after a successful install.
    pub keep_files: bool,

    /// Folder name override, used verbatim instead of the derived name.
    pub folder: Option<String>,
}

impl QueueEntry {
    pub fn downloads(&self) -> bool {
        self.ops & OP_DOWNLOAD != 0
    }

    pub fn installs(&self) -> bool {
        self.ops & OP_INSTALL != 0
    }

    pub fn install_device(&self) -> Device {
        if self.install_to_usb {
            Device::Usb
        } else {
            Device::Mlc
        }
    }

    /// Persistable form, metadata flattened back to its raw bytes.
    pub fn to_record(&self) -> QueueRecord {
        QueueRecord {
            tmd: self.metadata.raw().to_vec(),
            display_name: self.display_name.clone(),
            ops: self.ops,
            download_device: self.download_device,
            install_to_usb: self.install_to_usb,
            keep_files: self.keep_files,
            folder: self.folder.clone(),
        }
    }

    /// Rebuild an entry from a persisted record, re-verifying the TMD.
    pub fn from_record(record: QueueRecord) -> Result<Self, TmdError> {
        Ok(Self {
            metadata: TitleMetadata::parse(record.tmd)?,
            display_name: record.display_name,
            ops: record.ops,
            download_device: record.download_device,
            install_to_usb: record.install_to_usb,
            keep_files: record.keep_files,
            folder: record.folder,
        })
    }
}

/// Serde-friendly snapshot of a [`QueueEntry`], for embedders that
/// persist their queue across sessions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    pub tmd: Vec<u8>,
    pub display_name: Option<String>,
    pub ops: u8,
    pub download_device: Device,
    pub install_to_usb: bool,
    pub keep_files: bool,
    pub folder: Option<String>,
}
