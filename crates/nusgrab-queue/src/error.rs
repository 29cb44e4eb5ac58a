use nusgrab_fetch::FetchError;
use nusgrab_io::Device;
use thiserror::Error;

/// Why an entry was refused at enqueue time. The queue is unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EnqueueError {
    #[error("title is already queued for install to {device}")]
    DuplicateInstall { device: Device },

    #[error("title is already queued for download to {device}")]
    DuplicateDownload { device: Device },
}

/// Why a batch stopped. Completed entries stay consumed; the failed and
/// unstarted ones remain queued.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Admission failed before any transfer started.
    #[error("not enough free space on {device}: {required} bytes required, {available} available")]
    InsufficientSpace {
        device: Device,
        required: u64,
        available: u64,
    },

    #[error("transfer failed: {0}")]
    Transfer(FetchError),

    #[error("installer returned code {code:#x}")]
    InstallFailed { code: i32 },

    #[error("batch cancelled")]
    Cancelled,
}
