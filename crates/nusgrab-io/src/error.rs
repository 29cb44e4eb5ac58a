use thiserror::Error;

/// The first storage failure the worker hit, kept verbatim.
///
/// Cloneable because the same fault is handed to every caller that asks
/// after it happened.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{op}: {message}")]
pub struct StorageFault {
    pub op: &'static str,
    pub message: String,
}

impl StorageFault {
    pub(crate) fn new(op: &'static str, err: &std::io::Error) -> Self {
        Self {
            op,
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum WriteQueueError {
    /// A buffered write or close failed. Unrecoverable for this session:
    /// the owning application is expected to notify the user and exit.
    #[error("unrecoverable storage fault: {0}")]
    Storage(StorageFault),

    /// The worker is gone and no fault was recorded (normal shutdown).
    #[error("write queue is shut down")]
    Shutdown,

    #[error("failed to open destination: {0}")]
    Open(#[source] std::io::Error),

    #[error("failed to start I/O worker: {0}")]
    Spawn(#[source] std::io::Error),
}
