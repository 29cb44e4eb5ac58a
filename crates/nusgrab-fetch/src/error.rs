//! Error classification for CDN transfers.
//!
//! The classes map directly onto how callers react: network failures get
//! auto-retried, trust failures wait for explicit confirmation, protocol
//! failures are shown with their status, integrity and storage failures
//! end the operation.

use nusgrab_io::WriteQueueError;
use nusgrab_tmd::TmdError;
use thiserror::Error;

/// Transport-level failure reported by an [`HttpClient`] impl.
///
/// [`HttpClient`]: crate::HttpClient
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("network failure: {0}")]
    Network(String),

    #[error("TLS failure: {0}")]
    Tls(String),
}

#[derive(Debug, Error)]
pub enum FetchError {
    /// DNS, connect, timeout, empty response or a broken body stream.
    /// Transient by assumption.
    #[error("network failure: {0}")]
    Network(String),

    /// Certificate or TLS-level rejection. Retryable, but never retried
    /// without the user saying so.
    #[error("server trust failure: {0}")]
    Trust(String),

    /// The server answered with something other than 200/206.
    #[error("server answered HTTP {status}")]
    Protocol { status: u16 },

    /// 404 on a title-metadata request: the title is not on the CDN.
    #[error("title is not published on the CDN")]
    NotFound,

    /// The downloaded metadata failed structural verification.
    #[error("title metadata rejected: {0}")]
    Integrity(#[from] TmdError),

    /// The write queue reported a fault. Session-fatal.
    #[error(transparent)]
    Storage(#[from] WriteQueueError),
}
