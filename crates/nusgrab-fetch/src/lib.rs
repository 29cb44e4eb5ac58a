//! Resumable CDN transfers.
//!
//! [`TransferEngine`] streams payloads from the content CDN into the
//! write queue (or into memory for metadata-sized payloads) and reports
//! one of five outcomes: success, fallback-ticket-needed, cancelled,
//! retryable or fatal. Interrupted transfers resume with a byte range;
//! servers that mishandle the range get exactly one restart from zero
//! over a fresh connection. Network-class failures retry automatically
//! after a countdown, trust failures never do.
//!
//! The HTTP side sits behind the [`HttpClient`] trait; `ReqwestClient`
//! is the production implementation behind the `reqwest` feature.

mod cancel;
mod engine;
mod error;
mod http;
mod progress;
mod title;

pub use cancel::CancelToken;
pub use engine::{FetchOutcome, PayloadKind, TransferEngine, TransferOptions};
pub use error::{FetchError, HttpError};
#[cfg(feature = "reqwest")]
pub use http::ReqwestClient;
pub use http::{BodyStream, BoxStream, HttpClient, HttpResponse};
pub use progress::{TitleProgress, TransferProgress};
pub use title::{TicketForge, TitleRequest, folder_name};
