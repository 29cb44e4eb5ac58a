//! HTTP client abstraction.
//!
//! The trait is the minimal surface the transfer engine needs: one GET
//! with an optional resume offset and a fresh-connection flag.
//! Implementations handle their own redirects, timeouts and error
//! mapping. [`ReqwestClient`] is the production implementation; tests
//! supply mocks.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::error::HttpError;

/// A boxed stream type for HTTP response bodies.
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = T> + Send + 'a>>;

/// The body of an open response.
pub type BodyStream = BoxStream<'static, Result<Bytes, HttpError>>;

/// One open HTTP response, headers parsed, body not yet consumed.
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,

    /// Declared `Content-Length`, if any. For a 206 this is the length
    /// of the partial body, not of the whole resource.
    pub content_length: Option<u64>,

    /// Start offset parsed from `Content-Range`, present on a 206.
    pub range_start: Option<u64>,

    /// The response body.
    pub body: BodyStream,
}

/// Asynchronous HTTP client abstraction.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Open a streaming GET.
    ///
    /// `resume_from` adds a `bytes={offset}-` range header. `fresh`
    /// asks the implementation to drop any reused connection first;
    /// the engine sets it when a server mishandled a range request.
    async fn get(
        &self,
        url: &str,
        resume_from: Option<u64>,
        fresh: bool,
    ) -> Result<HttpResponse, HttpError>;
}

#[cfg(feature = "reqwest")]
mod reqwest_impl {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::StreamExt;

    use super::{HttpClient, HttpResponse};
    use crate::error::HttpError;

    const USER_AGENT: &str = concat!("nusgrab/", env!("CARGO_PKG_VERSION"));

    /// The CDN stalls rather than closing dead connections; a read that
    /// makes no progress for this long counts as a network failure.
    const READ_TIMEOUT: Duration = Duration::from_secs(60);

    /// Production HTTP client over `reqwest`.
    ///
    /// Optionally pins trust to a caller-supplied PEM bundle instead of
    /// the OS store, since the CDN's chain is not in every console-side
    /// trust database. Connection reuse is dropped on demand by
    /// rebuilding the inner client.
    pub struct ReqwestClient {
        client: Mutex<reqwest::Client>,
        roots: Option<Vec<reqwest::Certificate>>,
    }

    impl ReqwestClient {
        /// Client trusting the platform root store.
        pub fn new() -> Result<Self, HttpError> {
            let client = build(&None)?;
            Ok(Self {
                client: Mutex::new(client),
                roots: None,
            })
        }

        /// Client trusting only the certificates in `pem`.
        pub fn with_ca_pem(pem: &[u8]) -> Result<Self, HttpError> {
            let roots = reqwest::Certificate::from_pem_bundle(pem)
                .map_err(|e| HttpError::Tls(e.to_string()))?;
            let roots = Some(roots);
            let client = build(&roots)?;
            Ok(Self {
                client: Mutex::new(client),
                roots,
            })
        }

        fn current(&self, fresh: bool) -> Result<reqwest::Client, HttpError> {
            let mut guard = match self.client.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if fresh {
                *guard = build(&self.roots)?;
            }
            Ok(guard.clone())
        }
    }

    fn build(roots: &Option<Vec<reqwest::Certificate>>) -> Result<reqwest::Client, HttpError> {
        let mut builder = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .read_timeout(READ_TIMEOUT)
            .use_native_tls();
        if let Some(roots) = roots {
            builder = builder.tls_built_in_root_certs(false);
            for root in roots {
                builder = builder.add_root_certificate(root.clone());
            }
        }
        builder.build().map_err(map_err)
    }

    fn map_err(e: reqwest::Error) -> HttpError {
        let text = e.to_string();
        let lowered = text.to_ascii_lowercase();
        if lowered.contains("certificate") || lowered.contains("tls") || lowered.contains("ssl") {
            HttpError::Tls(text)
        } else {
            HttpError::Network(text)
        }
    }

    // "bytes 4-9/10" -> 4
    fn range_start(header: &str) -> Option<u64> {
        header
            .strip_prefix("bytes ")?
            .split('-')
            .next()?
            .parse()
            .ok()
    }

    #[async_trait]
    impl HttpClient for ReqwestClient {
        async fn get(
            &self,
            url: &str,
            resume_from: Option<u64>,
            fresh: bool,
        ) -> Result<HttpResponse, HttpError> {
            let client = self.current(fresh)?;
            let mut request = client.get(url);
            if let Some(offset) = resume_from {
                request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
            }

            let response = request.send().await.map_err(map_err)?;
            let status = response.status().as_u16();
            let content_length = response
                .headers()
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            let range_start = response
                .headers()
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(range_start);
            let body = Box::pin(response.bytes_stream().map(|item| item.map_err(map_err)));

            Ok(HttpResponse {
                status,
                content_length,
                range_start,
                body,
            })
        }
    }

}

#[cfg(feature = "reqwest")]
pub use reqwest_impl::ReqwestClient;
