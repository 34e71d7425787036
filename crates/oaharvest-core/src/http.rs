//! Shared HTTP client with a sync facade over async reqwest.
//!
//! Workers are plain threads; every call goes through the shared tokio
//! runtime with a per-call deadline via tokio::time::timeout, so a stalled
//! upstream can never pin a worker forever.

use std::sync::LazyLock;
use std::time::Duration;

use crate::error::HttpError;

/// Connect timeout applied to every request
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum redirect hops before a download is abandoned
const MAX_REDIRECTS: usize = 5;

/// Shared tokio runtime backing all HTTP and S3 operations.
pub static SHARED_RUNTIME: LazyLock<tokio::runtime::Runtime> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("failed to build tokio runtime")
});

/// Shared async HTTP client with connection pooling and bounded redirects.
static SHARED_CLIENT: LazyLock<reqwest::Client> = LazyLock::new(|| {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
        .pool_max_idle_per_host(8)
        .build()
        .expect("failed to build HTTP client")
});

/// Get the shared HTTP client.
pub fn http_client() -> &'static reqwest::Client {
    &SHARED_CLIENT
}

/// A fully-read HTTP response.
///
/// Status is NOT pre-checked; callers decide what a non-200 means for their
/// stage (e.g. 403 puts a download host on cooldown, 404 is terminal for a
/// metadata lookup).
#[derive(Debug)]
pub struct Fetched {
    pub status: u16,
    pub content_type: Option<String>,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl Fetched {
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    pub fn body_utf8(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Execute a prepared request synchronously, reading the whole body.
///
/// The body is streamed chunk by chunk so an oversized response is aborted
/// as soon as `max_bytes` is crossed, without buffering the rest.
pub fn fetch_bytes(
    request: reqwest::RequestBuilder,
    deadline: Duration,
    max_bytes: Option<u64>,
) -> Result<Fetched, HttpError> {
    SHARED_RUNTIME.handle().block_on(async {
        let fut = async {
            let mut response = request.send().await.map_err(|e| HttpError::from_reqwest(&e))?;

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());
            let final_url = response.url().to_string();

            let mut body: Vec<u8> = Vec::new();
            while let Some(chunk) = response
                .chunk()
                .await
                .map_err(|e| HttpError::from_reqwest(&e))?
            {
                if let Some(limit) = max_bytes
                    && (body.len() + chunk.len()) as u64 > limit
                {
                    return Err(HttpError::TooLarge { limit });
                }
                body.extend_from_slice(&chunk);
            }

            Ok(Fetched {
                status,
                content_type,
                final_url,
                body,
            })
        };

        match tokio::time::timeout(deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(HttpError::Timeout { after: deadline }),
        }
    })
}
