//! oaharvest core - shared infrastructure for the article harvesting pipeline
//!
//! This crate provides the reusable plumbing: HTTP client bridging, retry,
//! rate limiting, concurrency primitives, shutdown handling, progress and
//! logging. The domain logic lives in `oaharvest-pipeline`.

pub mod error;
pub mod http;
pub mod logging;
pub mod progress;
pub mod ratelimit;
pub mod retry;
pub mod semaphore;
pub mod shutdown;

// Re-exports for convenience
pub use error::HttpError;
pub use http::{Fetched, SHARED_RUNTIME, fetch_bytes, http_client};
pub use logging::{HarvestLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use ratelimit::TokenBucket;
pub use retry::{Retryable, backoff_duration, retry_with_backoff};
pub use semaphore::{HostLimiter, Semaphore};
pub use shutdown::{
    install_signal_handlers, is_shutdown_requested, request_shutdown, shutdown_flag,
};
