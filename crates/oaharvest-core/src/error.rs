//! Transport-level error type shared by all HTTP-facing components

use std::time::Duration;

/// Error from a single HTTP exchange (metadata lookup, download, structuring
/// call). Carries enough to decide between retry and permanent failure.
#[derive(Debug)]
pub enum HttpError {
    /// Transport or protocol failure, with the status code when one was
    /// received before the connection died.
    Transport {
        status: Option<u16>,
        message: String,
    },
    /// The per-call deadline elapsed.
    Timeout { after: Duration },
    /// The response body exceeded the configured size cap.
    TooLarge { limit: u64 },
    /// Local I/O failure while persisting the body.
    Io(std::io::Error),
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport {
                status: Some(s),
                message,
            } => write!(f, "HTTP {s}: {message}"),
            Self::Transport {
                status: None,
                message,
            } => write!(f, "HTTP error: {message}"),
            Self::Timeout { after } => write!(f, "timeout after {}s", after.as_secs()),
            Self::TooLarge { limit } => write!(f, "response larger than {limit} bytes"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for HttpError {}

impl HttpError {
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        Self::Transport {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
        }
    }

    /// Whether the failure is worth another attempt.
    ///
    /// 5xx, 429 and connection-level failures are transient; other 4xx
    /// responses and oversized bodies are not. Disk-full is the one I/O
    /// condition that no retry will fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { status, .. } => match status {
                Some(429) | None => true,
                Some(s) => *s >= 500,
            },
            Self::Timeout { .. } => true,
            Self::TooLarge { .. } => false,
            Self::Io(e) => e.kind() != std::io::ErrorKind::StorageFull,
        }
    }
}

impl From<std::io::Error> for HttpError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl crate::retry::Retryable for HttpError {
    fn is_retryable(&self) -> bool {
        HttpError::is_retryable(self)
    }
}
