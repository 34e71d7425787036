//! PDF→TEI structuring client.
//!
//! Thin HTTP client for the structuring service: multipart POST of the PDF
//! with consolidation options, a timeout proportional to the file size,
//! and a busy-wait loop for 503 (the service queues per its own capacity).

use std::time::{Duration, Instant};

use oaharvest_core::{HttpError, Retryable, fetch_bytes, http_client};

use crate::config::Config;

/// Base deadline plus one extra second per 100 KiB of input.
const TIMEOUT_BASE: Duration = Duration::from_secs(60);
const TIMEOUT_BYTES_PER_SEC: u64 = 100 * 1024;

#[derive(Debug)]
pub enum StructuringError {
    Http(HttpError),
    /// The service ran but could not produce a document.
    Failed { status: u16 },
}

impl std::fmt::Display for StructuringError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Http(e) => write!(f, "{e}"),
            Self::Failed { status } => write!(f, "structuring service answered {status}"),
        }
    }
}

impl std::error::Error for StructuringError {}

impl Retryable for StructuringError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Http(e) => e.is_retryable(),
            Self::Failed { .. } => false,
        }
    }
}

/// A produced TEI document.
#[derive(Debug)]
pub struct TeiResult {
    pub tei: Vec<u8>,
    /// The transform ran but flagged warnings (service answered 203).
    pub has_warnings: bool,
}

pub struct StructuringClient {
    base_url: String,
    max_timeout: Duration,
    busy_wait: Duration,
}

impl StructuringClient {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.pdf_structuring_url.trim_end_matches('/').to_string(),
            max_timeout: config.structuring_timeout(),
            busy_wait: Duration::from_secs(config.busy_wait_secs),
        }
    }

    fn timeout_for(&self, pdf_len: usize) -> Duration {
        let extra = Duration::from_secs(pdf_len as u64 / TIMEOUT_BYTES_PER_SEC);
        (TIMEOUT_BASE + extra).min(self.max_timeout)
    }

    /// Full-text structuring of a PDF into TEI.
    pub fn pdf_to_tei(
        &self,
        pdf: &[u8],
        coordinates: bool,
    ) -> Result<TeiResult, StructuringError> {
        let url = format!("{}/processFulltextDocument", self.base_url);
        let timeout = self.timeout_for(pdf.len());

        let response = self.post_until_free(timeout, || {
            let mut form = reqwest::multipart::Form::new()
                .part(
                    "input",
                    reqwest::multipart::Part::bytes(pdf.to_vec())
                        .file_name("input.pdf")
                        .mime_str("application/pdf")
                        .expect("static mime type"),
                )
                .text("generateIDs", "1")
                .text("consolidateHeader", "1")
                .text("consolidateCitations", "0")
                .text("includeRawCitations", "1")
                .text("includeRawAffiliations", "1");
            if coordinates {
                for element in ["ref", "biblStruct", "persName", "figure", "formula", "s"] {
                    form = form.text("teiCoordinates", element);
                }
            }
            http_client()
                .post(&url)
                .header(reqwest::header::ACCEPT, "application/xml")
                .multipart(form)
        })?;

        match response.status {
            200 => Ok(TeiResult {
                tei: response.body,
                has_warnings: false,
            }),
            203 => Ok(TeiResult {
                tei: response.body,
                has_warnings: true,
            }),
            status if status >= 500 => Err(StructuringError::Http(HttpError::Transport {
                status: Some(status),
                message: "structuring service error".into(),
            })),
            status => Err(StructuringError::Failed { status }),
        }
    }

    /// Reference annotations with coordinates, as JSON.
    pub fn reference_annotations(&self, pdf: &[u8]) -> Result<Vec<u8>, StructuringError> {
        let url = format!("{}/referenceAnnotations", self.base_url);
        let timeout = self.timeout_for(pdf.len());

        let response = self.post_until_free(timeout, || {
            let form = reqwest::multipart::Form::new()
                .part(
                    "input",
                    reqwest::multipart::Part::bytes(pdf.to_vec())
                        .file_name("input.pdf")
                        .mime_str("application/pdf")
                        .expect("static mime type"),
                )
                .text("consolidateCitations", "1");
            http_client()
                .post(&url)
                .header(reqwest::header::ACCEPT, "application/json")
                .multipart(form)
        })?;

        match response.status {
            200 | 203 => Ok(response.body),
            status if status >= 500 => Err(StructuringError::Http(HttpError::Transport {
                status: Some(status),
                message: "structuring service error".into(),
            })),
            status => Err(StructuringError::Failed { status }),
        }
    }

    /// POST, sleeping through 503 answers until the overall deadline.
    ///
    /// 503 means the service's own queue is full; it does not consume a
    /// retry attempt.
    fn post_until_free(
        &self,
        timeout: Duration,
        make_request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<oaharvest_core::Fetched, StructuringError> {
        let started = Instant::now();
        loop {
            let fetched =
                fetch_bytes(make_request(), timeout, None).map_err(StructuringError::Http)?;
            if fetched.status != 503 {
                return Ok(fetched);
            }
            if started.elapsed() + self.busy_wait >= timeout {
                return Err(StructuringError::Http(HttpError::Timeout {
                    after: timeout,
                }));
            }
            log::debug!("structuring service busy, waiting {:?}", self.busy_wait);
            std::thread::sleep(self.busy_wait);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> StructuringClient {
        StructuringClient::new(&Config::default())
    }

    #[test]
    fn timeout_scales_with_size() {
        let c = client();
        let small = c.timeout_for(10 * 1024);
        let large = c.timeout_for(20 * 1024 * 1024);
        assert!(small < large);
        assert_eq!(small, Duration::from_secs(60));
        // 20 MiB → 60s + 204s
        assert_eq!(large, Duration::from_secs(264));
    }

    #[test]
    fn timeout_capped_by_config() {
        let c = client();
        let huge = c.timeout_for(10 * 1024 * 1024 * 1024);
        assert_eq!(huge, c.max_timeout);
    }

    #[test]
    fn failed_status_not_retryable() {
        assert!(!StructuringError::Failed { status: 400 }.is_retryable());
    }

    #[test]
    fn transport_errors_keep_http_retryability() {
        let err = StructuringError::Http(HttpError::Transport {
            status: Some(502),
            message: "bad gateway".into(),
        });
        assert!(err.is_retryable());
    }
}
