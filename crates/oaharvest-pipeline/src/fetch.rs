//! PDF and JATS retrieval.
//!
//! Candidate URLs are tried in order, first success wins. A download only
//! counts when the status is 200, the content type is plausible, the size
//! falls inside the configured window and the body starts with the PDF
//! magic. Hosts answering 403/429 are put on cooldown for the rest of the
//! run; a per-host semaphore keeps concurrent downloads per publisher low.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use flate2::read::GzDecoder;
use indicatif::ProgressBar;

use oaharvest_core::{Fetched, HostLimiter, HttpError, Retryable, fetch_bytes, http_client};

use crate::config::Config;
use crate::entry::{CandidateUrl, FailureReason, UrlSource};
use crate::pmc::PmcIndex;

/// Why a download stage failed.
#[derive(Debug)]
pub enum FetchFailure {
    NoUrl,
    AllUrlsFailed,
    /// Transient transport trouble (5xx, connection failure); the whole
    /// candidate walk is worth retrying.
    HttpError(String),
    Timeout,
    InvalidContent(String),
    TooLarge,
    /// Definitive per-URL rejection (4xx, cooldown, dead local file); the
    /// URL will not start working within this run.
    UrlRejected(String),
}

impl FetchFailure {
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::NoUrl => FailureReason::NoUrl,
            Self::AllUrlsFailed | Self::UrlRejected(_) => FailureReason::AllUrlsFailed,
            Self::HttpError(_) => FailureReason::HttpError,
            Self::Timeout => FailureReason::Timeout,
            Self::InvalidContent(_) => FailureReason::InvalidContent,
            Self::TooLarge => FailureReason::TooLarge,
        }
    }

    fn from_http(e: HttpError) -> Self {
        match e {
            HttpError::Timeout { .. } => Self::Timeout,
            HttpError::TooLarge { .. } => Self::TooLarge,
            other => Self::HttpError(other.to_string()),
        }
    }

    fn is_transient(&self) -> bool {
        matches!(self, Self::HttpError(_) | Self::Timeout)
    }
}

impl std::fmt::Display for FetchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoUrl => write!(f, "no candidate URL"),
            Self::AllUrlsFailed => write!(f, "all candidate URLs failed"),
            Self::HttpError(msg) => write!(f, "{msg}"),
            Self::Timeout => write!(f, "download timed out"),
            Self::InvalidContent(msg) => write!(f, "invalid content: {msg}"),
            Self::TooLarge => write!(f, "file exceeds size cap"),
            Self::UrlRejected(msg) => write!(f, "candidate rejected: {msg}"),
        }
    }
}

impl std::error::Error for FetchFailure {}

impl Retryable for FetchFailure {
    fn is_retryable(&self) -> bool {
        self.reason().is_retryable()
    }
}

/// Contents recovered from a PMC OA archive.
#[derive(Debug)]
pub struct JatsBundle {
    pub nxml: Vec<u8>,
    /// The archive usually also carries the article PDF.
    pub pdf: Option<Vec<u8>>,
}

pub struct Fetcher {
    min_bytes: u64,
    max_bytes: u64,
    pdf_timeout: Duration,
    jats_timeout: Duration,
    host_limiter: HostLimiter,
    cooldown: Mutex<HashSet<String>>,
    user_agent: String,
}

impl Fetcher {
    pub fn new(config: &Config) -> Self {
        Self {
            min_bytes: config.min_pdf_bytes,
            max_bytes: config.max_pdf_bytes,
            pdf_timeout: config.pdf_timeout(),
            jats_timeout: config.jats_timeout(),
            host_limiter: HostLimiter::new(config.per_host_limit),
            cooldown: Mutex::new(HashSet::new()),
            user_agent: format!("oaharvest/0.3 (mailto:{})", config.contact_email),
        }
    }

    /// Try the candidates in order; first validated PDF wins.
    pub fn fetch_pdf(
        &self,
        candidates: &[CandidateUrl],
        pb: &ProgressBar,
    ) -> Result<(Vec<u8>, UrlSource), FetchFailure> {
        if candidates.is_empty() {
            return Err(FetchFailure::NoUrl);
        }

        let mut last_transient = None;
        let mut last_definitive = None;
        for candidate in candidates {
            pb.set_message(format!("fetching pdf ({:?})...", candidate.source));
            match self.try_candidate(candidate) {
                Ok(bytes) => return Ok((bytes, candidate.source)),
                Err(failure) => {
                    log::debug!("candidate {} failed: {failure}", candidate.url);
                    if failure.is_transient() {
                        last_transient = Some(failure);
                    } else {
                        last_definitive = Some(failure);
                    }
                }
            }
        }

        Err(overall_failure(
            candidates.len(),
            last_transient,
            last_definitive,
        ))
    }

    fn try_candidate(&self, candidate: &CandidateUrl) -> Result<Vec<u8>, FetchFailure> {
        if let Some(path) = candidate.url.strip_prefix("file://") {
            let bytes = std::fs::read(path)
                .map_err(|e| FetchFailure::UrlRejected(format!("local mirror read failed: {e}")))?;
            validate_pdf(None, &bytes, self.min_bytes, self.max_bytes)?;
            return Ok(bytes);
        }

        if candidate.url.ends_with(".tar.gz") {
            let archive = self.download(&candidate.url, self.pdf_timeout, 2 * self.max_bytes)?;
            let (_, pdf) = extract_archive(&archive.body)
                .map_err(|e| FetchFailure::InvalidContent(format!("bad archive: {e}")))?;
            let bytes =
                pdf.ok_or_else(|| FetchFailure::InvalidContent("archive held no PDF".into()))?;
            validate_pdf(None, &bytes, self.min_bytes, self.max_bytes)?;
            return Ok(bytes);
        }

        let fetched = self.download(&candidate.url, self.pdf_timeout, self.max_bytes)?;
        validate_pdf(
            fetched.content_type.as_deref(),
            &fetched.body,
            self.min_bytes,
            self.max_bytes,
        )?;
        Ok(fetched.body)
    }

    /// Resolve a PMCID through the OA index and pull the `.nxml` (and the
    /// PDF, when present) out of the archive.
    pub fn fetch_jats(
        &self,
        pmcid: &str,
        pmc: &PmcIndex,
        pb: &ProgressBar,
    ) -> Result<JatsBundle, FetchFailure> {
        let Some((url, _license)) = pmc.archive_url(pmcid) else {
            return Err(FetchFailure::NoUrl);
        };

        pb.set_message("fetching jats archive...");
        let fetched = self.download(&url, self.jats_timeout, 2 * self.max_bytes)?;
        let (nxml, pdf) = extract_archive(&fetched.body)
            .map_err(|e| FetchFailure::InvalidContent(format!("bad archive: {e}")))?;
        let nxml =
            nxml.ok_or_else(|| FetchFailure::InvalidContent("archive held no .nxml".into()))?;
        Ok(JatsBundle { nxml, pdf })
    }

    fn download(&self, url: &str, timeout: Duration, cap: u64) -> Result<Fetched, FetchFailure> {
        let host = url_host(url);
        if let Some(host) = &host
            && self.host_on_cooldown(host)
        {
            return Err(FetchFailure::UrlRejected(format!("host {host} on cooldown")));
        }

        let _guard = host.as_deref().map(|h| self.host_limiter.acquire(h));
        let request = http_client()
            .get(url)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .header(
                reqwest::header::ACCEPT,
                "application/pdf, application/xml;q=0.9, */*;q=0.8",
            );
        let fetched =
            fetch_bytes(request, timeout, Some(cap)).map_err(FetchFailure::from_http)?;

        match fetched.status {
            200 => Ok(fetched),
            403 | 429 => {
                if let Some(host) = host {
                    self.mark_cooldown(&host);
                }
                Err(FetchFailure::UrlRejected(format!(
                    "HTTP {} for {url}",
                    fetched.status
                )))
            }
            status if status >= 500 => {
                Err(FetchFailure::HttpError(format!("HTTP {status} for {url}")))
            }
            status => Err(FetchFailure::UrlRejected(format!("HTTP {status} for {url}"))),
        }
    }

    fn host_on_cooldown(&self, host: &str) -> bool {
        self.cooldown.lock().unwrap().contains(host)
    }

    fn mark_cooldown(&self, host: &str) {
        log::debug!("host {host} on cooldown for this run");
        self.cooldown.lock().unwrap().insert(host.to_string());
    }
}

/// Collapse per-candidate failures into the stage outcome.
///
/// Any transient failure makes the whole walk retryable. Otherwise the
/// result is definitive: a lone candidate keeps its content-specific
/// reason, anything else is the blanket `all_urls_failed`.
fn overall_failure(
    candidate_count: usize,
    transient: Option<FetchFailure>,
    definitive: Option<FetchFailure>,
) -> FetchFailure {
    if let Some(failure) = transient {
        return failure;
    }
    match definitive {
        Some(failure @ (FetchFailure::InvalidContent(_) | FetchFailure::TooLarge))
            if candidate_count == 1 =>
        {
            failure
        }
        _ => FetchFailure::AllUrlsFailed,
    }
}

fn url_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}

/// Accept only something that can plausibly be the article PDF.
pub fn validate_pdf(
    content_type: Option<&str>,
    body: &[u8],
    min_bytes: u64,
    max_bytes: u64,
) -> Result<(), FetchFailure> {
    if body.len() as u64 > max_bytes {
        return Err(FetchFailure::TooLarge);
    }
    if (body.len() as u64) < min_bytes {
        return Err(FetchFailure::InvalidContent(format!(
            "{} bytes is below the minimum of {min_bytes}",
            body.len()
        )));
    }
    if let Some(ct) = content_type {
        let ct = ct.to_ascii_lowercase();
        if !ct.contains("pdf") && !ct.contains("octet-stream") {
            return Err(FetchFailure::InvalidContent(format!(
                "unexpected content type {ct}"
            )));
        }
    }
    if !body.starts_with(b"%PDF-") {
        return Err(FetchFailure::InvalidContent(
            "missing %PDF- header".into(),
        ));
    }
    Ok(())
}

/// Pull the first `.nxml` and `.pdf` members out of a PMC `.tar.gz`.
pub fn extract_archive(bytes: &[u8]) -> std::io::Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
    use std::io::Read;

    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut nxml: Option<Vec<u8>> = None;
    let mut pdf: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        let lower = name.to_ascii_lowercase();
        if nxml.is_none() && lower.ends_with(".nxml") {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            nxml = Some(buf);
        } else if pdf.is_none() && lower.ends_with(".pdf") {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            pdf = Some(buf);
        }
        if nxml.is_some() && pdf.is_some() {
            break;
        }
    }
    Ok((nxml, pdf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn pdf_body(len: usize) -> Vec<u8> {
        let mut body = b"%PDF-1.5\n".to_vec();
        body.resize(len, b'x');
        body
    }

    #[test]
    fn validate_accepts_pdf() {
        validate_pdf(Some("application/pdf"), &pdf_body(2048), 512, 10_000).unwrap();
    }

    #[test]
    fn validate_accepts_octet_stream_with_magic() {
        validate_pdf(
            Some("application/octet-stream"),
            &pdf_body(2048),
            512,
            10_000,
        )
        .unwrap();
    }

    #[test]
    fn validate_rejects_html() {
        let err = validate_pdf(Some("text/html"), &pdf_body(2048), 512, 10_000).unwrap_err();
        assert_eq!(err.reason(), FailureReason::InvalidContent);
    }

    #[test]
    fn validate_rejects_missing_magic() {
        let mut body = vec![b'x'; 2048];
        body[0] = b'<';
        let err = validate_pdf(Some("application/pdf"), &body, 512, 10_000).unwrap_err();
        assert_eq!(err.reason(), FailureReason::InvalidContent);
    }

    #[test]
    fn validate_rejects_undersized() {
        let err = validate_pdf(None, &pdf_body(100), 512, 10_000).unwrap_err();
        assert_eq!(err.reason(), FailureReason::InvalidContent);
    }

    #[test]
    fn validate_rejects_oversized() {
        let err = validate_pdf(None, &pdf_body(20_000), 512, 10_000).unwrap_err();
        assert_eq!(err.reason(), FailureReason::TooLarge);
    }

    fn build_archive(members: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for (name, data) in members {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn extract_archive_finds_members() {
        let archive = build_archive(&[
            ("PMC7266364/article.nxml", b"<article/>".as_slice()),
            ("PMC7266364/main.pdf", b"%PDF-1.4".as_slice()),
        ]);
        let (nxml, pdf) = extract_archive(&archive).unwrap();
        assert_eq!(nxml.unwrap(), b"<article/>".to_vec());
        assert_eq!(pdf.unwrap(), b"%PDF-1.4".to_vec());
    }

    #[test]
    fn extract_archive_without_pdf() {
        let archive = build_archive(&[("a/article.nxml", b"<article/>".as_slice())]);
        let (nxml, pdf) = extract_archive(&archive).unwrap();
        assert!(nxml.is_some());
        assert!(pdf.is_none());
    }

    #[test]
    fn extract_garbage_errors() {
        assert!(extract_archive(b"not a tarball").is_err());
    }

    fn test_fetcher() -> Fetcher {
        let config = Config {
            min_pdf_bytes: 8,
            max_pdf_bytes: 10_000,
            ..Default::default()
        };
        Fetcher::new(&config)
    }

    #[test]
    fn empty_candidates_is_no_url() {
        let fetcher = test_fetcher();
        let err = fetcher.fetch_pdf(&[], &ProgressBar::hidden()).unwrap_err();
        assert_eq!(err.reason(), FailureReason::NoUrl);
    }

    #[test]
    fn file_candidate_served_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pdf");
        std::fs::write(&path, pdf_body(2048)).unwrap();

        let fetcher = test_fetcher();
        let candidate = CandidateUrl {
            url: format!("file://{}", path.display()),
            source: UrlSource::LocalMirror,
            priority: 0,
        };
        let (bytes, source) = fetcher
            .fetch_pdf(std::slice::from_ref(&candidate), &ProgressBar::hidden())
            .unwrap();
        assert!(bytes.starts_with(b"%PDF-"));
        assert_eq!(source, UrlSource::LocalMirror);
    }

    #[test]
    fn single_candidate_keeps_specific_reason() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.pdf");
        std::fs::write(&path, b"<html>not a pdf</html>abcdefgh").unwrap();

        let fetcher = test_fetcher();
        let candidate = CandidateUrl {
            url: format!("file://{}", path.display()),
            source: UrlSource::LocalMirror,
            priority: 0,
        };
        let err = fetcher
            .fetch_pdf(std::slice::from_ref(&candidate), &ProgressBar::hidden())
            .unwrap_err();
        assert_eq!(err.reason(), FailureReason::InvalidContent);
    }

    #[test]
    fn overall_failure_prefers_transient() {
        let failure = overall_failure(
            3,
            Some(FetchFailure::Timeout),
            Some(FetchFailure::UrlRejected("HTTP 403".into())),
        );
        assert_eq!(failure.reason(), FailureReason::Timeout);
    }

    #[test]
    fn overall_failure_single_rejected_url_is_all_urls_failed() {
        // a lone candidate answering 403 ends the stage terminally
        let failure = overall_failure(
            1,
            None,
            Some(FetchFailure::UrlRejected("HTTP 403".into())),
        );
        assert_eq!(failure.reason(), FailureReason::AllUrlsFailed);
    }

    #[test]
    fn overall_failure_single_candidate_keeps_content_reason() {
        let failure = overall_failure(
            1,
            None,
            Some(FetchFailure::InvalidContent("text/html".into())),
        );
        assert_eq!(failure.reason(), FailureReason::InvalidContent);

        let failure = overall_failure(1, None, Some(FetchFailure::TooLarge));
        assert_eq!(failure.reason(), FailureReason::TooLarge);
    }

    #[test]
    fn overall_failure_multiple_candidates_blanket() {
        let failure = overall_failure(
            2,
            None,
            Some(FetchFailure::InvalidContent("text/html".into())),
        );
        assert_eq!(failure.reason(), FailureReason::AllUrlsFailed);
    }

    #[test]
    fn cooldown_marks_host() {
        let fetcher = test_fetcher();
        assert!(!fetcher.host_on_cooldown("pub.example.org"));
        fetcher.mark_cooldown("pub.example.org");
        assert!(fetcher.host_on_cooldown("pub.example.org"));
        assert!(!fetcher.host_on_cooldown("other.example.org"));
    }

    #[test]
    fn url_host_parsing() {
        assert_eq!(
            url_host("https://pub.example.org/a/b.pdf").as_deref(),
            Some("pub.example.org")
        );
        assert_eq!(url_host("not a url"), None);
    }
}
