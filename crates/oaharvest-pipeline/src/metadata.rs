//! Metadata enrichment: aggregator → DOI registry → OA locator.
//!
//! The first source that answers provides the canonical record; later
//! sources and the input row only fill gaps. The same pass assembles the
//! ordered candidate-URL list for the download stage.

use std::path::PathBuf;
use std::time::Duration;

use indicatif::ProgressBar;
use serde_json::Value;

use oaharvest_core::{
    HttpError, Retryable, TokenBucket, fetch_bytes, http_client, retry_with_backoff,
};

use crate::config::Config;
use crate::entry::{CandidateUrl, Identifiers, Metadata, UrlSource};
use crate::mirrors::PublisherMirror;
use crate::pmc::PmcIndex;

/// PMC web front-end; locator URLs under it resolve to a PDF with `/pdf/`.
const PMC_WEB_BASE: &str = "https://www.ncbi.nlm.nih.gov/pmc/articles";

/// Enrichment failure.
#[derive(Debug)]
pub enum EnrichError {
    /// No source answered and the identifier set is empty beyond a
    /// free-text title.
    Unresolved,
    Http(HttpError),
}

impl std::fmt::Display for EnrichError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unresolved => write!(f, "no identifier yielded a metadata record"),
            Self::Http(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for EnrichError {}

impl Retryable for EnrichError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Unresolved => false,
            Self::Http(e) => e.is_retryable(),
        }
    }
}

/// Result of a successful enrichment.
#[derive(Debug, Default, PartialEq)]
pub struct Enriched {
    /// Input identifiers unioned with anything the sources contributed.
    pub identifiers: Identifiers,
    pub metadata: Metadata,
    pub candidates: Vec<CandidateUrl>,
}

pub struct MetadataClient {
    aggregator_url: Option<String>,
    doi_registry_url: String,
    oa_locator_url: String,
    contact_email: String,
    timeout: Duration,
    retries: u32,
    max_backoff: Duration,
    aggregator_limiter: TokenBucket,
    registry_limiter: TokenBucket,
    locator_limiter: TokenBucket,
}

impl MetadataClient {
    pub fn new(config: &Config) -> Self {
        Self {
            aggregator_url: config
                .bibliographic_aggregator_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string()),
            doi_registry_url: config.doi_registry_url.trim_end_matches('/').to_string(),
            oa_locator_url: config.oa_locator_url.clone(),
            contact_email: config.contact_email.clone(),
            timeout: config.metadata_timeout(),
            retries: config.per_stage_retries,
            max_backoff: config.max_backoff(),
            aggregator_limiter: TokenBucket::new(config.aggregator_rps, 5),
            registry_limiter: TokenBucket::new(config.registry_rps, 5),
            locator_limiter: TokenBucket::new(config.locator_rps, 5),
        }
    }

    fn user_agent(&self) -> String {
        format!("oaharvest/0.3 (mailto:{})", self.contact_email)
    }

    /// Consolidate metadata and candidate URLs for one entry.
    pub fn enrich(
        &self,
        identifiers: &Identifiers,
        seed: &Metadata,
        pmc: &PmcIndex,
        mirror: Option<&PublisherMirror>,
        pb: &ProgressBar,
    ) -> Result<Enriched, EnrichError> {
        let mut ids = identifiers.clone();
        let mut hard_failure: Option<HttpError> = None;

        pb.set_message("metadata lookup...");
        let aggregator = match self.lookup_aggregator(&ids, pb) {
            Ok(v) => v,
            Err(e) => {
                hard_failure.get_or_insert(e);
                None
            }
        };
        if let Some(record) = &aggregator {
            absorb_identifiers(&mut ids, record);
        }

        let registry = match &ids.doi {
            Some(doi) => match self.lookup_registry(doi, pb) {
                Ok(v) => v,
                Err(e) => {
                    hard_failure.get_or_insert(e);
                    None
                }
            },
            None => None,
        };

        let locator = match &ids.doi {
            Some(doi) => match self.lookup_locator(doi, pb) {
                Ok(v) => v,
                Err(e) => {
                    hard_failure.get_or_insert(e);
                    None
                }
            },
            None => None,
        };

        let records: Vec<Metadata> = [
            aggregator.as_ref().map(parse_record),
            registry.as_ref().map(parse_record),
            locator.as_ref().map(parse_locator_record),
        ]
        .into_iter()
        .flatten()
        .collect();

        if records.is_empty() {
            if let Some(e) = hard_failure {
                return Err(EnrichError::Http(e));
            }
            if ids.is_empty() {
                return Err(EnrichError::Unresolved);
            }
        }

        let mut metadata = Metadata::default();
        for record in &records {
            metadata.fill_gaps(record);
        }
        metadata.fill_gaps(seed);

        // carry the CORD-only fields straight from the input row
        metadata.cord_sha = seed.cord_sha.clone();
        metadata.mag_id = seed.mag_id.clone();
        metadata.who_covidence = seed.who_covidence.clone();
        metadata.arxiv_id = seed.arxiv_id.clone();

        let pmc_url = ids
            .pmcid
            .as_deref()
            .and_then(|pmcid| pmc.archive_url(pmcid))
            .map(|(url, _license)| url);
        let locator_url = locator.as_ref().and_then(|v| best_oa_url(v, PMC_WEB_BASE));
        let aggregator_url = aggregator
            .as_ref()
            .and_then(|v| v["oaLink"].as_str())
            .map(str::to_string);
        let registry_url = registry.as_ref().and_then(registry_pdf_url);
        let mirror_path =
            mirror.and_then(|m| m.lookup(ids.doi.as_deref(), ids.pii.as_deref()));

        let candidates = assemble_candidates(
            pmc_url,
            locator_url,
            aggregator_url,
            registry_url,
            mirror_path,
        );

        if metadata.oa_url.is_none() {
            metadata.oa_url = candidates
                .iter()
                .find(|c| !c.url.starts_with("file://"))
                .map(|c| c.url.clone());
        }

        Ok(Enriched {
            identifiers: ids,
            metadata,
            candidates,
        })
    }

    /// Aggregator lookup, trying DOI, then PMID, then PMCID.
    fn lookup_aggregator(
        &self,
        ids: &Identifiers,
        pb: &ProgressBar,
    ) -> Result<Option<Value>, HttpError> {
        let Some(base) = &self.aggregator_url else {
            return Ok(None);
        };
        let url = format!("{base}/service/lookup");

        let params: Vec<(&str, &str)> = [
            ids.doi.as_deref().map(|v| ("doi", v)),
            ids.pmid.as_deref().map(|v| ("pmid", v)),
            ids.pmcid.as_deref().map(|v| ("pmc", v)),
        ]
        .into_iter()
        .flatten()
        .collect();

        for (name, value) in params {
            let record = self.get_json(
                &url,
                &[(name, value)],
                &self.aggregator_limiter,
                "aggregator",
                pb,
            )?;
            if record.is_some() {
                return Ok(record);
            }
        }
        Ok(None)
    }

    /// DOI registry record; the `reference` array is dropped as we never
    /// consume it and it dominates the payload.
    fn lookup_registry(&self, doi: &str, pb: &ProgressBar) -> Result<Option<Value>, HttpError> {
        let url = format!("{}/works/{doi}", self.doi_registry_url);
        let record = self.get_json(&url, &[], &self.registry_limiter, "doi registry", pb)?;
        Ok(record.map(|v| {
            let mut message = v["message"].clone();
            if let Some(object) = message.as_object_mut() {
                object.remove("reference");
            }
            message
        }))
    }

    fn lookup_locator(&self, doi: &str, pb: &ProgressBar) -> Result<Option<Value>, HttpError> {
        let url = format!("{}{doi}", self.oa_locator_url);
        self.get_json(
            &url,
            &[("email", self.contact_email.as_str())],
            &self.locator_limiter,
            "oa locator",
            pb,
        )
    }

    /// Rate-limited GET returning parsed JSON; 4xx means "no record".
    fn get_json(
        &self,
        url: &str,
        query: &[(&str, &str)],
        limiter: &TokenBucket,
        label: &str,
        pb: &ProgressBar,
    ) -> Result<Option<Value>, HttpError> {
        let fetched = retry_with_backoff(label, self.retries, self.max_backoff, pb, || {
            limiter.acquire();
            let request = http_client()
                .get(url)
                .query(query)
                .header(reqwest::header::USER_AGENT, self.user_agent())
                .header(reqwest::header::ACCEPT, "application/json");
            let fetched = fetch_bytes(request, self.timeout, None)?;
            // retry server-side trouble; hand anything else back
            if fetched.status >= 500 || fetched.status == 429 {
                return Err(HttpError::Transport {
                    status: Some(fetched.status),
                    message: format!("{label} answered {}", fetched.status),
                });
            }
            Ok(fetched)
        })?;

        if !fetched.is_success() {
            log::debug!("{label}: {} for {url}", fetched.status);
            return Ok(None);
        }
        match serde_json::from_slice(&fetched.body) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                log::debug!("{label}: unparseable JSON from {url}: {e}");
                Ok(None)
            }
        }
    }
}

/// Union identifiers contributed by an aggregator record.
fn absorb_identifiers(ids: &mut Identifiers, record: &Value) {
    let from_record = Identifiers {
        doi: record["DOI"]
            .as_str()
            .or_else(|| record["doi"].as_str())
            .map(|d| d.to_lowercase()),
        pmid: record["pmid"].as_str().map(str::to_string),
        pmcid: record["pmcid"]
            .as_str()
            .or_else(|| record["pmc"].as_str())
            .map(str::to_string),
        pii: record["pii"].as_str().map(str::to_string),
        cord_id: None,
    };
    ids.merge(&from_record);
}

/// Normalize a registry/aggregator work record (Crossref shape).
fn parse_record(value: &Value) -> Metadata {
    let title = value["title"]
        .as_array()
        .and_then(|t| t.first())
        .and_then(Value::as_str)
        .or_else(|| value["title"].as_str())
        .map(str::to_string);

    let authors: Vec<String> = value["author"]
        .as_array()
        .map(|list| {
            list.iter()
                .filter_map(|a| {
                    let given = a["given"].as_str().unwrap_or("").trim();
                    let family = a["family"].as_str().unwrap_or("").trim();
                    match (given.is_empty(), family.is_empty()) {
                        (true, true) => None,
                        (true, false) => Some(family.to_string()),
                        (false, true) => Some(given.to_string()),
                        (false, false) => Some(format!("{given} {family}")),
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let venue = value["container-title"]
        .as_array()
        .and_then(|t| t.first())
        .and_then(Value::as_str)
        .map(str::to_string);

    let year = value["issued"]["date-parts"]
        .as_array()
        .and_then(|p| p.first())
        .and_then(|p| p.as_array())
        .and_then(|p| p.first())
        .and_then(Value::as_i64)
        .map(|y| y.to_string());

    let license = value["license"]
        .as_array()
        .and_then(|l| l.first())
        .and_then(|l| l["URL"].as_str())
        .map(str::to_string);

    Metadata {
        title,
        authors,
        venue,
        year,
        license,
        abstract_text: value["abstract"].as_str().map(str::to_string),
        oa_url: value["oaLink"].as_str().map(str::to_string),
        ..Default::default()
    }
}

/// The OA locator record carries little metadata; take what is there.
fn parse_locator_record(value: &Value) -> Metadata {
    Metadata {
        title: value["title"].as_str().map(str::to_string),
        year: value["year"].as_i64().map(|y| y.to_string()),
        venue: value["journal_name"].as_str().map(str::to_string),
        license: value["best_oa_location"]["license"]
            .as_str()
            .map(str::to_string),
        ..Default::default()
    }
}

/// Best download URL from an OA locator response.
///
/// Preference order: the best location's direct PDF URL; a PMC-hosted best
/// location (gains `/pdf/`); any PMC-hosted alternate location; the first
/// alternate with a direct PDF URL.
pub fn best_oa_url(value: &Value, pmc_web_base: &str) -> Option<String> {
    let best = &value["best_oa_location"];
    if let Some(url) = best["url_for_pdf"].as_str() {
        return Some(url.to_string());
    }
    if let Some(url) = best["url"].as_str()
        && url.starts_with(pmc_web_base)
    {
        return Some(format!("{url}/pdf/"));
    }

    let locations = value["oa_locations"].as_array()?;
    for location in locations {
        if let Some(pdf_url) = location["url_for_pdf"].as_str()
            && (pdf_url.contains("europepmc.org/articles/pmc")
                || pdf_url.contains("ncbi.nlm.nih.gov/pmc/articles"))
            && let Some(url) = location["url"].as_str()
        {
            return Some(format!("{url}/pdf/"));
        }
    }
    for location in locations {
        if let Some(pdf_url) = location["url_for_pdf"].as_str() {
            return Some(pdf_url.to_string());
        }
    }
    None
}

/// Publisher PDF link from a registry record: a `link` entry with PDF
/// content type, else the resolver URL.
fn registry_pdf_url(value: &Value) -> Option<String> {
    if let Some(links) = value["link"].as_array() {
        for link in links {
            if link["content-type"].as_str() == Some("application/pdf")
                && let Some(url) = link["URL"].as_str()
            {
                return Some(url.to_string());
            }
        }
    }
    value["URL"].as_str().map(str::to_string)
}

/// Concatenate candidate URLs in priority order, deduplicating on first
/// occurrence. The order must be stable for a given metadata snapshot.
pub fn assemble_candidates(
    pmc_url: Option<String>,
    locator_url: Option<String>,
    aggregator_url: Option<String>,
    registry_url: Option<String>,
    mirror_path: Option<PathBuf>,
) -> Vec<CandidateUrl> {
    let ranked = [
        (pmc_url, UrlSource::PmcArchive),
        (locator_url, UrlSource::OaLocator),
        (aggregator_url, UrlSource::Aggregator),
        (registry_url, UrlSource::DoiRegistry),
        (
            mirror_path.map(|p| format!("file://{}", p.display())),
            UrlSource::LocalMirror,
        ),
    ];

    let mut candidates: Vec<CandidateUrl> = Vec::new();
    for (priority, (url, source)) in ranked.into_iter().enumerate() {
        let Some(url) = url else { continue };
        if candidates.iter().any(|c| c.url == url) {
            continue;
        }
        candidates.push(CandidateUrl {
            url,
            source,
            priority: priority as u8,
        });
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_registry_record() {
        let record = json!({
            "title": ["Evaluating Potential Deceased Donor Renal Transplant Recipients for Asymptomatic COVID-19"],
            "author": [
                {"given": "Marius", "family": "Miglinas"},
                {"family": "Stonkute"}
            ],
            "container-title": ["Transplantation Direct"],
            "issued": {"date-parts": [[2020, 6]]},
            "license": [{"URL": "http://creativecommons.org/licenses/by-nc-nd/4.0"}],
            "abstract": "Background..."
        });
        let metadata = parse_record(&record);
        assert_eq!(
            metadata.title.as_deref(),
            Some("Evaluating Potential Deceased Donor Renal Transplant Recipients for Asymptomatic COVID-19")
        );
        assert_eq!(metadata.authors, vec!["Marius Miglinas", "Stonkute"]);
        assert_eq!(metadata.venue.as_deref(), Some("Transplantation Direct"));
        assert_eq!(metadata.year.as_deref(), Some("2020"));
        assert!(metadata.license.is_some());
    }

    #[test]
    fn absorb_aggregator_identifiers() {
        let record = json!({"DOI": "10.1097/TXD.0000000000001010", "pmid": "32607426", "pmcid": "PMC7266364"});
        let mut ids = Identifiers::default();
        absorb_identifiers(&mut ids, &record);
        assert_eq!(ids.doi.as_deref(), Some("10.1097/txd.0000000000001010"));
        assert_eq!(ids.pmid.as_deref(), Some("32607426"));
        assert_eq!(ids.pmcid.as_deref(), Some("PMC7266364"));
    }

    #[test]
    fn best_oa_url_prefers_direct_pdf() {
        let value = json!({
            "best_oa_location": {"url_for_pdf": "https://host/x.pdf", "url": "https://host/x"},
            "oa_locations": []
        });
        assert_eq!(
            best_oa_url(&value, PMC_WEB_BASE).as_deref(),
            Some("https://host/x.pdf")
        );
    }

    #[test]
    fn best_oa_url_pmc_hosted_gets_pdf_suffix() {
        let value = json!({
            "best_oa_location": {"url": "https://www.ncbi.nlm.nih.gov/pmc/articles/PMC7029158"},
            "oa_locations": []
        });
        assert_eq!(
            best_oa_url(&value, PMC_WEB_BASE).as_deref(),
            Some("https://www.ncbi.nlm.nih.gov/pmc/articles/PMC7029158/pdf/")
        );
    }

    #[test]
    fn best_oa_url_falls_back_to_alternate_locations() {
        let value = json!({
            "best_oa_location": {"url": "https://publisher.example/landing"},
            "oa_locations": [
                {"url": "https://elsewhere.example/a"},
                {"url_for_pdf": "https://elsewhere.example/a.pdf", "url": "https://elsewhere.example/a"}
            ]
        });
        assert_eq!(
            best_oa_url(&value, PMC_WEB_BASE).as_deref(),
            Some("https://elsewhere.example/a.pdf")
        );
    }

    #[test]
    fn best_oa_url_none_when_nothing_usable() {
        let value = json!({
            "best_oa_location": {"url": "https://publisher.example/landing"},
            "oa_locations": [{"url": "https://other.example/b"}]
        });
        assert_eq!(best_oa_url(&value, PMC_WEB_BASE), None);
    }

    #[test]
    fn registry_pdf_link_preferred_over_resolver() {
        let value = json!({
            "URL": "https://doi.org/10.1/x",
            "link": [
                {"URL": "https://pub.example/html", "content-type": "text/html"},
                {"URL": "https://pub.example/x.pdf", "content-type": "application/pdf"}
            ]
        });
        assert_eq!(
            registry_pdf_url(&value).as_deref(),
            Some("https://pub.example/x.pdf")
        );
    }

    #[test]
    fn candidates_keep_priority_order() {
        let candidates = assemble_candidates(
            Some("https://ftp.pmc/arch.tar.gz".into()),
            Some("https://oa.example/x.pdf".into()),
            Some("https://agg.example/x.pdf".into()),
            Some("https://pub.example/x.pdf".into()),
            Some(PathBuf::from("/mirror/x.pdf")),
        );
        let urls: Vec<&str> = candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://ftp.pmc/arch.tar.gz",
                "https://oa.example/x.pdf",
                "https://agg.example/x.pdf",
                "https://pub.example/x.pdf",
                "file:///mirror/x.pdf",
            ]
        );
        assert_eq!(candidates[0].source, UrlSource::PmcArchive);
        assert!(candidates.windows(2).all(|w| w[0].priority < w[1].priority));
    }

    #[test]
    fn candidates_dedup_first_occurrence() {
        let candidates = assemble_candidates(
            None,
            Some("https://same.example/x.pdf".into()),
            Some("https://same.example/x.pdf".into()),
            None,
            None,
        );
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].source, UrlSource::OaLocator);
    }

    #[test]
    fn candidates_empty_when_no_source() {
        assert!(assemble_candidates(None, None, None, None, None).is_empty());
    }
}
