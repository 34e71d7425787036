//! The per-article entry model: identifiers, stage statuses, artifact flags.
//!
//! An `Entry` is exactly what one `map.jsonl` record holds. The consolidated
//! bibliographic metadata is not part of it — that lives in the `<id>.json`
//! artifact next to the other files of the entry.

use serde::{Deserialize, Serialize};

use oaharvest_store::StateRecord;

/// One step of the per-entry state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Metadata,
    Pdf,
    Jats,
    TeiPdf,
    TeiJats,
}

/// All stages, in execution order.
pub const STAGES: [Stage; 5] = [
    Stage::Metadata,
    Stage::Pdf,
    Stage::Jats,
    Stage::TeiPdf,
    Stage::TeiJats,
];

impl Stage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Pdf => "pdf",
            Self::Jats => "jats",
            Self::TeiPdf => "tei_pdf",
            Self::TeiJats => "tei_jats",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a stage ended in `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No identifier yielded a metadata record.
    Unresolved,
    /// Enrichment succeeded but produced no candidate URL.
    NoOaUrl,
    /// The candidate list was empty at fetch time.
    NoUrl,
    /// Every candidate URL was tried and rejected.
    AllUrlsFailed,
    HttpError,
    Timeout,
    /// Response was not the advertised format (e.g. HTML where a PDF was
    /// expected).
    InvalidContent,
    TooLarge,
    StructuringFailed,
}

impl FailureReason {
    /// Whether a later run should try the stage again on plain resume.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::HttpError | Self::Timeout)
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unresolved => "unresolved",
            Self::NoOaUrl => "no_oa_url",
            Self::NoUrl => "no_url",
            Self::AllUrlsFailed => "all_urls_failed",
            Self::HttpError => "http_error",
            Self::Timeout => "timeout",
            Self::InvalidContent => "invalid_content",
            Self::TooLarge => "too_large",
            Self::StructuringFailed => "structuring_failed",
        };
        f.write_str(s)
    }
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Status of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Pending,
    InProgress,
    Success {
        #[serde(default, skip_serializing_if = "is_false")]
        has_warnings: bool,
    },
    Failed {
        reason: FailureReason,
    },
}

impl StageStatus {
    pub fn success() -> Self {
        Self::Success {
            has_warnings: false,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Failed { reason } => Some(*reason),
            _ => None,
        }
    }
}

/// Per-stage statuses of an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageStatusMap {
    #[serde(default)]
    pub metadata: StageStatus,
    #[serde(default)]
    pub pdf: StageStatus,
    #[serde(default)]
    pub jats: StageStatus,
    #[serde(default)]
    pub tei_pdf: StageStatus,
    #[serde(default)]
    pub tei_jats: StageStatus,
}

impl StageStatusMap {
    pub fn get(&self, stage: Stage) -> StageStatus {
        match stage {
            Stage::Metadata => self.metadata,
            Stage::Pdf => self.pdf,
            Stage::Jats => self.jats,
            Stage::TeiPdf => self.tei_pdf,
            Stage::TeiJats => self.tei_jats,
        }
    }

    pub fn set(&mut self, stage: Stage, status: StageStatus) {
        match stage {
            Stage::Metadata => self.metadata = status,
            Stage::Pdf => self.pdf = status,
            Stage::Jats => self.jats = status,
            Stage::TeiPdf => self.tei_pdf = status,
            Stage::TeiJats => self.tei_jats = status,
        }
    }

    /// Demote any `in_progress` stage back to `pending` (crash recovery,
    /// and the post-cancel flush).
    pub fn demote_in_progress(&mut self) -> bool {
        let mut changed = false;
        for stage in STAGES {
            if self.get(stage) == StageStatus::InProgress {
                self.set(stage, StageStatus::Pending);
                changed = true;
            }
        }
        changed
    }

    pub fn any_in_progress(&self) -> bool {
        STAGES
            .iter()
            .any(|s| self.get(*s) == StageStatus::InProgress)
    }

    pub fn any_failed(&self) -> bool {
        STAGES.iter().any(|s| self.get(*s).is_failed())
    }
}

/// Per-stage attempt counters, persisted so the retry cap survives restarts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttemptCounts {
    #[serde(default)]
    pub metadata: u32,
    #[serde(default)]
    pub pdf: u32,
    #[serde(default)]
    pub jats: u32,
    #[serde(default)]
    pub tei_pdf: u32,
    #[serde(default)]
    pub tei_jats: u32,
}

impl AttemptCounts {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::Metadata => self.metadata,
            Stage::Pdf => self.pdf,
            Stage::Jats => self.jats,
            Stage::TeiPdf => self.tei_pdf,
            Stage::TeiJats => self.tei_jats,
        }
    }

    pub fn bump(&mut self, stage: Stage) {
        match stage {
            Stage::Metadata => self.metadata += 1,
            Stage::Pdf => self.pdf += 1,
            Stage::Jats => self.jats += 1,
            Stage::TeiPdf => self.tei_pdf += 1,
            Stage::TeiJats => self.tei_jats += 1,
        }
    }

    pub fn reset(&mut self, stage: Stage) {
        match stage {
            Stage::Metadata => self.metadata = 0,
            Stage::Pdf => self.pdf = 0,
            Stage::Jats => self.jats = 0,
            Stage::TeiPdf => self.tei_pdf = 0,
            Stage::TeiJats => self.tei_jats = 0,
        }
    }
}

fn none<T>(v: &Option<T>) -> bool {
    v.is_none()
}

/// Strong identifiers of an article; any subset may be present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identifiers {
    #[serde(default, skip_serializing_if = "none")]
    pub doi: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub pmid: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub pmcid: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub pii: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub cord_id: Option<String>,
}

impl Identifiers {
    pub fn is_empty(&self) -> bool {
        self.doi.is_none()
            && self.pmid.is_none()
            && self.pmcid.is_none()
            && self.pii.is_none()
            && self.cord_id.is_none()
    }

    /// Union another identifier set into this one. Existing values win.
    pub fn merge(&mut self, other: &Identifiers) {
        if self.doi.is_none() {
            self.doi = other.doi.clone();
        }
        if self.pmid.is_none() {
            self.pmid = other.pmid.clone();
        }
        if self.pmcid.is_none() {
            self.pmcid = other.pmcid.clone();
        }
        if self.pii.is_none() {
            self.pii = other.pii.clone();
        }
        if self.cord_id.is_none() {
            self.cord_id = other.cord_id.clone();
        }
    }

    /// Ordering used when merging duplicate rows: PMC > DOI > PMID >
    /// title-only.
    pub fn richness(&self) -> u8 {
        if self.pmcid.is_some() {
            3
        } else if self.doi.is_some() {
            2
        } else if self.pmid.is_some() {
            1
        } else {
            0
        }
    }
}

/// Presence flags, kept in lock-step with the repository contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactFlags {
    #[serde(default)]
    pub pdf: bool,
    #[serde(default)]
    pub jats: bool,
    #[serde(default)]
    pub tei_from_pdf: bool,
    #[serde(default)]
    pub tei_from_jats: bool,
    #[serde(default)]
    pub ref_annotations: bool,
    #[serde(default)]
    pub thumbnails: bool,
}

/// One `map.jsonl` record; the unit of orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    #[serde(default)]
    pub identifiers: Identifiers,
    #[serde(default)]
    pub status: StageStatusMap,
    #[serde(default)]
    pub artifacts: ArtifactFlags,
    #[serde(default)]
    pub attempts: AttemptCounts,
    /// Set once enrichment found at least one Open Access URL.
    #[serde(default)]
    pub has_oa_url: bool,
}

impl Entry {
    pub fn new(id: String, identifiers: Identifiers) -> Self {
        Self {
            id,
            identifiers,
            status: StageStatusMap::default(),
            artifacts: ArtifactFlags::default(),
            attempts: AttemptCounts::default(),
            has_oa_url: false,
        }
    }

    /// `done` means nothing is left that this run could do for the entry:
    /// a TEI was produced (from PDF, or from JATS when structuring from
    /// PDF is off) and no earlier stage is still pending.
    pub fn has_any_tei(&self) -> bool {
        self.artifacts.tei_from_pdf || self.artifacts.tei_from_jats
    }
}

impl StateRecord for Entry {
    fn id(&self) -> &str {
        &self.id
    }
}

/// Normalized bibliographic record, written to the `<id>.json` artifact
/// together with the candidate URL list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub authors: Vec<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub venue: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub year: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub license: Option<String>,
    #[serde(rename = "abstract", default, skip_serializing_if = "none")]
    pub abstract_text: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub oa_url: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub cord_sha: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub mag_id: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub who_covidence: Option<String>,
    #[serde(default, skip_serializing_if = "none")]
    pub arxiv_id: Option<String>,
}

impl Metadata {
    /// Fill empty fields of `self` from `other` (first source wins).
    pub fn fill_gaps(&mut self, other: &Metadata) {
        if self.title.is_none() {
            self.title = other.title.clone();
        }
        if self.authors.is_empty() {
            self.authors = other.authors.clone();
        }
        if self.venue.is_none() {
            self.venue = other.venue.clone();
        }
        if self.year.is_none() {
            self.year = other.year.clone();
        }
        if self.license.is_none() {
            self.license = other.license.clone();
        }
        if self.abstract_text.is_none() {
            self.abstract_text = other.abstract_text.clone();
        }
        if self.oa_url.is_none() {
            self.oa_url = other.oa_url.clone();
        }
    }
}

/// Where a candidate download URL came from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlSource {
    PmcArchive,
    OaLocator,
    Aggregator,
    DoiRegistry,
    LocalMirror,
    Legacy,
}

/// One ranked download candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateUrl {
    pub url: String,
    pub source: UrlSource,
    pub priority: u8,
}

/// The `<id>.json` artifact: consolidated metadata plus the URL snapshot,
/// sufficient to resume later stages without re-querying the metadata
/// services.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedRecord {
    pub id: String,
    #[serde(default)]
    pub identifiers: Identifiers,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub candidate_urls: Vec<CandidateUrl>,
    #[serde(default, skip_serializing_if = "none")]
    pub harvested_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_status_default_pending() {
        assert_eq!(StageStatus::default(), StageStatus::Pending);
    }

    #[test]
    fn entry_record_roundtrip() {
        let mut entry = Entry::new(
            "fq4xq00d".into(),
            Identifiers {
                doi: Some("10.1000/x".into()),
                cord_id: Some("fq4xq00d".into()),
                ..Default::default()
            },
        );
        entry.status.metadata = StageStatus::success();
        entry.status.pdf = StageStatus::Failed {
            reason: FailureReason::AllUrlsFailed,
        };
        entry.attempts.pdf = 2;
        entry.artifacts.jats = true;

        let json = serde_json::to_string(&entry).unwrap();
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn failure_reason_serializes_snake_case() {
        let status = StageStatus::Failed {
            reason: FailureReason::AllUrlsFailed,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("\"failed\""));
        assert!(json.contains("\"all_urls_failed\""));
    }

    #[test]
    fn retryable_reasons() {
        assert!(FailureReason::HttpError.is_retryable());
        assert!(FailureReason::Timeout.is_retryable());
        assert!(!FailureReason::InvalidContent.is_retryable());
        assert!(!FailureReason::TooLarge.is_retryable());
        assert!(!FailureReason::Unresolved.is_retryable());
    }

    #[test]
    fn demote_in_progress() {
        let mut statuses = StageStatusMap::default();
        statuses.pdf = StageStatus::InProgress;
        statuses.metadata = StageStatus::success();
        assert!(statuses.demote_in_progress());
        assert_eq!(statuses.pdf, StageStatus::Pending);
        assert!(statuses.metadata.is_success());
        assert!(!statuses.any_in_progress());
    }

    #[test]
    fn identifiers_merge_keeps_existing() {
        let mut a = Identifiers {
            doi: Some("10.1/a".into()),
            ..Default::default()
        };
        let b = Identifiers {
            doi: Some("10.1/b".into()),
            pmid: Some("123".into()),
            ..Default::default()
        };
        a.merge(&b);
        assert_eq!(a.doi.as_deref(), Some("10.1/a"));
        assert_eq!(a.pmid.as_deref(), Some("123"));
    }

    #[test]
    fn richness_ordering() {
        let pmc = Identifiers {
            pmcid: Some("PMC1".into()),
            ..Default::default()
        };
        let doi = Identifiers {
            doi: Some("10.1/x".into()),
            ..Default::default()
        };
        let pmid = Identifiers {
            pmid: Some("1".into()),
            ..Default::default()
        };
        let bare = Identifiers::default();
        assert!(pmc.richness() > doi.richness());
        assert!(doi.richness() > pmid.richness());
        assert!(pmid.richness() > bare.richness());
    }

    #[test]
    fn metadata_fill_gaps_first_source_wins() {
        let mut primary = Metadata {
            title: Some("kept".into()),
            ..Default::default()
        };
        let secondary = Metadata {
            title: Some("ignored".into()),
            year: Some("2020".into()),
            ..Default::default()
        };
        primary.fill_gaps(&secondary);
        assert_eq!(primary.title.as_deref(), Some("kept"));
        assert_eq!(primary.year.as_deref(), Some("2020"));
    }

    #[test]
    fn abstract_field_renamed() {
        let metadata = Metadata {
            abstract_text: Some("text".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&metadata).unwrap();
        assert!(json.contains("\"abstract\""));
        assert!(!json.contains("abstract_text"));
    }
}
