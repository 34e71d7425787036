//! Configuration loading from JSON (`./config.json` by default)

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use oaharvest_store::S3Config;

/// Run configuration.
///
/// Every field has a default so a minimal `config.json` only needs to set
/// what differs; the S3 fields are all-or-nothing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root of the local repository (and of the working files).
    pub data_path: PathBuf,

    // Object-store backend; when `s3_bucket` is set, all S3 fields must be.
    pub s3_bucket: Option<String>,
    pub s3_region: Option<String>,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    pub s3_prefix: Option<String>,

    /// Worker-pool size: maximum entries in flight.
    pub batch_size: usize,

    pub bibliographic_aggregator_url: Option<String>,
    pub doi_registry_url: String,
    pub oa_locator_url: String,
    pub pdf_structuring_url: String,
    pub jats_transformer_path: Option<PathBuf>,

    /// Sent to upstream etiquette-requiring APIs.
    pub contact_email: String,

    /// Local mirror of publisher Open Access PDFs (CORD-19 Elsevier set).
    pub cord19_publisher_pdf_path: Option<PathBuf>,
    /// Gzipped CSV mapping doi/pii to a file in the mirror.
    pub cord19_publisher_map_path: Option<PathBuf>,
    /// Prior-run repository probed before any network fetch.
    pub legacy_data_path: Option<PathBuf>,

    /// PMC OA archive file list (`oa_file_list.txt`).
    pub pmc_index_path: PathBuf,
    /// Base URL the PMC index subpaths are relative to.
    pub pmc_base_url: String,

    pub per_host_limit: usize,
    pub per_stage_retries: u32,
    pub max_backoff_secs: u64,

    pub metadata_timeout_secs: u64,
    pub pdf_timeout_secs: u64,
    pub jats_timeout_secs: u64,
    pub structuring_timeout_secs: u64,
    pub thumbnail_timeout_secs: u64,
    pub batch_transform_timeout_secs: u64,

    /// Seconds to wait when the structuring service answers 503 (busy).
    pub busy_wait_secs: u64,

    // Per-service token buckets, requests per second.
    pub aggregator_rps: f64,
    pub registry_rps: f64,
    pub locator_rps: f64,

    /// Accepted PDF size window in bytes.
    pub min_pdf_bytes: u64,
    pub max_pdf_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data"),
            s3_bucket: None,
            s3_region: None,
            s3_access_key: None,
            s3_secret_key: None,
            s3_prefix: None,
            batch_size: 20,
            bibliographic_aggregator_url: None,
            doi_registry_url: "https://api.crossref.org".to_string(),
            oa_locator_url: "https://api.unpaywall.org/v2/".to_string(),
            pdf_structuring_url: "http://localhost:8070/api".to_string(),
            jats_transformer_path: None,
            contact_email: String::new(),
            cord19_publisher_pdf_path: None,
            cord19_publisher_map_path: None,
            legacy_data_path: None,
            pmc_index_path: PathBuf::from("./resources/oa_file_list.txt"),
            pmc_base_url: "https://ftp.ncbi.nlm.nih.gov/pub/pmc/".to_string(),
            per_host_limit: 2,
            per_stage_retries: 3,
            max_backoff_secs: 60,
            metadata_timeout_secs: 30,
            pdf_timeout_secs: 120,
            jats_timeout_secs: 120,
            structuring_timeout_secs: 600,
            thumbnail_timeout_secs: 60,
            batch_transform_timeout_secs: 3600,
            busy_wait_secs: 5,
            aggregator_rps: 10.0,
            registry_rps: 5.0,
            locator_rps: 5.0,
            min_pdf_bytes: 512,
            max_pdf_bytes: 100 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Load and validate a configuration file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        log::info!("loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be at least 1");
        }
        if self.min_pdf_bytes >= self.max_pdf_bytes {
            bail!("min_pdf_bytes must be smaller than max_pdf_bytes");
        }
        let s3_parts = [
            self.s3_bucket.is_some(),
            self.s3_region.is_some(),
            self.s3_access_key.is_some(),
            self.s3_secret_key.is_some(),
        ];
        if s3_parts.iter().any(|p| *p) && !s3_parts.iter().all(|p| *p) {
            bail!("incomplete S3 configuration: bucket, region, access key and secret key are all required");
        }
        Ok(())
    }

    /// Object-store settings, when the config selects the S3 backend.
    pub fn s3_config(&self) -> Option<S3Config> {
        Some(S3Config {
            bucket: self.s3_bucket.clone()?,
            region: self.s3_region.clone()?,
            access_key: self.s3_access_key.clone()?,
            secret_key: self.s3_secret_key.clone()?,
            prefix: self.s3_prefix.clone().unwrap_or_default(),
        })
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    pub fn metadata_timeout(&self) -> Duration {
        Duration::from_secs(self.metadata_timeout_secs)
    }

    pub fn pdf_timeout(&self) -> Duration {
        Duration::from_secs(self.pdf_timeout_secs)
    }

    pub fn jats_timeout(&self) -> Duration {
        Duration::from_secs(self.jats_timeout_secs)
    }

    pub fn structuring_timeout(&self) -> Duration {
        Duration::from_secs(self.structuring_timeout_secs)
    }

    pub fn thumbnail_timeout(&self) -> Duration {
        Duration::from_secs(self.thumbnail_timeout_secs)
    }

    pub fn batch_transform_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_transform_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn parse_minimal_config() {
        let config: Config = serde_json::from_str(
            r#"{
                "data_path": "/srv/corpus",
                "batch_size": 8,
                "contact_email": "ops@example.org"
            }"#,
        )
        .unwrap();
        assert_eq!(config.data_path, PathBuf::from("/srv/corpus"));
        assert_eq!(config.batch_size, 8);
        assert_eq!(config.per_stage_retries, 3);
        assert!(config.s3_config().is_none());
    }

    #[test]
    fn s3_selected_when_complete() {
        let config: Config = serde_json::from_str(
            r#"{
                "s3_bucket": "corpus",
                "s3_region": "us-west-2",
                "s3_access_key": "k",
                "s3_secret_key": "s",
                "s3_prefix": "harvest"
            }"#,
        )
        .unwrap();
        config.validate().unwrap();
        let s3 = config.s3_config().unwrap();
        assert_eq!(s3.bucket, "corpus");
        assert_eq!(s3.prefix, "harvest");
    }

    #[test]
    fn incomplete_s3_rejected() {
        let config: Config =
            serde_json::from_str(r#"{"s3_bucket": "corpus"}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_batch_size_rejected() {
        let config: Config = serde_json::from_str(r#"{"batch_size": 0}"#).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_size_window_rejected() {
        let config: Config = serde_json::from_str(
            r#"{"min_pdf_bytes": 1000, "max_pdf_bytes": 100}"#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }
}
