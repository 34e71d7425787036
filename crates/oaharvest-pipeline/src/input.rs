//! Input readers: identifier list files and the CORD-19 metadata CSV.
//!
//! The CSV shape varies across releases, so the header is read once into a
//! column→index map and all field access goes through typed accessors that
//! return `None` for absent columns.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};

use crate::entry::Identifiers;
use crate::ids::{clean_doi, clean_pmcid};

/// One raw input row, normalized from whichever input format produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputRow {
    pub identifiers: Identifiers,
    pub title: Option<String>,
    /// Raw author field, `;`-separated as in CORD-19.
    pub authors: Option<String>,
    /// Publication date, ISO style (`2020-08-15`) or bare year.
    pub publish_time: Option<String>,
    pub license: Option<String>,
    pub abstract_text: Option<String>,
    pub sha: Option<String>,
    pub mag_id: Option<String>,
    pub who_covidence: Option<String>,
    pub arxiv_id: Option<String>,
    /// True when the row came from a CORD-19 metadata file.
    pub from_cord19: bool,
}

impl InputRow {
    pub fn from_doi(doi: &str) -> Self {
        Self {
            identifiers: Identifiers {
                doi: Some(clean_doi(doi)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn from_pmid(pmid: &str) -> Self {
        Self {
            identifiers: Identifiers {
                pmid: Some(pmid.trim().to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn from_pmcid(pmcid: &str) -> Self {
        Self {
            identifiers: Identifiers {
                pmcid: Some(clean_pmcid(pmcid)),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Year digits from `publish_time`, used as a dedup key component.
    pub fn year(&self) -> Option<&str> {
        let time = self.publish_time.as_deref()?;
        let year = time.split('-').next()?.trim();
        if year.len() == 4 && year.chars().all(|c| c.is_ascii_digit()) {
            Some(year)
        } else {
            None
        }
    }
}

/// Read a one-identifier-per-line file (DOI, PMID or PMCID lists).
pub fn read_id_file(path: &Path, make: impl Fn(&str) -> InputRow) -> Result<Vec<InputRow>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read input file {}", path.display()))?;
    let rows: Vec<InputRow> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        // PMC exports sometimes carry a literal header line
        .filter(|line| !line.eq_ignore_ascii_case("pmc"))
        .map(make)
        .collect();
    log::info!("{}: {} identifiers", path.display(), rows.len());
    Ok(rows)
}

/// Column→index map built from a CSV header row.
pub struct ColumnMap {
    indices: HashMap<String, usize>,
}

impl ColumnMap {
    pub fn from_headers(headers: &csv::StringRecord) -> Self {
        let indices = headers
            .iter()
            .enumerate()
            .map(|(i, name)| (name.trim().to_string(), i))
            .collect();
        Self { indices }
    }

    /// Field value by column name; `None` for missing columns and empty
    /// cells alike.
    pub fn get<'r>(&self, record: &'r csv::StringRecord, column: &str) -> Option<&'r str> {
        let index = *self.indices.get(column)?;
        let value = record.get(index)?.trim();
        if value.is_empty() { None } else { Some(value) }
    }
}

/// Read a CORD-19 metadata CSV. Malformed rows are skipped with a warning
/// and do not count as failures.
pub fn read_cord19(path: &Path) -> Result<Vec<InputRow>> {
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("failed to open CSV {}", path.display()))?;
    let columns = ColumnMap::from_headers(
        reader
            .headers()
            .with_context(|| format!("failed to read CSV header of {}", path.display()))?,
    );

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for (line_no, record) in reader.records().enumerate() {
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                log::warn!("{}:{}: skipping malformed row: {e}", path.display(), line_no + 2);
                skipped += 1;
                continue;
            }
        };
        rows.push(cord19_row(&columns, &record));
    }

    log::info!(
        "{}: {} rows ({} skipped)",
        path.display(),
        rows.len(),
        skipped
    );
    Ok(rows)
}

fn cord19_row(columns: &ColumnMap, record: &csv::StringRecord) -> InputRow {
    InputRow {
        identifiers: Identifiers {
            doi: columns.get(record, "doi").map(clean_doi),
            pmid: columns.get(record, "pubmed_id").map(str::to_string),
            pmcid: columns.get(record, "pmcid").map(clean_pmcid),
            pii: None,
            cord_id: columns.get(record, "cord_uid").map(str::to_string),
        },
        title: columns.get(record, "title").map(str::to_string),
        authors: columns.get(record, "authors").map(str::to_string),
        publish_time: columns.get(record, "publish_time").map(str::to_string),
        license: columns.get(record, "license").map(str::to_string),
        abstract_text: columns.get(record, "abstract").map(str::to_string),
        sha: columns.get(record, "sha").map(str::to_string),
        mag_id: columns.get(record, "mag_id").map(str::to_string),
        who_covidence: columns.get(record, "who_covidence_id").map(str::to_string),
        arxiv_id: columns.get(record, "arxiv_id").map(str::to_string),
        from_cord19: true,
    }
}
