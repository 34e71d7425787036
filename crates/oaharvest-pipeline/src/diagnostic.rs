//! Completeness reporting over the state store.
//!
//! A single read-only pass produces the harvest coverage counts, rendered
//! as a plain-text table for humans and as JSON for machines. The same
//! module hosts the consolidated metadata dump.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

use oaharvest_store::{Artifact, Repository, StateStore, artifact_path};

use crate::entry::Entry;

/// Harvest coverage counts.
#[derive(Debug, Default, PartialEq)]
pub struct Report {
    pub total: usize,
    pub with_oa_url: usize,
    pub with_pdf: usize,
    pub with_jats: usize,
    pub with_tei_pdf: usize,
    pub with_tei_jats: usize,
    pub with_any_tei: usize,
    pub failed: usize,
}

impl Report {
    pub fn compute(entries: &[Entry]) -> Self {
        let mut report = Report {
            total: entries.len(),
            ..Default::default()
        };
        for entry in entries {
            if entry.has_oa_url {
                report.with_oa_url += 1;
            }
            if entry.artifacts.pdf {
                report.with_pdf += 1;
            }
            if entry.artifacts.jats {
                report.with_jats += 1;
            }
            if entry.artifacts.tei_from_pdf {
                report.with_tei_pdf += 1;
            }
            if entry.artifacts.tei_from_jats {
                report.with_tei_jats += 1;
            }
            if entry.has_any_tei() {
                report.with_any_tei += 1;
            }
            if entry.status.any_failed() {
                report.failed += 1;
            }
        }
        report
    }

    pub fn from_store(store: &StateStore<Entry>) -> Self {
        Self::compute(&store.iter_all())
    }

    pub fn render_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .apply_modifier(UTF8_ROUND_CORNERS)
            .set_header(vec![Cell::new("Coverage"), Cell::new("Entries")]);
        for (label, value) in self.rows() {
            table.add_row(vec![Cell::new(label), Cell::new(value.to_string())]);
        }
        table.to_string()
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "total_entries": self.total,
            "with_valid_oa_url": self.with_oa_url,
            "with_pdf": self.with_pdf,
            "with_jats": self.with_jats,
            "with_tei_from_pdf": self.with_tei_pdf,
            "with_tei_from_jats": self.with_tei_jats,
            "with_any_tei": self.with_any_tei,
            "with_failed_stage": self.failed,
        })
    }

    pub fn log(&self) {
        for (label, value) in self.rows() {
            log::info!("{label}: {value}");
        }
    }

    fn rows(&self) -> [(&'static str, usize); 8] {
        [
            ("total entries", self.total),
            ("with valid OA URL", self.with_oa_url),
            ("with downloaded PDF", self.with_pdf),
            ("with JATS file", self.with_jats),
            ("with TEI from PDF", self.with_tei_pdf),
            ("with TEI from JATS", self.with_tei_jats),
            ("with at least one TEI", self.with_any_tei),
            ("with a failed stage", self.failed),
        ]
    }
}

/// Write every entry's consolidated metadata as one JSON object per line.
pub fn dump_metadata(
    store: &StateStore<Entry>,
    repository: &Repository,
    out_path: &Path,
) -> Result<usize> {
    let mut out = std::fs::File::create(out_path)
        .with_context(|| format!("failed to create {}", out_path.display()))?;

    let mut written = 0usize;
    for entry in store.iter_all() {
        let Some(bytes) = repository.get(&artifact_path(&entry.id, Artifact::Metadata))? else {
            continue;
        };
        // re-serialize compactly so the dump is valid JSONL
        let value: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("{}: unreadable metadata artifact: {e}", entry.id);
                continue;
            }
        };
        serde_json::to_writer(&mut out, &value)?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.sync_all()?;
    log::info!("metadata dump: {written} records in {}", out_path.display());
    Ok(written)
}
