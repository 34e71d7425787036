//! Reverse transform pass: JATS → TEI in batch.
//!
//! Revisits every entry holding a JATS artifact without a TEI-from-JATS
//! sibling, stages the `.nxml` files into a working directory and runs the
//! batch transformer over them, checkpointing the state store per batch.

use std::path::Path;

use anyhow::{Context, Result};

use oaharvest_core::{SharedProgress, fmt_num, is_shutdown_requested};
use oaharvest_store::{Artifact, Repository, StateStore, artifact_path};

use crate::entry::{Entry, FailureReason, Stage, StageStatus};
use crate::jats_transform::{JatsTransformer, TransformError, id_from_output_name};

/// Entries staged per transformer invocation.
const BATCH_SIZE: usize = 1000;

#[derive(Debug, Default)]
pub struct ReverseSummary {
    pub pending: usize,
    pub converted: usize,
    pub failed: usize,
    pub cancelled: bool,
}

/// Entries whose JATS artifact still lacks the TEI-from-JATS sibling.
pub fn collect_pending(
    store: &StateStore<Entry>,
    repository: &Repository,
) -> Result<Vec<Entry>> {
    let mut pending = Vec::new();
    for entry in store.iter_all() {
        if !entry.artifacts.jats || entry.artifacts.tei_from_jats {
            continue;
        }
        // trust but verify: the flag must match the repository
        if repository.has(&artifact_path(&entry.id, Artifact::Jats))? {
            pending.push(entry);
        } else {
            log::warn!("{}: jats flagged but artifact missing", entry.id);
        }
    }
    Ok(pending)
}

/// Run the whole reverse pass.
pub fn run(
    repository: &Repository,
    store: &StateStore<Entry>,
    transformer: &JatsTransformer,
    work_dir: &Path,
    progress: &SharedProgress,
) -> Result<ReverseSummary> {
    let pending = collect_pending(store, repository)?;
    let mut summary = ReverseSummary {
        pending: pending.len(),
        ..Default::default()
    };
    log::info!("reverse pass: {} entries to transform", fmt_num(pending.len()));
    if pending.is_empty() {
        return Ok(summary);
    }

    let staging_root = work_dir.join("jats2tei");
    for (batch_no, batch) in pending.chunks(BATCH_SIZE).enumerate() {
        if is_shutdown_requested() {
            summary.cancelled = true;
            break;
        }
        progress.println(format!(
            "batch {}: {} documents",
            batch_no + 1,
            batch.len()
        ));

        let input_dir = staging_root.join("in");
        let output_dir = staging_root.join("out");
        reset_dir(&input_dir)?;
        reset_dir(&output_dir)?;

        for entry in batch {
            let Some(nxml) = repository.get(&artifact_path(&entry.id, Artifact::Jats))? else {
                continue;
            };
            std::fs::write(input_dir.join(format!("{}.nxml", entry.id)), nxml)?;
        }

        match transformer.transform_batch(&input_dir, &output_dir) {
            Ok(()) => {
                let converted = apply_outputs(&output_dir, repository, store)?;
                summary.converted += converted;
                // staged entries with no output are transform casualties
                let missed = mark_missing(batch, store)?;
                summary.failed += missed;
            }
            Err(e) => {
                let reason = match e {
                    TransformError::Timeout => FailureReason::Timeout,
                    _ => FailureReason::StructuringFailed,
                };
                log::error!("batch {} failed: {e}", batch_no + 1);
                for entry in batch {
                    let mut entry = entry.clone();
                    entry.status.set(Stage::TeiJats, StageStatus::Failed { reason });
                    store.update(&entry)?;
                }
                summary.failed += batch.len();
            }
        }

        let _ = std::fs::remove_dir_all(&staging_root);
    }

    log::info!(
        "reverse pass: {} converted, {} failed",
        fmt_num(summary.converted),
        fmt_num(summary.failed)
    );
    Ok(summary)
}

/// Copy transformer outputs back into each entry's directory and update
/// the state store per entry.
pub fn apply_outputs(
    output_dir: &Path,
    repository: &Repository,
    store: &StateStore<Entry>,
) -> Result<usize> {
    let mut converted = 0usize;
    for dir_entry in std::fs::read_dir(output_dir)
        .with_context(|| format!("failed to read {}", output_dir.display()))?
    {
        let path = dir_entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let Some(id) = id_from_output_name(name) else {
            continue;
        };
        let Some(mut entry) = store.get(id) else {
            log::warn!("transformer produced output for unknown entry {id}");
            continue;
        };

        let tei = std::fs::read(&path)?;
        if tei.is_empty() {
            continue;
        }
        repository.put(&artifact_path(id, Artifact::TeiFromJats), &tei)?;
        entry.artifacts.tei_from_jats = true;
        entry.status.set(
            Stage::TeiJats,
            StageStatus::Success {
                has_warnings: false,
            },
        );
        store.update(&entry)?;
        converted += 1;
    }
    Ok(converted)
}

fn mark_missing(batch: &[Entry], store: &StateStore<Entry>) -> Result<usize> {
    let mut missed = 0usize;
    for entry in batch {
        let Some(mut current) = store.get(&entry.id) else {
            continue;
        };
        if !current.artifacts.tei_from_jats {
            current.status.set(
                Stage::TeiJats,
                StageStatus::Failed {
                    reason: FailureReason::StructuringFailed,
                },
            );
            store.update(&current)?;
            missed += 1;
        }
    }
    Ok(missed)
}

fn reset_dir(dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)?;
    }
    std::fs::create_dir_all(dir)?;
    Ok(())
}
