//! The pipeline orchestrator: bounded worker pool driving each entry
//! through its state machine.
//!
//! Workers own one entry end-to-end. A stage writes `in_progress` durably
//! before doing I/O and its terminal state durably after, so a crash can
//! only lose the stage that was in flight; startup recovery demotes those
//! to `pending`. There is no ordering across entries.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use indicatif::ProgressBar;

use oaharvest_core::{SharedProgress, fmt_num, is_shutdown_requested, retry_with_backoff};
use oaharvest_store::{Artifact, Repository, StateStore, artifact_path};

use crate::config::Config;
use crate::dedup::{Resolution, Resolver};
use crate::entry::{
    ConsolidatedRecord, Entry, FailureReason, Metadata, Stage, StageStatus, UrlSource,
};
use crate::fetch::{Fetcher, validate_pdf};
use crate::input::InputRow;
use crate::metadata::{EnrichError, MetadataClient};
use crate::mirrors::{LegacyRepository, PublisherMirror};
use crate::pmc::PmcIndex;
use crate::queue::{EntryQueue, stage_needs_run};
use crate::structuring::{StructuringClient, StructuringError};
use crate::thumbnail::generate_thumbnails;

/// Stage toggles for one run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub grobid: bool,
    pub thumbnail: bool,
    pub annotation: bool,
    pub reprocess: bool,
}

/// Live run counters, shared across workers.
#[derive(Debug, Default)]
pub struct Counters {
    pub processed: AtomicUsize,
    pub metadata_ok: AtomicUsize,
    pub metadata_failed: AtomicUsize,
    pub pdf_ok: AtomicUsize,
    pub pdf_failed: AtomicUsize,
    pub jats_ok: AtomicUsize,
    pub tei_ok: AtomicUsize,
    pub tei_failed: AtomicUsize,
}

impl Counters {
    fn line(&self, total: usize) -> String {
        format!(
            "{}/{} entries · metadata {}✓ {}✗ · pdf {}✓ {}✗ · jats {}✓ · tei {}✓ {}✗",
            fmt_num(self.processed.load(Ordering::Relaxed)),
            fmt_num(total),
            self.metadata_ok.load(Ordering::Relaxed),
            self.metadata_failed.load(Ordering::Relaxed),
            self.pdf_ok.load(Ordering::Relaxed),
            self.pdf_failed.load(Ordering::Relaxed),
            self.jats_ok.load(Ordering::Relaxed),
            self.tei_ok.load(Ordering::Relaxed),
            self.tei_failed.load(Ordering::Relaxed),
        )
    }
}

/// Everything a worker needs, threaded explicitly (no process globals).
pub struct HarvestContext {
    pub config: Config,
    pub repository: Repository,
    pub store: StateStore<Entry>,
    pub metadata_client: MetadataClient,
    pub fetcher: Fetcher,
    pub structuring: Option<StructuringClient>,
    pub pmc_index: PmcIndex,
    pub mirror: Option<PublisherMirror>,
    pub legacy: Option<LegacyRepository>,
    pub options: RunOptions,
    pub counters: Counters,
}

impl HarvestContext {
    /// Build the context from configuration: select the repository
    /// backend, open the state store and run crash recovery.
    pub fn initialize(config: Config, options: RunOptions) -> Result<Self> {
        std::fs::create_dir_all(&config.data_path)
            .with_context(|| format!("failed to create {}", config.data_path.display()))?;

        let repository = match config.s3_config() {
            Some(s3) => {
                log::info!("repository backend: s3://{}/{}", s3.bucket, s3.prefix);
                Repository::s3(s3)?
            }
            None => {
                log::info!("repository backend: {}", config.data_path.display());
                Repository::local(&config.data_path)?
            }
        };

        let store = StateStore::open(&config.data_path.join("map.jsonl"))?;
        recover_in_progress(&store)?;

        let pmc_index = PmcIndex::load(&config.pmc_index_path, &config.pmc_base_url)?;
        let mirror = match (&config.cord19_publisher_map_path, &config.cord19_publisher_pdf_path) {
            (Some(map), Some(root)) => Some(PublisherMirror::load(map, root)?),
            _ => None,
        };
        let legacy = config
            .legacy_data_path
            .as_deref()
            .map(LegacyRepository::new);

        let structuring = options.grobid.then(|| StructuringClient::new(&config));

        Ok(Self {
            metadata_client: MetadataClient::new(&config),
            fetcher: Fetcher::new(&config),
            structuring,
            repository,
            store,
            pmc_index,
            mirror,
            legacy,
            options,
            counters: Counters::default(),
            config,
        })
    }

    /// Clear the repository and the state store (`--reset`).
    pub fn reset(&self) -> Result<()> {
        log::warn!("reset: clearing repository and state store");
        self.repository.delete_prefix("")?;
        self.store.truncate()
    }
}

/// Demote crashed `in_progress` stages back to `pending`.
fn recover_in_progress(store: &StateStore<Entry>) -> Result<()> {
    let mut recovered = 0usize;
    for mut entry in store.iter_all() {
        if entry.status.demote_in_progress() {
            store.update(&entry)?;
            recovered += 1;
        }
    }
    if recovered > 0 {
        log::info!("recovery: {recovered} entries demoted from in_progress");
    }
    Ok(())
}

/// Requeue failed entries (`--reprocess`): only the failed stages are
/// reset, with their attempt counters; successful stages stay untouched.
pub fn requeue_failed(store: &StateStore<Entry>) -> Result<usize> {
    let mut requeued = 0usize;
    for mut entry in store.iter_all() {
        if !entry.status.any_failed() {
            continue;
        }
        for stage in crate::entry::STAGES {
            if entry.status.get(stage).is_failed() {
                entry.status.set(stage, StageStatus::Pending);
                entry.attempts.reset(stage);
            }
        }
        store.update(&entry)?;
        requeued += 1;
    }
    log::info!("reprocess: {requeued} failed entries requeued");
    Ok(requeued)
}

/// Outcome of a run.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub processed: usize,
    pub failed_entries: usize,
    pub cancelled: bool,
}

/// Metadata seed taken from an input row, used when no upstream source
/// answers and to carry the CORD-only fields.
fn seed_from_row(row: &InputRow) -> Metadata {
    Metadata {
        title: row.title.clone(),
        authors: row
            .authors
            .as_deref()
            .map(|a| {
                a.split(';')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
        year: row
            .year()
            .map(str::to_string)
            .or_else(|| row.publish_time.clone()),
        license: row.license.clone(),
        abstract_text: row.abstract_text.clone(),
        cord_sha: row.sha.clone(),
        mag_id: row.mag_id.clone(),
        who_covidence: row.who_covidence.clone(),
        arxiv_id: row.arxiv_id.clone(),
        ..Default::default()
    }
}

/// Run the pipeline over the given input rows (plus any resumable entries
/// already in the store).
pub fn run(
    ctx: &HarvestContext,
    rows: &[InputRow],
    progress: &SharedProgress,
) -> Result<RunSummary> {
    // 1. collapse the input into distinct entries; new entries stay
    //    in-memory until the whole input is resolved, so a later richer
    //    row can still take over as the canonical article
    let existing = ctx.store.iter_all();
    let mut resolver = Resolver::from_entries(existing.iter());
    let mut pending: HashMap<String, Entry> = HashMap::new();
    let mut seeds: HashMap<String, Metadata> = HashMap::new();
    let mut input_order: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for row in rows {
        match resolver.resolve(row) {
            Resolution::New { id } => {
                pending.insert(id.clone(), Entry::new(id.clone(), row.identifiers.clone()));
                seeds.insert(id.clone(), seed_from_row(row));
                if seen.insert(id.clone()) {
                    input_order.push(id);
                }
            }
            Resolution::Existing { id } => {
                if let Some(entry) = pending.get_mut(&id) {
                    entry.identifiers.merge(&row.identifiers);
                } else if let Some(mut entry) = ctx.store.get(&id) {
                    let before = entry.identifiers.clone();
                    entry.identifiers.merge(&row.identifiers);
                    if entry.identifiers != before {
                        ctx.store.update(&entry)?;
                    }
                }
                seeds.entry(id.clone()).or_insert_with(|| seed_from_row(row));
                if seen.insert(id.clone()) {
                    input_order.push(id);
                }
            }
            Resolution::Superseded { id, previous } => {
                // the richer row's id is canonical; the earlier same-run
                // entry folds into it and is never persisted
                let mut entry = Entry::new(id.clone(), row.identifiers.clone());
                let mut seed = seed_from_row(row);
                if let Some(folded) = pending.remove(&previous) {
                    entry.identifiers.merge(&folded.identifiers);
                }
                if let Some(folded_seed) = seeds.remove(&previous) {
                    seed.fill_gaps(&folded_seed);
                }
                pending.insert(id.clone(), entry);
                seeds.insert(id.clone(), seed);
                if seen.insert(id.clone()) {
                    input_order.push(id);
                }
            }
        }
    }

    // persist the surviving new entries in input order
    for id in &input_order {
        if let Some(entry) = pending.get(id) {
            ctx.store.update(entry)?;
        }
    }
    let distinct = input_order
        .iter()
        .filter(|id| ctx.store.contains(id))
        .count();
    log::info!(
        "{} input rows resolved to {} distinct entries",
        fmt_num(rows.len()),
        fmt_num(distinct)
    );

    // 2. resumable entries from earlier runs that the input did not cover
    let mut work_ids = input_order;
    for entry in &existing {
        if seen.insert(entry.id.clone()) {
            work_ids.push(entry.id.clone());
        }
    }

    let retry_cap = ctx.config.per_stage_retries;
    let queue = EntryQueue::resumable(work_ids, &ctx.store, &ctx.options, retry_cap);
    let total = queue.len();
    log::info!("{} entries to process", fmt_num(total));

    // 3. bounded worker pool
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(ctx.config.batch_size)
        .build()
        .context("failed to build worker pool")?;

    let counter_bar = progress.counter_line("harvest");
    let seeds = &seeds;
    pool.scope(|scope| {
        for _ in 0..ctx.config.batch_size {
            let queue = &queue;
            let counter_bar = &counter_bar;
            scope.spawn(move |_| {
                while let Some(id) = queue.claim() {
                    if is_shutdown_requested() {
                        break;
                    }
                    let pb = progress.worker_bar(id);
                    if let Err(e) = process_entry(ctx, id, seeds, &pb) {
                        log::error!("{id}: {e:#}");
                    }
                    pb.finish_and_clear();
                    ctx.counters.processed.fetch_add(1, Ordering::Relaxed);
                    counter_bar.set_message(ctx.counters.line(total));
                }
            });
        }
    });
    counter_bar.finish_and_clear();

    // 4. flush: nothing may stay in_progress after a cancelled run
    let cancelled = is_shutdown_requested();
    if cancelled {
        recover_in_progress(&ctx.store)?;
    }

    let failed_entries = ctx
        .store
        .iter_all()
        .iter()
        .filter(|e| e.status.any_failed())
        .count();

    Ok(RunSummary {
        processed: ctx.counters.processed.load(Ordering::Relaxed),
        failed_entries,
        cancelled,
    })
}

/// Drive one entry through all runnable stages, writing durable state
/// transitions around every stage.
fn process_entry(
    ctx: &HarvestContext,
    id: &str,
    seeds: &HashMap<String, Metadata>,
    pb: &ProgressBar,
) -> Result<()> {
    let Some(mut entry) = ctx.store.get(id) else {
        return Ok(());
    };
    let retry_cap = ctx.config.per_stage_retries;

    // === metadata ===
    let mut consolidated: Option<ConsolidatedRecord> = None;
    if stage_needs_run(entry.status.metadata, entry.attempts.metadata, retry_cap) {
        consolidated = run_metadata_stage(ctx, &mut entry, seeds.get(id), pb)?;
        if consolidated.is_none() {
            return Ok(());
        }
    } else if entry.status.metadata.is_success() {
        consolidated = load_consolidated(ctx, &entry)?;
        if consolidated.is_none() {
            // success without its artifact: lost to a crash window, redo
            log::warn!("{id}: metadata artifact missing, re-running enrichment");
            entry.status.set(Stage::Metadata, StageStatus::Pending);
            ctx.store.update(&entry)?;
            consolidated = run_metadata_stage(ctx, &mut entry, seeds.get(id), pb)?;
        }
    }
    let Some(consolidated) = consolidated else {
        return Ok(());
    };
    if is_shutdown_requested() {
        return Ok(());
    }

    // === pdf ===
    if stage_needs_run(entry.status.pdf, entry.attempts.pdf, retry_cap) {
        run_pdf_stage(ctx, &mut entry, &consolidated, pb)?;
    }
    if is_shutdown_requested() {
        return Ok(());
    }

    // === jats (best-effort) ===
    if stage_needs_run(entry.status.jats, entry.attempts.jats, retry_cap) {
        run_jats_stage(ctx, &mut entry, pb)?;
    }
    if is_shutdown_requested() {
        return Ok(());
    }

    // === tei from pdf ===
    if ctx.options.grobid
        && entry.artifacts.pdf
        && stage_needs_run(entry.status.tei_pdf, entry.attempts.tei_pdf, retry_cap)
    {
        run_tei_pdf_stage(ctx, &mut entry, pb)?;
    }

    // === optional side-effects, both non-fatal ===
    if ctx.options.annotation && entry.artifacts.pdf && !entry.artifacts.ref_annotations {
        run_annotations(ctx, &mut entry, pb)?;
    }
    if ctx.options.thumbnail && entry.artifacts.pdf && !entry.artifacts.thumbnails {
        run_thumbnails(ctx, &mut entry, pb)?;
    }

    Ok(())
}

fn load_consolidated(
    ctx: &HarvestContext,
    entry: &Entry,
) -> Result<Option<ConsolidatedRecord>> {
    let path = artifact_path(&entry.id, Artifact::Metadata);
    match ctx.repository.get(&path)? {
        Some(bytes) => Ok(serde_json::from_slice(&bytes).ok()),
        None => Ok(None),
    }
}

fn run_metadata_stage(
    ctx: &HarvestContext,
    entry: &mut Entry,
    seed: Option<&Metadata>,
    pb: &ProgressBar,
) -> Result<Option<ConsolidatedRecord>> {
    entry.status.set(Stage::Metadata, StageStatus::InProgress);
    entry.attempts.bump(Stage::Metadata);
    ctx.store.update(entry)?;

    let default_seed = Metadata::default();
    let seed = seed.unwrap_or(&default_seed);
    let result = ctx.metadata_client.enrich(
        &entry.identifiers,
        seed,
        &ctx.pmc_index,
        ctx.mirror.as_ref(),
        pb,
    );

    match result {
        Ok(enriched) => {
            entry.identifiers.merge(&enriched.identifiers);
            let record = ConsolidatedRecord {
                id: entry.id.clone(),
                identifiers: entry.identifiers.clone(),
                metadata: enriched.metadata,
                candidate_urls: enriched.candidates,
                harvested_at: Some(chrono::Utc::now()),
            };
            let bytes = serde_json::to_vec_pretty(&record)?;
            ctx.repository
                .put(&artifact_path(&entry.id, Artifact::Metadata), &bytes)?;

            entry.has_oa_url = !record.candidate_urls.is_empty();
            entry.status.set(Stage::Metadata, StageStatus::success());
            ctx.store.update(entry)?;
            ctx.counters.metadata_ok.fetch_add(1, Ordering::Relaxed);
            Ok(Some(record))
        }
        Err(e) => {
            let reason = match &e {
                EnrichError::Unresolved => FailureReason::Unresolved,
                EnrichError::Http(h) => match h {
                    oaharvest_core::HttpError::Timeout { .. } => FailureReason::Timeout,
                    _ => FailureReason::HttpError,
                },
            };
            log::debug!("{}: metadata failed: {e}", entry.id);
            entry
                .status
                .set(Stage::Metadata, StageStatus::Failed { reason });
            ctx.store.update(entry)?;
            ctx.counters.metadata_failed.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }
}

fn run_pdf_stage(
    ctx: &HarvestContext,
    entry: &mut Entry,
    consolidated: &ConsolidatedRecord,
    pb: &ProgressBar,
) -> Result<()> {
    entry.status.set(Stage::Pdf, StageStatus::InProgress);
    entry.attempts.bump(Stage::Pdf);
    ctx.store.update(entry)?;

    // a prior-run repository can satisfy the stage without any network
    if let Some(legacy) = &ctx.legacy
        && let Some(path) = legacy.artifact(&entry.id, Artifact::Pdf)
        && let Ok(bytes) = std::fs::read(&path)
        && validate_pdf(None, &bytes, ctx.config.min_pdf_bytes, ctx.config.max_pdf_bytes).is_ok()
    {
        log::debug!("{}: pdf reused from legacy repository", entry.id);
        return finish_pdf_success(ctx, entry, &bytes, UrlSource::Legacy);
    }

    if consolidated.candidate_urls.is_empty() {
        entry.status.set(
            Stage::Pdf,
            StageStatus::Failed {
                reason: FailureReason::NoOaUrl,
            },
        );
        ctx.store.update(entry)?;
        ctx.counters.pdf_failed.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    let result = retry_with_backoff(
        &format!("{}/pdf", entry.id),
        ctx.config.per_stage_retries,
        ctx.config.max_backoff(),
        pb,
        || ctx.fetcher.fetch_pdf(&consolidated.candidate_urls, pb),
    );

    match result {
        Ok((bytes, source)) => finish_pdf_success(ctx, entry, &bytes, source),
        Err(failure) => {
            log::debug!("{}: pdf failed: {failure}", entry.id);
            entry.status.set(
                Stage::Pdf,
                StageStatus::Failed {
                    reason: failure.reason(),
                },
            );
            ctx.store.update(entry)?;
            ctx.counters.pdf_failed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }
}

fn finish_pdf_success(
    ctx: &HarvestContext,
    entry: &mut Entry,
    bytes: &[u8],
    source: UrlSource,
) -> Result<()> {
    ctx.repository
        .put(&artifact_path(&entry.id, Artifact::Pdf), bytes)?;
    entry.artifacts.pdf = true;
    entry.status.set(Stage::Pdf, StageStatus::success());
    ctx.store.update(entry)?;
    ctx.counters.pdf_ok.fetch_add(1, Ordering::Relaxed);
    log::debug!("{}: pdf stored ({source:?}, {} bytes)", entry.id, bytes.len());
    Ok(())
}

fn run_jats_stage(ctx: &HarvestContext, entry: &mut Entry, pb: &ProgressBar) -> Result<()> {
    let pmcid = entry.identifiers.pmcid.clone();
    let available = pmcid
        .as_deref()
        .is_some_and(|p| ctx.pmc_index.contains(p));

    if !available {
        // absence is not a failure, there is simply nothing to fetch
        entry.status.set(Stage::Jats, StageStatus::success());
        ctx.store.update(entry)?;
        return Ok(());
    }
    let pmcid = pmcid.expect("available implies pmcid");

    entry.status.set(Stage::Jats, StageStatus::InProgress);
    entry.attempts.bump(Stage::Jats);
    ctx.store.update(entry)?;

    let result = retry_with_backoff(
        &format!("{}/jats", entry.id),
        ctx.config.per_stage_retries,
        ctx.config.max_backoff(),
        pb,
        || ctx.fetcher.fetch_jats(&pmcid, &ctx.pmc_index, pb),
    );

    match result {
        Ok(bundle) => {
            ctx.repository
                .put(&artifact_path(&entry.id, Artifact::Jats), &bundle.nxml)?;
            entry.artifacts.jats = true;
            entry.status.set(Stage::Jats, StageStatus::success());
            ctx.counters.jats_ok.fetch_add(1, Ordering::Relaxed);

            // the archive often carries the PDF the download stage missed
            if !entry.artifacts.pdf
                && let Some(pdf) = bundle.pdf
                && validate_pdf(None, &pdf, ctx.config.min_pdf_bytes, ctx.config.max_pdf_bytes)
                    .is_ok()
            {
                ctx.repository
                    .put(&artifact_path(&entry.id, Artifact::Pdf), &pdf)?;
                entry.artifacts.pdf = true;
                entry.status.set(Stage::Pdf, StageStatus::success());
                ctx.counters.pdf_ok.fetch_add(1, Ordering::Relaxed);
                log::debug!("{}: pdf recovered from OA archive", entry.id);
            }
            ctx.store.update(entry)?;
        }
        Err(failure) => {
            log::debug!("{}: jats failed: {failure}", entry.id);
            entry.status.set(
                Stage::Jats,
                StageStatus::Failed {
                    reason: failure.reason(),
                },
            );
            ctx.store.update(entry)?;
        }
    }
    Ok(())
}

fn run_tei_pdf_stage(ctx: &HarvestContext, entry: &mut Entry, pb: &ProgressBar) -> Result<()> {
    let Some(structuring) = &ctx.structuring else {
        return Ok(());
    };
    let Some(pdf) = ctx
        .repository
        .get(&artifact_path(&entry.id, Artifact::Pdf))?
    else {
        log::warn!("{}: pdf flagged but artifact missing", entry.id);
        return Ok(());
    };

    entry.status.set(Stage::TeiPdf, StageStatus::InProgress);
    entry.attempts.bump(Stage::TeiPdf);
    ctx.store.update(entry)?;
    pb.set_message("structuring pdf...");

    let result = retry_with_backoff(
        &format!("{}/tei_pdf", entry.id),
        ctx.config.per_stage_retries,
        ctx.config.max_backoff(),
        pb,
        || structuring.pdf_to_tei(&pdf, ctx.options.annotation),
    );

    match result {
        Ok(tei) => {
            ctx.repository
                .put(&artifact_path(&entry.id, Artifact::TeiFromPdf), &tei.tei)?;
            entry.artifacts.tei_from_pdf = true;
            entry.status.set(
                Stage::TeiPdf,
                StageStatus::Success {
                    has_warnings: tei.has_warnings,
                },
            );
            ctx.store.update(entry)?;
            ctx.counters.tei_ok.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            let reason = match &e {
                StructuringError::Http(oaharvest_core::HttpError::Timeout { .. }) => {
                    FailureReason::Timeout
                }
                StructuringError::Http(_) => FailureReason::HttpError,
                StructuringError::Failed { .. } => FailureReason::StructuringFailed,
            };
            log::debug!("{}: structuring failed: {e}", entry.id);
            entry
                .status
                .set(Stage::TeiPdf, StageStatus::Failed { reason });
            ctx.store.update(entry)?;
            ctx.counters.tei_failed.fetch_add(1, Ordering::Relaxed);
        }
    }
    Ok(())
}

/// Reference annotations from the structuring service; failure only logs.
fn run_annotations(ctx: &HarvestContext, entry: &mut Entry, pb: &ProgressBar) -> Result<()> {
    let Some(structuring) = &ctx.structuring else {
        return Ok(());
    };
    let Some(pdf) = ctx
        .repository
        .get(&artifact_path(&entry.id, Artifact::Pdf))?
    else {
        return Ok(());
    };

    pb.set_message("reference annotations...");
    match structuring.reference_annotations(&pdf) {
        Ok(annotations) => {
            ctx.repository.put(
                &artifact_path(&entry.id, Artifact::RefAnnotations),
                &annotations,
            )?;
            entry.artifacts.ref_annotations = true;
            ctx.store.update(entry)?;
        }
        Err(e) => log::warn!("{}: reference annotations failed: {e}", entry.id),
    }
    Ok(())
}

/// Thumbnail rendering; failure only logs.
fn run_thumbnails(ctx: &HarvestContext, entry: &mut Entry, pb: &ProgressBar) -> Result<()> {
    let Some(pdf) = ctx
        .repository
        .get(&artifact_path(&entry.id, Artifact::Pdf))?
    else {
        return Ok(());
    };

    pb.set_message("thumbnails...");
    let work_dir = ctx.config.data_path.join("tmp");
    std::fs::create_dir_all(&work_dir)?;
    let pdf_path = work_dir.join(format!("{}.pdf", entry.id));
    std::fs::write(&pdf_path, &pdf)?;

    let outcome = generate_thumbnails(&pdf_path, ctx.config.thumbnail_timeout());
    match outcome {
        Ok(rendered) => {
            for (artifact, local_path) in &rendered {
                let bytes = std::fs::read(local_path)?;
                ctx.repository
                    .put(&artifact_path(&entry.id, *artifact), &bytes)?;
            }
            entry.artifacts.thumbnails = true;
            ctx.store.update(entry)?;
            for (_, local_path) in rendered {
                let _ = std::fs::remove_file(local_path);
            }
        }
        Err(e) => log::warn!("{}: thumbnails failed: {e}", entry.id),
    }
    let _ = std::fs::remove_file(&pdf_path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::Identifiers;
    use oaharvest_core::ProgressContext;
    use std::sync::Arc;

    fn offline_context(dir: &std::path::Path) -> HarvestContext {
        let config = Config {
            data_path: dir.to_path_buf(),
            batch_size: 2,
            per_stage_retries: 2,
            max_backoff_secs: 1,
            ..Default::default()
        };
        HarvestContext::initialize(config, RunOptions::default()).unwrap()
    }

    fn cord_row(cord_id: &str, title: &str) -> InputRow {
        InputRow {
            identifiers: Identifiers {
                cord_id: Some(cord_id.to_string()),
                ..Default::default()
            },
            title: Some(title.to_string()),
            publish_time: Some("2020-04-01".into()),
            from_cord19: true,
            ..Default::default()
        }
    }

    #[test]
    fn seed_from_row_splits_authors() {
        let row = InputRow {
            authors: Some("Müller, Anna; Smith, Bob;".into()),
            publish_time: Some("2020-05-01".into()),
            ..Default::default()
        };
        let seed = seed_from_row(&row);
        assert_eq!(seed.authors, vec!["Müller, Anna", "Smith, Bob"]);
        assert_eq!(seed.year.as_deref(), Some("2020"));
    }

    #[test]
    fn offline_run_duplicate_cord_rows_single_entry() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(dir.path());
        let progress: SharedProgress = Arc::new(ProgressContext::new());

        // the same row twice: one entry, one metadata attempt
        let rows = vec![
            cord_row("fq4xq00d", "A duplicated entry"),
            cord_row("fq4xq00d", "A duplicated entry"),
        ];
        let summary = run(&ctx, &rows, &progress).unwrap();

        assert_eq!(summary.processed, 1);
        assert_eq!(ctx.store.len(), 1);
        let entry = ctx.store.get("fq4xq00d").unwrap();
        assert_eq!(entry.attempts.metadata, 1);
        // no sources configured: metadata succeeds from the row seed,
        // no candidate URL exists, pdf is terminally failed
        assert!(entry.status.metadata.is_success());
        assert_eq!(
            entry.status.pdf.failure_reason(),
            Some(FailureReason::NoOaUrl)
        );
        assert!(entry.status.jats.is_success());
        assert!(!entry.has_oa_url);

        // the consolidated metadata artifact is in place
        let repo_path = artifact_path("fq4xq00d", Artifact::Metadata);
        assert!(ctx.repository.has(&repo_path).unwrap());
    }

    #[test]
    fn rerun_without_reset_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(dir.path());
        let progress: SharedProgress = Arc::new(ProgressContext::new());
        let rows = vec![cord_row("ab12cd34", "Idempotent entry")];

        run(&ctx, &rows, &progress).unwrap();
        let first = ctx.store.get("ab12cd34").unwrap();

        let summary = run(&ctx, &rows, &progress).unwrap();
        assert_eq!(summary.processed, 0, "nothing should be re-executed");
        assert_eq!(ctx.store.get("ab12cd34").unwrap(), first);
    }

    #[test]
    fn reprocess_resets_only_failed_stages() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(dir.path());
        let progress: SharedProgress = Arc::new(ProgressContext::new());
        run(&ctx, &[cord_row("zz00yy11", "Reprocessed entry")], &progress).unwrap();

        let requeued = requeue_failed(&ctx.store).unwrap();
        assert_eq!(requeued, 1);
        let entry = ctx.store.get("zz00yy11").unwrap();
        assert_eq!(entry.status.pdf, StageStatus::Pending);
        assert_eq!(entry.attempts.pdf, 0);
        // the successful metadata stage was left alone
        assert!(entry.status.metadata.is_success());
        assert_eq!(entry.attempts.metadata, 1);

        run(&ctx, &[], &progress).unwrap();
        let entry = ctx.store.get("zz00yy11").unwrap();
        assert_eq!(
            entry.status.pdf.failure_reason(),
            Some(FailureReason::NoOaUrl)
        );
        assert_eq!(entry.attempts.pdf, 1);
    }

    #[test]
    fn recovery_demotes_in_progress() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ctx = offline_context(dir.path());
            let mut entry = Entry::new("crashcrash".into(), Identifiers::default());
            entry.status.metadata = StageStatus::InProgress;
            ctx.store.update(&entry).unwrap();
        }
        // re-initializing runs recovery
        let ctx = offline_context(dir.path());
        let entry = ctx.store.get("crashcrash").unwrap();
        assert_eq!(entry.status.metadata, StageStatus::Pending);
    }

    #[test]
    fn richer_row_takes_over_weak_key_merge() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(dir.path());
        let progress: SharedProgress = Arc::new(ProgressContext::new());

        // first row has only a title key; the second carries the same
        // title key plus a PMC id and a cord id
        let poor = InputRow {
            title: Some("A Merged Article".into()),
            authors: Some("Lee, Kim".into()),
            publish_time: Some("2021-01-01".into()),
            ..Default::default()
        };
        let rich = InputRow {
            identifiers: Identifiers {
                cord_id: Some("dd44ee55".into()),
                pmcid: Some("PMC7266364".into()),
                ..Default::default()
            },
            title: Some("A Merged Article".into()),
            authors: Some("Lee, Kim".into()),
            publish_time: Some("2021-01-01".into()),
            from_cord19: true,
            ..Default::default()
        };

        run(&ctx, &[poor, rich], &progress).unwrap();

        // one entry survives, under the richer row's id, carrying the
        // merged identifiers; the folded title-only entry was never
        // persisted
        assert_eq!(ctx.store.len(), 1);
        let entry = ctx.store.get("dd44ee55").unwrap();
        assert_eq!(entry.identifiers.pmcid.as_deref(), Some("PMC7266364"));
        assert_eq!(entry.attempts.metadata, 1);
    }

    #[test]
    fn new_rows_only_touch_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = offline_context(dir.path());
        let progress: SharedProgress = Arc::new(ProgressContext::new());
        run(&ctx, &[cord_row("aaaa1111", "First release")], &progress).unwrap();
        let before = ctx.store.get("aaaa1111").unwrap();

        // second release adds one row
        let rows = vec![
            cord_row("aaaa1111", "First release"),
            cord_row("bbbb2222", "Second release addition"),
        ];
        let summary = run(&ctx, &rows, &progress).unwrap();
        assert_eq!(summary.processed, 1);
        assert_eq!(ctx.store.len(), 2);
        assert_eq!(ctx.store.get("aaaa1111").unwrap(), before);
        assert!(ctx.store.get("bbbb2222").is_some());
    }
}
