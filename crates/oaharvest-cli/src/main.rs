//! oaharvest - Open Access scholarly article harvester.
//!
//! Takes a set of article identifiers (DOI, PMID, PMC ID or a CORD-19
//! metadata CSV), consolidates bibliographic metadata, downloads the OA
//! PDF and publisher JATS file where available, and optionally structures
//! them into TEI XML.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use oaharvest_core::{ProgressContext, init_logging, install_signal_handlers};
use oaharvest_pipeline::config::Config;
use oaharvest_pipeline::diagnostic::{Report, dump_metadata};
use oaharvest_pipeline::input::{self, InputRow};
use oaharvest_pipeline::orchestrator::{self, HarvestContext, RunOptions};

const EXIT_CONFIG: u8 = 2;
const EXIT_INPUT: u8 = 3;
const EXIT_PARTIAL: u8 = 4;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "oaharvest")]
#[command(about = "Harvester and TEI ingestion pipeline for scholarly articles")]
#[command(version)]
struct Cli {
    /// Input: list of DOIs, one per line
    #[arg(long, value_name = "FILE", group = "input")]
    dois: Option<PathBuf>,

    /// Input: list of PMIDs, one per line
    #[arg(long, value_name = "FILE", group = "input")]
    pmids: Option<PathBuf>,

    /// Input: list of PMC IDs, one per line
    #[arg(long, value_name = "FILE", group = "input")]
    pmcids: Option<PathBuf>,

    /// Input: CORD-19 metadata CSV
    #[arg(long, value_name = "FILE", group = "input")]
    cord19: Option<PathBuf>,

    /// Configuration file
    #[arg(long, value_name = "FILE", default_value = "./config.json")]
    config: PathBuf,

    /// Clear repository and state store before starting
    #[arg(long)]
    reset: bool,

    /// Re-run only entries currently in failed state
    #[arg(long)]
    reprocess: bool,

    /// Structure downloaded PDFs into TEI XML
    #[arg(long)]
    grobid: bool,

    /// Generate front-page thumbnails for harvested PDFs
    #[arg(long)]
    thumbnail: bool,

    /// Request reference annotations with coordinates
    #[arg(long)]
    annotation: bool,

    /// Run the completeness reporter only
    #[arg(long)]
    diagnostic: bool,

    /// Write all consolidated metadata to consolidated_metadata.json
    #[arg(long)]
    dump: bool,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let progress = Arc::new(ProgressContext::new());
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = if is_tty { !cli.debug } else { false };
    init_logging(quiet, cli.debug, multi);

    install_signal_handlers();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let options = RunOptions {
        grobid: cli.grobid,
        thumbnail: cli.thumbnail,
        annotation: cli.annotation,
        reprocess: cli.reprocess,
    };

    let ctx = match HarvestContext::initialize(config, options) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("startup failed: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    if cli.reset {
        if let Err(e) = ctx.reset() {
            log::error!("reset failed: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
    }

    // reporter-only mode
    if cli.diagnostic {
        let report = Report::from_store(&ctx.store);
        progress.println(report.render_table());
        progress.println(report.to_json().to_string());
        if cli.dump {
            return run_dump(&ctx);
        }
        return ExitCode::SUCCESS;
    }

    // dump-only mode
    if cli.dump && !has_input(&cli) && !cli.reprocess {
        return run_dump(&ctx);
    }

    let rows = if cli.reprocess {
        if let Err(e) = orchestrator::requeue_failed(&ctx.store) {
            log::error!("reprocess requeue failed: {e:#}");
            return ExitCode::from(EXIT_CONFIG);
        }
        Vec::new()
    } else {
        match read_input(&cli) {
            Ok(Some(rows)) => rows,
            Ok(None) => {
                log::error!(
                    "no input given: use --dois, --pmids, --pmcids, --cord19, \
                     --reprocess, --diagnostic or --dump"
                );
                return ExitCode::from(EXIT_INPUT);
            }
            Err(e) => {
                log::error!("input error: {e:#}");
                return ExitCode::from(EXIT_INPUT);
            }
        }
    };

    let summary = match orchestrator::run(&ctx, &rows, &progress) {
        Ok(summary) => summary,
        Err(e) => {
            log::error!("run failed: {e:#}");
            return ExitCode::from(EXIT_PARTIAL);
        }
    };

    // final summary, identical to --diagnostic
    let report = Report::from_store(&ctx.store);
    progress.println(report.render_table());
    progress.println(report.to_json().to_string());

    if cli.dump {
        let code = run_dump(&ctx);
        if code != ExitCode::SUCCESS {
            return code;
        }
    }

    if summary.cancelled {
        log::warn!("cancelled after {} entries", summary.processed);
        return ExitCode::from(EXIT_CANCELLED);
    }
    if summary.failed_entries > 0 {
        log::warn!("{} entries ended in failed state", summary.failed_entries);
        return ExitCode::from(EXIT_PARTIAL);
    }
    ExitCode::SUCCESS
}

fn has_input(cli: &Cli) -> bool {
    cli.dois.is_some() || cli.pmids.is_some() || cli.pmcids.is_some() || cli.cord19.is_some()
}

fn read_input(cli: &Cli) -> anyhow::Result<Option<Vec<InputRow>>> {
    if let Some(path) = &cli.dois {
        return Ok(Some(input::read_id_file(path, InputRow::from_doi)?));
    }
    if let Some(path) = &cli.pmids {
        return Ok(Some(input::read_id_file(path, InputRow::from_pmid)?));
    }
    if let Some(path) = &cli.pmcids {
        return Ok(Some(input::read_id_file(path, InputRow::from_pmcid)?));
    }
    if let Some(path) = &cli.cord19 {
        return Ok(Some(input::read_cord19(path)?));
    }
    Ok(None)
}

fn run_dump(ctx: &HarvestContext) -> ExitCode {
    let out = PathBuf::from("consolidated_metadata.json");
    match dump_metadata(&ctx.store, &ctx.repository, &out) {
        Ok(written) => {
            log::info!("wrote {written} metadata records to {}", out.display());
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("metadata dump failed: {e:#}");
            ExitCode::from(EXIT_PARTIAL)
        }
    }
}
