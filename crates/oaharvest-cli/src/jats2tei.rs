//! oaharvest-jats2tei - batch JATS→TEI reverse pass.
//!
//! Separate entry point revisiting every harvested entry that has a JATS
//! file but no TEI produced from it, and converting them in batch with the
//! configured XSLT transformer.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;

use oaharvest_core::{ProgressContext, init_logging, install_signal_handlers};
use oaharvest_pipeline::config::Config;
use oaharvest_pipeline::jats_transform::JatsTransformer;
use oaharvest_pipeline::orchestrator::{HarvestContext, RunOptions};
use oaharvest_pipeline::reverse;

#[derive(Parser)]
#[command(name = "oaharvest-jats2tei")]
#[command(about = "Convert harvested JATS files into TEI XML in batch")]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(long, value_name = "FILE", default_value = "./config.json")]
    config: PathBuf,

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
            return ExitCode::from(2);
        }
    };

    let Some(transformer_path) = config.jats_transformer_path.clone() else {
        log::error!("jats_transformer_path is not set in the configuration");
        return ExitCode::from(2);
    };
    let transformer =
        JatsTransformer::new(&transformer_path, config.batch_transform_timeout());
    let work_dir = config.data_path.join("tmp");

    let ctx = match HarvestContext::initialize(config, RunOptions::default()) {
        Ok(ctx) => ctx,
        Err(e) => {
            log::error!("startup failed: {e:#}");
            return ExitCode::from(2);
        }
    };

    match reverse::run(&ctx.repository, &ctx.store, &transformer, &work_dir, &progress) {
        Ok(summary) => {
            progress.println(format!(
                "{} pending, {} converted, {} failed",
                summary.pending, summary.converted, summary.failed
            ));
            if summary.cancelled {
                return ExitCode::from(130);
            }
            if summary.failed > 0 {
                return ExitCode::from(4);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            log::error!("reverse pass failed: {e:#}");
            ExitCode::from(4)
        }
    }
}
