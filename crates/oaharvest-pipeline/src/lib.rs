//! oaharvest pipeline - harvesting and ingestion of scholarly articles
//!
//! Drives each article entry through metadata enrichment, Open Access PDF
//! and JATS discovery/download, and TEI structuring, with durable per-entry
//! state and full resume support.

pub mod config;
pub mod dedup;
pub mod diagnostic;
pub mod entry;
pub mod fetch;
pub mod ids;
pub mod input;
pub mod jats_transform;
pub mod metadata;
pub mod mirrors;
pub mod orchestrator;
pub mod pmc;
pub mod proc;
pub mod queue;
pub mod reverse;
pub mod structuring;
pub mod thumbnail;

pub use config::Config;
pub use entry::{Entry, FailureReason, Identifiers, Stage, StageStatus};
pub use orchestrator::{HarvestContext, RunOptions, RunSummary};
