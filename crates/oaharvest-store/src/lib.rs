//! oaharvest store - artifact repository and entry state persistence
//!
//! Two concerns live here: the content-addressed artifact repository
//! (local filesystem or S3 object store behind one narrow interface) and
//! the durable per-entry state store (`map.jsonl` + in-memory index).

pub mod layout;
pub mod repository;
pub mod state;

pub use layout::{Artifact, artifact_path, entry_dir, storage_prefix};
pub use repository::{LocalRepository, Repository, S3Config, S3Repository};
pub use state::{StateRecord, StateStore};
