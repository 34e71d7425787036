//! Durable entry state: append-only `map.jsonl` plus in-memory index.
//!
//! Every update appends a full record and fsyncs before returning, so a
//! crash loses at most the stage that was in flight. A record for an id
//! already in the index makes the previous line dead; when dead lines
//! outgrow the live ones the file is compacted by atomic rewrite.

use std::collections::HashMap;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Minimum number of dead records before compaction is considered.
const COMPACT_MIN_DEAD: usize = 1024;

/// A record persistable in the state store.
pub trait StateRecord: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn id(&self) -> &str;
}

struct Writer {
    file: fs::File,
    dead: usize,
}

/// Append-only JSONL store with an in-memory `id → record` index.
///
/// Single writer behind a mutex; readers go through the index without
/// touching the file.
pub struct StateStore<R> {
    path: PathBuf,
    writer: Mutex<Writer>,
    index: RwLock<HashMap<String, R>>,
}

impl<R: StateRecord> StateStore<R> {
    /// Open (or create) the store, building the index by sequential scan.
    pub fn open(path: &Path) -> Result<Self> {
        let mut index: HashMap<String, R> = HashMap::new();
        let mut dead = 0usize;

        if path.exists() {
            let reader = BufReader::new(
                fs::File::open(path)
                    .with_context(|| format!("failed to open {}", path.display()))?,
            );
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<R>(&line) {
                    Ok(record) => {
                        if index.insert(record.id().to_string(), record).is_some() {
                            dead += 1;
                        }
                    }
                    Err(e) => {
                        // a torn final line after a crash is expected; anything
                        // else still only costs us that one record
                        log::warn!(
                            "{}:{}: skipping unreadable record: {e}",
                            path.display(),
                            line_no + 1
                        );
                        dead += 1;
                    }
                }
            }
        }

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {} for append", path.display()))?;

        log::debug!(
            "state store {}: {} live, {} dead records",
            path.display(),
            index.len(),
            dead
        );

        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(Writer { file, dead }),
            index: RwLock::new(index),
        })
    }

    pub fn get(&self, id: &str) -> Option<R> {
        self.index.read().unwrap().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.read().unwrap().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.index.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Durably record a new version of `record`.
    ///
    /// The line is appended and fsynced before the index is updated, so a
    /// reader never observes state the disk does not hold.
    pub fn update(&self, record: &R) -> Result<()> {
        let line = serde_json::to_string(record).context("failed to serialize state record")?;
        let mut needs_compaction = false;
        {
            let mut writer = self.writer.lock().unwrap();
            writer.file.write_all(line.as_bytes())?;
            writer.file.write_all(b"\n")?;
            writer.file.sync_data()?;

            let replaced = self
                .index
                .write()
                .unwrap()
                .insert(record.id().to_string(), record.clone())
                .is_some();
            if replaced {
                writer.dead += 1;
            }
            let live = self.index.read().unwrap().len();
            if writer.dead >= COMPACT_MIN_DEAD && writer.dead > live {
                needs_compaction = true;
            }
        }
        if needs_compaction {
            self.compact()?;
        }
        Ok(())
    }

    /// All live records. Records are small (the full metadata lives in the
    /// per-entry artifact, not here), so a snapshot is cheap even for
    /// corpus-scale stores.
    pub fn iter_all(&self) -> Vec<R> {
        self.index.read().unwrap().values().cloned().collect()
    }

    /// Rewrite the file with only live records (atomic rename).
    pub fn compact(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        let tmp = self.path.with_extension("jsonl.tmp");
        {
            let mut out = fs::File::create(&tmp)
                .with_context(|| format!("failed to create {}", tmp.display()))?;
            let index = self.index.read().unwrap();
            for record in index.values() {
                let line = serde_json::to_string(record)?;
                out.write_all(line.as_bytes())?;
                out.write_all(b"\n")?;
            }
            out.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;

        writer.file = fs::OpenOptions::new().append(true).open(&self.path)?;
        log::info!(
            "compacted {}: {} records retained, {} dead dropped",
            self.path.display(),
            self.index.read().unwrap().len(),
            writer.dead
        );
        writer.dead = 0;
        Ok(())
    }

    /// Drop every record and truncate the file (used by `--reset`).
    pub fn truncate(&self) -> Result<()> {
        let mut writer = self.writer.lock().unwrap();
        self.index.write().unwrap().clear();
        writer.file = fs::File::create(&self.path)
            .with_context(|| format!("failed to truncate {}", self.path.display()))?;
        writer.dead = 0;
        Ok(())
    }
}
