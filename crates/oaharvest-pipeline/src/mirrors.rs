//! Local PDF mirrors consulted before any network fetch.
//!
//! Two sources: the publisher-provided Open Access PDF set for CORD-19
//! (Elsevier ftp dump, addressed through a gzipped doi/pii→file CSV) and a
//! legacy repository from earlier harvesting runs laid out like ours.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;

use oaharvest_store::{Artifact, artifact_path};

/// doi/pii → local PDF file map for the publisher mirror.
pub struct PublisherMirror {
    pdf_root: PathBuf,
    map: HashMap<String, String>,
}

impl PublisherMirror {
    /// Load the gzipped CSV map (`doi,pii,pdf` columns). Both the DOI
    /// (lowercased) and the PII key the same file.
    pub fn load(map_path: &Path, pdf_root: &Path) -> Result<Self> {
        let file = std::fs::File::open(map_path)
            .with_context(|| format!("failed to open publisher map {}", map_path.display()))?;
        let mut reader = csv::Reader::from_reader(GzDecoder::new(file));

        let headers = reader.headers()?.clone();
        let columns = crate::input::ColumnMap::from_headers(&headers);

        let mut map = HashMap::new();
        for record in reader.records() {
            let record = match record {
                Ok(r) => r,
                Err(e) => {
                    log::warn!("publisher map: skipping malformed row: {e}");
                    continue;
                }
            };
            let Some(pdf) = columns.get(&record, "pdf") else {
                continue;
            };
            if let Some(doi) = columns.get(&record, "doi") {
                map.insert(doi.to_lowercase(), pdf.to_string());
            }
            if let Some(pii) = columns.get(&record, "pii") {
                map.insert(pii.to_string(), pdf.to_string());
            }
        }

        log::info!("publisher mirror: {} keys", map.len());
        Ok(Self {
            pdf_root: pdf_root.to_path_buf(),
            map,
        })
    }

    /// Path of the mirrored PDF for a doi or pii, when both the mapping
    /// and the file exist.
    pub fn lookup(&self, doi: Option<&str>, pii: Option<&str>) -> Option<PathBuf> {
        let file = doi
            .and_then(|d| self.map.get(&d.to_lowercase()))
            .or_else(|| pii.and_then(|p| self.map.get(p)))?;
        let path = self.pdf_root.join(file);
        path.is_file().then_some(path)
    }

    #[cfg(test)]
    fn from_pairs(pdf_root: &Path, pairs: &[(&str, &str)]) -> Self {
        Self {
            pdf_root: pdf_root.to_path_buf(),
            map: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

/// A prior-run repository probed for already-downloaded artifacts.
pub struct LegacyRepository {
    root: PathBuf,
}

impl LegacyRepository {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Path of a non-empty artifact file for the entry id, if archived.
    pub fn artifact(&self, id: &str, artifact: Artifact) -> Option<PathBuf> {
        let path = self.root.join(artifact_path(id, artifact));
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    fn write_gz_map(path: &Path, content: &str) {
        let file = std::fs::File::create(path).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn load_gzipped_map_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let map_path = dir.path().join("map.csv.gz");
        write_gz_map(
            &map_path,
            "doi,pii,pdf\n10.1016/J.IJID.2020.01.009,S1201971220300114,art1.pdf\n",
        );
        std::fs::write(dir.path().join("art1.pdf"), b"%PDF-").unwrap();

        let mirror = PublisherMirror::load(&map_path, dir.path()).unwrap();
        // doi lookup is case-insensitive
        assert!(
            mirror
                .lookup(Some("10.1016/j.ijid.2020.01.009"), None)
                .is_some()
        );
        assert!(mirror.lookup(None, Some("S1201971220300114")).is_some());
        assert!(mirror.lookup(Some("10.9999/other"), None).is_none());
    }

    #[test]
    fn lookup_requires_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mirror = PublisherMirror::from_pairs(dir.path(), &[("10.1/x", "gone.pdf")]);
        assert!(mirror.lookup(Some("10.1/x"), None).is_none());
    }

    #[test]
    fn legacy_repository_probe() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = LegacyRepository::new(dir.path());
        assert!(legacy.artifact("fq4xq00d", Artifact::Pdf).is_none());

        let rel = artifact_path("fq4xq00d", Artifact::Pdf);
        let full = dir.path().join(&rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, b"%PDF-1.4").unwrap();
        assert_eq!(legacy.artifact("fq4xq00d", Artifact::Pdf), Some(full));
    }

    #[test]
    fn legacy_empty_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let legacy = LegacyRepository::new(dir.path());
        let rel = artifact_path("fq4xq00d", Artifact::Jats);
        let full = dir.path().join(&rel);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(&full, b"").unwrap();
        assert!(legacy.artifact("fq4xq00d", Artifact::Jats).is_none());
    }
}
