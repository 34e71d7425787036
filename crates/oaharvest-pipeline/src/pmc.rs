//! PMC Open Access archive index.
//!
//! `oa_file_list.txt` is the NIH-published tab-separated listing of every
//! OA article: archive subpath, citation, PMCID, PMID, license. We load it
//! once into memory; the lookup resolves a PMCID to the archive URL that
//! holds the article's JATS file (and usually the PDF).

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct PmcLocation {
    pub subpath: String,
    pub license: String,
}

/// PMCID → archive location map.
pub struct PmcIndex {
    base_url: String,
    map: HashMap<String, PmcLocation>,
}

impl PmcIndex {
    /// Load the index file. A missing file yields an empty index (the
    /// index is an optional acceleration, not a requirement).
    pub fn load(path: &Path, base_url: &str) -> Result<Self> {
        let mut index = Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            map: HashMap::new(),
        };

        if !path.is_file() {
            log::warn!(
                "PMC OA index {} not found; JATS retrieval disabled",
                path.display()
            );
            return Ok(index);
        }

        let reader = BufReader::new(
            std::fs::File::open(path)
                .with_context(|| format!("failed to open PMC index {}", path.display()))?,
        );
        for (line_no, line) in reader.lines().enumerate() {
            // first line is a timestamp
            if line_no == 0 {
                continue;
            }
            let line = line?;
            index.insert_line(&line);
        }

        log::info!("PMC OA index: {} articles", index.map.len());
        Ok(index)
    }

    fn insert_line(&mut self, line: &str) {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 3 {
            return;
        }
        let subpath = fields[0].trim();
        let pmcid = fields[2].trim();
        if subpath.is_empty() || pmcid.is_empty() {
            return;
        }
        let license = fields.get(4).map(|l| l.trim().replace('\n', "")).unwrap_or_default();
        self.map.insert(
            pmcid.to_string(),
            PmcLocation {
                subpath: subpath.to_string(),
                license,
            },
        );
    }

    pub fn contains(&self, pmcid: &str) -> bool {
        self.map.contains_key(pmcid)
    }

    /// Archive URL and license for a PMCID, when listed.
    pub fn archive_url(&self, pmcid: &str) -> Option<(String, String)> {
        let location = self.map.get(pmcid)?;
        Some((
            format!("{}/{}", self.base_url, location.subpath),
            location.license.clone(),
        ))
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[cfg(test)]
    pub fn from_lines(base_url: &str, lines: &[&str]) -> Self {
        let mut index = Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            map: HashMap::new(),
        };
        for line in lines {
            index.insert_line(line);
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "2020-06-04 07:10:31\n\
oa_package/08/e0/PMC13900.tar.gz\tBreast Cancer Res. 2001; 3(1):55-60\tPMC13900\t11250746\tNO-CC CODE\n\
oa_package/b0/ac/PMC7266364.tar.gz\tTransplant Direct. 2020 Jun; 6(6):e559\tPMC7266364\t32607426\tCC BY-NC-ND\n";

    #[test]
    fn load_skips_timestamp_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("oa_file_list.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        drop(file);

        let index = PmcIndex::load(&path, "https://ftp.ncbi.nlm.nih.gov/pub/pmc/").unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.contains("PMC7266364"));
        assert!(!index.contains("2020-06-04"));
    }

    #[test]
    fn archive_url_joins_base() {
        let index = PmcIndex::from_lines(
            "https://ftp.example.org/pmc",
            &["oa_package/b0/ac/PMC7266364.tar.gz\tcitation\tPMC7266364\t32607426\tCC BY"],
        );
        let (url, license) = index.archive_url("PMC7266364").unwrap();
        assert_eq!(
            url,
            "https://ftp.example.org/pmc/oa_package/b0/ac/PMC7266364.tar.gz"
        );
        assert_eq!(license, "CC BY");
    }

    #[test]
    fn missing_file_gives_empty_index() {
        let index = PmcIndex::load(Path::new("/nonexistent/oa_file_list.txt"), "x").unwrap();
        assert!(index.is_empty());
        assert_eq!(index.archive_url("PMC1"), None);
    }

    #[test]
    fn short_lines_ignored() {
        let index = PmcIndex::from_lines("base", &["only\ttwo"]);
        assert!(index.is_empty());
    }
}
