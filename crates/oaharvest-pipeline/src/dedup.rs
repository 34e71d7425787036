//! Deduplication and identifier resolution.
//!
//! Collapses the raw input stream into distinct logical articles. Keys are
//! tried in a cascade: the explicit cord id, then strong identifiers (DOI,
//! PMID, PMCID), then the weak article-level key (normalized title +
//! first-author surname + year). On a weak-key merge the side with the
//! richer identifier set (PMC > DOI > PMID > title-only) provides the
//! canonical id, except that ids persisted by earlier runs are immutable
//! and always win. Two rows carrying different DOIs never merge on the
//! weak key.

use std::collections::{HashMap, HashSet};

use crate::entry::{Entry, Identifiers};
use crate::ids::random_id;
use crate::input::InputRow;

/// Outcome of resolving one input row.
#[derive(Debug, PartialEq)]
pub enum Resolution {
    /// First sighting; the caller creates the entry under this id.
    New { id: String },
    /// The row belongs to an already-known entry; the caller unions the
    /// row's identifiers into it.
    Existing { id: String },
    /// Weak-key merge where the incoming row carries the richer identifier
    /// set: its id becomes canonical and the same-run entry previously
    /// registered under `previous` folds into it.
    Superseded { id: String, previous: String },
}

/// In-memory resolution state for one run.
pub struct Resolver {
    strong: HashMap<String, String>,
    weak: HashMap<String, String>,
    /// Union of all identifiers registered per entry id, for richness
    /// comparison and the DOI-disagreement check.
    identifiers: HashMap<String, Identifiers>,
    /// Ids persisted by earlier runs; never superseded.
    pinned: HashSet<String>,
}

impl Resolver {
    pub fn new() -> Self {
        Self {
            strong: HashMap::new(),
            weak: HashMap::new(),
            identifiers: HashMap::new(),
            pinned: HashSet::new(),
        }
    }

    /// Rebuild the strong-key maps from entries persisted by earlier runs.
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut resolver = Self::new();
        for entry in entries {
            resolver.register_identifiers(&entry.id, &entry.identifiers);
            resolver.pinned.insert(entry.id.clone());
        }
        resolver
    }

    /// Resolve a row to an entry id, registering its keys either way.
    pub fn resolve(&mut self, row: &InputRow) -> Resolution {
        let ids = &row.identifiers;

        if let Some(id) = self.find_strong(ids) {
            self.register_identifiers(&id, ids);
            self.register_weak(&id, row);
            return Resolution::Existing { id };
        }

        if let Some(key) = weak_key(row)
            && let Some(existing_id) = self.weak.get(&key).cloned()
            && self.weak_mergeable(&existing_id, ids)
        {
            let existing_richness = self
                .identifiers
                .get(&existing_id)
                .map_or(0, Identifiers::richness);
            if ids.richness() > existing_richness && !self.pinned.contains(&existing_id) {
                // the richer row wins the canonical id
                let id = ids.cord_id.clone().unwrap_or_else(random_id);
                self.repoint(&existing_id, &id);
                self.register_identifiers(&id, ids);
                return Resolution::Superseded {
                    id,
                    previous: existing_id,
                };
            }
            self.register_identifiers(&existing_id, ids);
            return Resolution::Existing { id: existing_id };
        }

        let id = ids.cord_id.clone().unwrap_or_else(random_id);
        self.register_identifiers(&id, ids);
        self.register_weak(&id, row);
        Resolution::New { id }
    }

    fn find_strong(&self, ids: &Identifiers) -> Option<String> {
        for key in strong_keys(ids) {
            if let Some(id) = self.strong.get(&key) {
                return Some(id.clone());
            }
        }
        None
    }

    /// DOI wins over the article-level key: a row whose DOI differs from
    /// the matched entry's DOI is a different article, not a merge.
    fn weak_mergeable(&self, existing_id: &str, ids: &Identifiers) -> bool {
        let existing_doi = self
            .identifiers
            .get(existing_id)
            .and_then(|e| e.doi.as_deref());
        match (ids.doi.as_deref(), existing_doi) {
            (Some(incoming), Some(existing)) => incoming.eq_ignore_ascii_case(existing),
            _ => true,
        }
    }

    fn register_identifiers(&mut self, id: &str, ids: &Identifiers) {
        for key in strong_keys(ids) {
            self.strong.entry(key).or_insert_with(|| id.to_string());
        }
        self.identifiers.entry(id.to_string()).or_default().merge(ids);
    }

    fn register_weak(&mut self, id: &str, row: &InputRow) {
        if let Some(key) = weak_key(row) {
            self.weak.entry(key).or_insert_with(|| id.to_string());
        }
    }

    /// Move every key registered under `from` onto the new canonical `to`.
    fn repoint(&mut self, from: &str, to: &str) {
        for id in self.strong.values_mut() {
            if id == from {
                *id = to.to_string();
            }
        }
        for id in self.weak.values_mut() {
            if id == from {
                *id = to.to_string();
            }
        }
        if let Some(folded) = self.identifiers.remove(from) {
            self.identifiers
                .entry(to.to_string())
                .or_default()
                .merge(&folded);
        }
    }
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new()
    }
}

fn strong_keys(ids: &Identifiers) -> Vec<String> {
    let mut keys = Vec::new();
    if let Some(cord) = &ids.cord_id {
        keys.push(format!("cord:{cord}"));
    }
    if let Some(doi) = &ids.doi {
        keys.push(format!("doi:{}", doi.to_lowercase()));
    }
    if let Some(pmid) = &ids.pmid {
        keys.push(format!("pmid:{pmid}"));
    }
    if let Some(pmcid) = &ids.pmcid {
        keys.push(format!("pmcid:{pmcid}"));
    }
    keys
}

/// `title|author|year` article key; absent unless all three parts exist.
pub fn weak_key(row: &InputRow) -> Option<String> {
    let title = normalize_title(row.title.as_deref()?);
    if title.is_empty() {
        return None;
    }
    let author = first_author_surname(row.authors.as_deref()?)?;
    let year = row.year()?;
    Some(format!("{title}|{author}|{year}"))
}

/// Lowercase, strip punctuation and whitespace, fold accented Latin
/// letters onto their ASCII base letter.
pub fn normalize_title(title: &str) -> String {
    title
        .chars()
        .flat_map(char::to_lowercase)
        .map(fold_accent)
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

/// Surname of the first author from a `Family, Given; Family, Given`
/// style author field.
pub fn first_author_surname(authors: &str) -> Option<String> {
    let first = authors.split(';').next()?.trim();
    let surname = first.split(',').next()?.trim();
    let folded: String = surname
        .chars()
        .flat_map(char::to_lowercase)
        .map(fold_accent)
        .filter(char::is_ascii_alphanumeric)
        .collect();
    if folded.is_empty() { None } else { Some(folded) }
}

fn fold_accent(c: char) -> char {
    match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ă' | 'ą' | 'æ' => 'a',
        'ç' | 'ć' | 'ĉ' | 'ċ' | 'č' => 'c',
        'ď' | 'đ' => 'd',
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ĕ' | 'ė' | 'ę' | 'ě' => 'e',
        'ĝ' | 'ğ' | 'ġ' | 'ģ' => 'g',
        'ĥ' | 'ħ' => 'h',
        'ì' | 'í' | 'î' | 'ï' | 'ĩ' | 'ī' | 'ĭ' | 'į' | 'ı' => 'i',
        'ĵ' => 'j',
        'ķ' => 'k',
        'ĺ' | 'ļ' | 'ľ' | 'ł' => 'l',
        'ñ' | 'ń' | 'ņ' | 'ň' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ŏ' | 'ő' | 'œ' => 'o',
        'ŕ' | 'ŗ' | 'ř' => 'r',
        'ś' | 'ŝ' | 'ş' | 'š' | 'ß' => 's',
        'ţ' | 'ť' | 'ŧ' => 't',
        'ù' | 'ú' | 'û' | 'ü' | 'ũ' | 'ū' | 'ŭ' | 'ů' | 'ű' | 'ų' => 'u',
        'ŵ' => 'w',
        'ý' | 'ÿ' => 'y',
        'ź' | 'ż' | 'ž' => 'z',
        other => other,
    }
}
