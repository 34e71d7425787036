//! Entry id generation and identifier cleanup

use rand::Rng;

/// Length of generated entry ids.
const ID_LEN: usize = 22;

/// Fresh random base62 entry id (22 chars, ~131 bits).
pub fn random_id() -> String {
    rand::rng()
        .sample_iter(rand::distr::Alphanumeric)
        .take(ID_LEN)
        .map(char::from)
        .collect()
}

/// Normalize a DOI: strip resolver prefixes, trim, lowercase.
pub fn clean_doi(doi: &str) -> String {
    let doi = doi.trim();
    let doi = doi
        .strip_prefix("https://doi.org/")
        .or_else(|| doi.strip_prefix("http://doi.org/"))
        .or_else(|| doi.strip_prefix("https://dx.doi.org/"))
        .or_else(|| doi.strip_prefix("http://dx.doi.org/"))
        .unwrap_or(doi);
    doi.trim().to_lowercase()
}

/// Normalize a PMC id to the canonical `PMC1234567` form.
pub fn clean_pmcid(pmcid: &str) -> String {
    let trimmed = pmcid.trim();
    if trimmed.chars().all(|c| c.is_ascii_digit()) && !trimmed.is_empty() {
        format!("PMC{trimmed}")
    } else {
        trimmed.to_uppercase()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_id_len_and_charset() {
        let id = random_id();
        assert_eq!(id.len(), 22);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn random_ids_distinct() {
        assert_ne!(random_id(), random_id());
    }

    #[test]
    fn clean_doi_strips_resolver() {
        assert_eq!(
            clean_doi("https://doi.org/10.1097/TXD.0000000000001010"),
            "10.1097/txd.0000000000001010"
        );
        assert_eq!(clean_doi("http://dx.doi.org/10.1/ABC"), "10.1/abc");
    }

    #[test]
    fn clean_doi_lowercases_and_trims() {
        assert_eq!(clean_doi("  10.1234/AbC \n"), "10.1234/abc");
    }

    #[test]
    fn clean_doi_plain_passthrough() {
        assert_eq!(clean_doi("10.1/x"), "10.1/x");
    }

    #[test]
    fn clean_pmcid_adds_prefix() {
        assert_eq!(clean_pmcid("7266364"), "PMC7266364");
        assert_eq!(clean_pmcid("pmc7266364"), "PMC7266364");
        assert_eq!(clean_pmcid("PMC7266364"), "PMC7266364");
    }
}
