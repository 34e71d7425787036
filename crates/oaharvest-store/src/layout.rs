//! Storage layout: id-prefixed fan-out directories and artifact file names
//!
//! For an id `aabbccddeeff...` artifacts live under `aa/bb/cc/dd/<id>/`.
//! The 4-level prefix keeps directory fan-out balanced across corpora of
//! hundreds of thousands of entries and is identical on the local
//! filesystem and in the object-store key space.

use std::fmt;

/// Everything the pipeline can store for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Artifact {
    Pdf,
    Jats,
    TeiFromPdf,
    TeiFromJats,
    RefAnnotations,
    ThumbSmall,
    ThumbMedium,
    ThumbLarge,
    Metadata,
}

impl Artifact {
    /// File name of this artifact for the given entry id.
    pub fn file_name(self, id: &str) -> String {
        match self {
            Self::Pdf => format!("{id}.pdf"),
            Self::Jats => format!("{id}.nxml"),
            Self::TeiFromPdf => format!("{id}.grobid.tei.xml"),
            Self::TeiFromJats => format!("{id}.pub2tei.tei.xml"),
            Self::RefAnnotations => format!("{id}-ref-annotations.json"),
            Self::ThumbSmall => format!("{id}-thumb-small.png"),
            Self::ThumbMedium => format!("{id}-thumb-medium.png"),
            Self::ThumbLarge => format!("{id}-thumb-large.png"),
            Self::Metadata => format!("{id}.json"),
        }
    }

    /// File suffix, used when scanning a repository listing.
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Pdf => ".pdf",
            Self::Jats => ".nxml",
            Self::TeiFromPdf => ".grobid.tei.xml",
            Self::TeiFromJats => ".pub2tei.tei.xml",
            Self::RefAnnotations => "-ref-annotations.json",
            Self::ThumbSmall => "-thumb-small.png",
            Self::ThumbMedium => "-thumb-medium.png",
            Self::ThumbLarge => "-thumb-large.png",
            Self::Metadata => ".json",
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pdf => "pdf",
            Self::Jats => "jats",
            Self::TeiFromPdf => "tei_from_pdf",
            Self::TeiFromJats => "tei_from_jats",
            Self::RefAnnotations => "ref_annotations",
            Self::ThumbSmall | Self::ThumbMedium | Self::ThumbLarge => "thumbnail",
            Self::Metadata => "metadata",
        };
        f.write_str(name)
    }
}

/// `aa/bb/cc/dd` prefix for an id. Ids are 8-char cord ids or 22-char
/// base62, always ASCII and at least 8 bytes.
pub fn storage_prefix(id: &str) -> String {
    debug_assert!(id.len() >= 8 && id.is_ascii());
    format!("{}/{}/{}/{}", &id[0..2], &id[2..4], &id[4..6], &id[6..8])
}

/// Repository-relative directory holding all artifacts of an entry.
pub fn entry_dir(id: &str) -> String {
    format!("{}/{id}", storage_prefix(id))
}

/// Repository-relative path of one artifact.
pub fn artifact_path(id: &str, artifact: Artifact) -> String {
    format!("{}/{}", entry_dir(id), artifact.file_name(id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_fanout() {
        assert_eq!(storage_prefix("fq4xq00d"), "fq/4x/q0/0d");
        assert_eq!(
            storage_prefix("0123456789abcdefghijkl"),
            "01/23/45/67"
        );
    }

    #[test]
    fn entry_dir_includes_id() {
        assert_eq!(entry_dir("fq4xq00d"), "fq/4x/q0/0d/fq4xq00d");
    }

    #[test]
    fn artifact_paths() {
        assert_eq!(
            artifact_path("fq4xq00d", Artifact::Pdf),
            "fq/4x/q0/0d/fq4xq00d/fq4xq00d.pdf"
        );
        assert_eq!(
            artifact_path("fq4xq00d", Artifact::TeiFromJats),
            "fq/4x/q0/0d/fq4xq00d/fq4xq00d.pub2tei.tei.xml"
        );
        assert_eq!(
            artifact_path("fq4xq00d", Artifact::RefAnnotations),
            "fq/4x/q0/0d/fq4xq00d/fq4xq00d-ref-annotations.json"
        );
    }

    #[test]
    fn file_names_cover_all_artifacts() {
        for a in [
            Artifact::Pdf,
            Artifact::Jats,
            Artifact::TeiFromPdf,
            Artifact::TeiFromJats,
            Artifact::RefAnnotations,
            Artifact::ThumbSmall,
            Artifact::ThumbMedium,
            Artifact::ThumbLarge,
            Artifact::Metadata,
        ] {
            let name = a.file_name("abcdefgh");
            assert!(name.starts_with("abcdefgh"));
            assert!(name.ends_with(a.suffix()));
        }
    }
}
