//! First-page PNG thumbnails via ImageMagick.
//!
//! Three heights are rendered from the first PDF page. Any failure here is
//! non-fatal for the entry.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use oaharvest_store::Artifact;

use crate::proc::{SubprocessError, run_with_deadline};

/// (artifact, pixel height) per rendered size.
pub const SIZES: [(Artifact, u32); 3] = [
    (Artifact::ThumbSmall, 150),
    (Artifact::ThumbMedium, 300),
    (Artifact::ThumbLarge, 500),
];

const PNG_MAGIC: &[u8] = b"\x89PNG";

#[derive(Debug)]
pub enum ThumbnailError {
    Io(std::io::Error),
    Timeout,
    Failed { code: Option<i32>, stderr: String },
    InvalidOutput,
}

impl std::fmt::Display for ThumbnailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "thumbnail tool could not run: {e}"),
            Self::Timeout => write!(f, "thumbnail rendering killed after deadline"),
            Self::Failed { code, stderr } => {
                let code = code.map_or("?".to_string(), |c| c.to_string());
                write!(f, "thumbnail tool exited {code}: {}", stderr.trim())
            }
            Self::InvalidOutput => write!(f, "thumbnail tool produced no usable PNG"),
        }
    }
}

impl std::error::Error for ThumbnailError {}

impl From<std::io::Error> for ThumbnailError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Render the three thumbnail sizes next to `pdf_path`.
///
/// Returns the artifact kind and local file of each rendered image.
pub fn generate_thumbnails(
    pdf_path: &Path,
    deadline: Duration,
) -> Result<Vec<(Artifact, PathBuf)>, ThumbnailError> {
    let mut rendered = Vec::new();
    for (artifact, height) in SIZES {
        let out_path = pdf_path.with_extension(format!("thumb-{height}.png"));
        render_page(pdf_path, &out_path, height, deadline)?;
        if !is_valid_png(&out_path) {
            return Err(ThumbnailError::InvalidOutput);
        }
        rendered.push((artifact, out_path));
    }
    Ok(rendered)
}

fn render_page(
    pdf_path: &Path,
    out_path: &Path,
    height: u32,
    deadline: Duration,
) -> Result<(), ThumbnailError> {
    let mut command = Command::new("convert");
    command
        .arg("-quiet")
        .arg("-density")
        .arg("200")
        .arg("-thumbnail")
        .arg(format!("x{height}"))
        .arg("-flatten")
        // first page only
        .arg(format!("{}[0]", pdf_path.display()))
        .arg(out_path);

    let output = match run_with_deadline(&mut command, deadline) {
        Ok(output) => output,
        Err(SubprocessError::Timeout) => return Err(ThumbnailError::Timeout),
        Err(SubprocessError::Io(e)) => return Err(ThumbnailError::Io(e)),
    };

    if !output.success() {
        return Err(ThumbnailError::Failed {
            code: output.status,
            stderr: output.stderr_utf8(),
        });
    }
    Ok(())
}

fn is_valid_png(path: &Path) -> bool {
    match std::fs::read(path) {
        Ok(bytes) => bytes.starts_with(PNG_MAGIC),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_cover_three_artifacts() {
        let artifacts: Vec<Artifact> = SIZES.iter().map(|(a, _)| *a).collect();
        assert_eq!(
            artifacts,
            vec![
                Artifact::ThumbSmall,
                Artifact::ThumbMedium,
                Artifact::ThumbLarge
            ]
        );
    }

    #[test]
    fn png_validation() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("ok.png");
        std::fs::write(&good, b"\x89PNG\r\n\x1a\nrest").unwrap();
        assert!(is_valid_png(&good));

        let bad = dir.path().join("bad.png");
        std::fs::write(&bad, b"GIF89a").unwrap();
        assert!(!is_valid_png(&bad));

        assert!(!is_valid_png(&dir.path().join("missing.png")));
    }

    #[test]
    fn output_name_embeds_height() {
        let out = Path::new("/x/abc.pdf").with_extension("thumb-150.png");
        assert_eq!(out, PathBuf::from("/x/abc.thumb-150.png"));
    }
}
