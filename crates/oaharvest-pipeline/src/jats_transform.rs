//! Batch JATS→TEI transformer (XSLT engine run as a subprocess).
//!
//! The transformer is dramatically faster over a directory than per
//! document, so the reverse pass stages `.nxml` files into a working
//! directory and converts them in one invocation.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use crate::proc::{SubprocessError, run_with_deadline};

/// Empty DTD stubs dropped into the staging directory so the XSLT engine
/// never tries to fetch JATS DTDs from the network.
const DTD_STUBS: [&str; 7] = [
    "JATS-archivearticle1.dtd",
    "JATS-archivearticle1-mathml3.dtd",
    "archivearticle1-mathml3.dtd",
    "archivearticle1.dtd",
    "archivearticle3.dtd",
    "journalpublishing.dtd",
    "archivearticle.dtd",
];

#[derive(Debug)]
pub enum TransformError {
    Io(std::io::Error),
    Timeout,
    Failed { code: Option<i32>, stderr: String },
}

impl std::fmt::Display for TransformError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "transformer could not run: {e}"),
            Self::Timeout => write!(f, "transformer killed after deadline"),
            Self::Failed { code, stderr } => {
                let code = code.map_or("?".to_string(), |c| c.to_string());
                write!(f, "transformer exited {code}: {}", stderr.trim())
            }
        }
    }
}

impl std::error::Error for TransformError {}

impl From<std::io::Error> for TransformError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

pub struct JatsTransformer {
    /// Checkout of the stylesheet distribution (jar + stylesheets inside).
    transformer_path: PathBuf,
    deadline: Duration,
}

impl JatsTransformer {
    pub fn new(transformer_path: &Path, deadline: Duration) -> Self {
        Self {
            transformer_path: transformer_path.to_path_buf(),
            deadline,
        }
    }

    pub fn jar_path(&self) -> PathBuf {
        self.transformer_path.join("Samples").join("saxon9he.jar")
    }

    pub fn stylesheet_path(&self) -> PathBuf {
        self.transformer_path
            .join("Stylesheets")
            .join("Publishers.xsl")
    }

    /// Transform every JATS file in `input_dir`, writing results to
    /// `output_dir`.
    pub fn transform_batch(
        &self,
        input_dir: &Path,
        output_dir: &Path,
    ) -> Result<(), TransformError> {
        std::fs::create_dir_all(output_dir)?;
        stage_dtd_stubs(input_dir)?;

        let mut command = Command::new("java");
        command
            .arg("-jar")
            .arg(self.jar_path())
            .arg(format!("-s:{}", input_dir.display()))
            .arg(format!("-xsl:{}", self.stylesheet_path().display()))
            .arg(format!("-o:{}", output_dir.display()))
            .arg("-dtd:off")
            .arg("-a:off")
            .arg("-expand:off")
            .arg("-t");

        let output = match run_with_deadline(&mut command, self.deadline) {
            Ok(output) => output,
            Err(SubprocessError::Timeout) => return Err(TransformError::Timeout),
            Err(SubprocessError::Io(e)) => return Err(TransformError::Io(e)),
        };

        if !output.success() {
            return Err(TransformError::Failed {
                code: output.status,
                stderr: truncate(&output.stderr_utf8(), 2000),
            });
        }
        Ok(())
    }
}

/// Write the empty DTD placeholder files.
pub fn stage_dtd_stubs(dir: &Path) -> std::io::Result<()> {
    for stub in DTD_STUBS {
        let path = dir.join(stub);
        if !path.exists() {
            std::fs::write(&path, b"")?;
        }
    }
    Ok(())
}

/// Entry id from a transformer output file name
/// (`<id>.nxml` / `<id>.nxml.xml` / `<id>.nlm`).
pub fn id_from_output_name(name: &str) -> Option<&str> {
    let stem = name.split('.').next()?;
    (!stem.is_empty()
        && (name.ends_with(".nxml.xml") || name.ends_with(".nxml") || name.ends_with(".nlm")))
    .then_some(stem)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
