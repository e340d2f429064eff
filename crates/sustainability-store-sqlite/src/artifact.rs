use std::path::PathBuf;

use anyhow::{Context, Result};
use sustainability_core::Report;

/// External file storage for rendered report bodies.
///
/// Called only after the report transaction has committed. The returned
/// string is written back as the report's `report_url`.
pub trait ArtifactStore {
    fn store(&self, report: &Report) -> Result<String>;
}

/// Writes `<dir>/<report_id>.json` and hands back a `file://` URL.
#[derive(Debug, Clone)]
pub struct FileArtifactStore {
    dir: PathBuf,
}

impl FileArtifactStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ArtifactStore for FileArtifactStore {
    fn store(&self, report: &Report) -> Result<String> {
        std::fs::create_dir_all(&self.dir).with_context(|| {
            format!("failed to create artifact directory {}", self.dir.display())
        })?;

        let path = self.dir.join(format!("{}.json", report.report_id));
        let body = serde_json::to_vec_pretty(report).context("failed to serialize report")?;
        std::fs::write(&path, body)
            .with_context(|| format!("failed to write report artifact {}", path.display()))?;

        let absolute = path
            .canonicalize()
            .with_context(|| format!("failed to resolve {}", path.display()))?;
        Ok(format!("file://{}", absolute.display()))
    }
}
