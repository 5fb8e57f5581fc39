//! 💾 The Result Writer: one JSON file, written whole or not at all.
//!
//! The merged map goes to a sibling temp file first and is renamed over the
//! target only once every byte is down. A crash halfway leaves the previous
//! artifact (or nothing) in place, never a half-written one. Keys are sorted so
//! two runs over the same data produce byte-identical files.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::aggregate::MergedAggregateMap;
use crate::error::TallyError;

#[derive(Debug, Clone)]
pub struct ResultWriter {
    path: PathBuf,
}

impl ResultWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "group_statistics.json".into());
        name.push(format!(".{}.partial", std::process::id()));
        self.path.with_file_name(name)
    }

    fn failure(&self, source: std::io::Error) -> TallyError {
        TallyError::OutputWrite {
            path: self.path.clone(),
            source,
        }
    }

    /// Returns the number of bytes written.
    pub async fn write(&self, merged: &MergedAggregateMap) -> Result<usize, TallyError> {
        let mut body = serde_json::to_vec_pretty(&merged.sorted())
            .map_err(|e| self.failure(std::io::Error::other(e)))?;
        body.push(b'\n');

        let staging = self.staging_path();
        if let Err(e) = tokio::fs::write(&staging, &body).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(self.failure(e));
        }
        if let Err(e) = tokio::fs::rename(&staging, &self.path).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(self.failure(e));
        }

        info!(
            "💾 wrote {} group(s), {} bytes → {}",
            merged.len(),
            body.len(),
            self.path.display()
        );
        Ok(body.len())
    }
}
