use std::path::{Path, PathBuf};

use crate::error::{ImageCycleError, Result};
use crate::scanner::ScanResult;

/// On-disk JSON mirror of the last scan. Read once at startup so consumers
/// have tag data before the first live scan completes; rewritten after
/// every successful scan and after reaper deletions.
pub struct ScanCache {
    path: PathBuf,
}

impl ScanCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<ScanResult> {
        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| ImageCycleError::Cache(format!("{}: {}", self.path.display(), e)))?;
        let result: ScanResult = serde_json::from_slice(&bytes)
            .map_err(|e| ImageCycleError::Cache(format!("{}: {}", self.path.display(), e)))?;
        Ok(result)
    }

    pub async fn store(&self, result: &ScanResult) -> Result<()> {
        let json = serde_json::to_vec_pretty(result)
            .map_err(|e| ImageCycleError::Cache(e.to_string()))?;
        // Write-then-rename so a crash mid-write never leaves a truncated
        // cache for the next startup to choke on.
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| ImageCycleError::Cache(format!("{}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| ImageCycleError::Cache(format!("{}: {}", self.path.display(), e)))?;
        Ok(())
    }
}
