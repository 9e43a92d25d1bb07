//! Registry of per-task temporary files.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Paths created while processing one task.
///
/// Each path is held once; `delete_all` removes them best-effort and may be
/// called repeatedly.
#[derive(Debug, Default)]
pub struct TempFiles {
    paths: Vec<PathBuf>,
}

impl TempFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, path: impl Into<PathBuf>) {
        let path = path.into();
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }

    pub async fn delete_all(&self) {
        for path in &self.paths {
            match tokio::fs::remove_file(path).await {
                Ok(()) => debug!(path = %path.display(), "Removed temporary file"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove temporary file"),
            }
        }
    }
}
