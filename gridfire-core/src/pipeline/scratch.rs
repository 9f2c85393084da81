use std::{
    io,
    path::{Path, PathBuf},
};

use tempfile::TempDir;

/// Local working space for stage handlers.
///
/// Each job gets its own randomly named directory under `root`. The
/// directory is removed when the returned [`TempDir`] drops, which happens on
/// success, on error and when the job future is cancelled.
#[derive(Debug, Clone)]
pub struct ScratchSpace {
    root: PathBuf,
}

impl ScratchSpace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Scratch under the system temp directory.
    pub fn system() -> Self {
        Self::new(std::env::temp_dir().join("gridfire"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn job_dir(&self, label: &str) -> io::Result<TempDir> {
        tokio::fs::create_dir_all(&self.root).await?;
        tempfile::Builder::new()
            .prefix(&format!("{label}-"))
            .tempdir_in(&self.root)
    }

    /// Entries currently under the root; anything here belongs to a job
    /// that is still running.
    pub fn entries(&self) -> io::Result<Vec<PathBuf>> {
        match std::fs::read_dir(&self.root) {
            Ok(dir) => dir
                .map(|entry| entry.map(|e| e.path()))
                .collect::<io::Result<Vec<_>>>(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }
}
