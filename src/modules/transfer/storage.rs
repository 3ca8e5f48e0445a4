//! Stored-upload naming and best-effort deletion.

use log::{info, warn};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Directory holding uploads and processor outputs.
#[derive(Debug, Clone)]
pub struct UploadStore {
    dir: PathBuf,
}

impl UploadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        UploadStore { dir: dir.into() }
    }

    /// Create the directory if it does not exist yet.
    pub async fn ensure_dir(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.dir).await
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Fresh destination path `<dir>/<uuid>.<extension>`.
    ///
    /// `extension` must already be validated.
    pub fn destination(&self, extension: &str) -> PathBuf {
        let name = format!("{}.{}", Uuid::new_v4().simple(), extension);
        self.dir.join(name)
    }

    /// Remove every path, logging failures instead of returning them.
    pub async fn delete_all<P: AsRef<Path>>(&self, paths: &[P]) {
        for path in paths {
            let path = path.as_ref();
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!("File {} deleted", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    info!("File {} not found", path.display())
                }
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    warn!("No permission to delete file {}", path.display())
                }
                Err(e) => warn!("Failed to delete file {}: {}", path.display(), e),
            }
        }
    }
}
