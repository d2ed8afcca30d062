use crate::storage::{PayloadStore, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Filesystem-based payload store
///
/// Keeps one file per key directly under the configured root. Writes go to
/// a temporary file in the same directory which is then renamed into place,
/// so readers never observe a partial payload.
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    /// Create a new filesystem store rooted at `root_path`, creating it if needed
    pub fn new<P: AsRef<Path>>(root_path: P) -> StorageResult<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                StorageError::Config(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }

        // Keep the path as given; canonicalizing resolves symlinks such as
        // /var -> /private/var and breaks comparisons against the configured root.
        Ok(Self { root_path })
    }
}

#[async_trait]
impl PayloadStore for FilesystemStorage {
    fn base_path(&self) -> &Path {
        &self.root_path
    }

    async fn store(&self, key: &str, payload: Bytes) -> StorageResult<PathBuf> {
        let target = self.locate(key)?;
        let root = self.root_path.clone();
        let written = target.clone();

        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            let mut staged = tempfile::Builder::new()
                .prefix(".incoming-")
                .tempfile_in(&root)?;
            staged.write_all(&payload)?;
            staged.as_file().sync_all()?;
            staged.persist(&written).map_err(|e| StorageError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(e)))??;

        Ok(target)
    }
}
