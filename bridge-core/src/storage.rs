//! Temporary storage: outbound payloads staged on disk so the transport can stream them.

use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Scoped staging area. Every file staged since the last `cleanup` is removed by it.
pub struct TemporaryStorage {
    root: PathBuf,
    staged: Mutex<Vec<PathBuf>>,
}

impl TemporaryStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            staged: Mutex::new(Vec::new()),
        }
    }

    /// Storage under the OS temp dir, scoped to this process.
    pub fn in_temp_dir() -> Self {
        Self::new(default_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write `bytes` to a fresh uniquely named file. The file only appears under its
    /// final name once fully written.
    pub fn stage(&self, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        std::fs::create_dir_all(&self.root).map_err(|source| StorageError::Io {
            path: self.root.clone(),
            source,
        })?;
        let name = uuid::Uuid::new_v4().to_string();
        let path = self.root.join(&name);
        let partial = self.root.join(format!("{name}.part"));
        let written = std::fs::write(&partial, bytes).and_then(|()| std::fs::rename(&partial, &path));
        if let Err(source) = written {
            let _ = std::fs::remove_file(&partial);
            return Err(StorageError::Io { path, source });
        }
        debug!(path = %path.display(), len = bytes.len(), "staged payload");
        self.staged.lock().push(path.clone());
        Ok(path)
    }

    /// Remove every staged file. Failures are logged and swallowed.
    pub fn cleanup(&self) {
        let staged = std::mem::take(&mut *self.staged.lock());
        for path in staged {
            if let Err(e) = std::fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove staged file");
            }
        }
    }

    /// Guard that runs `cleanup` when dropped, on every exit path.
    pub fn scope(&self) -> StagingScope<'_> {
        StagingScope { storage: self }
    }

    /// Files staged and not yet cleaned up.
    pub fn staged(&self) -> Vec<PathBuf> {
        self.staged.lock().clone()
    }
}

impl Default for TemporaryStorage {
    fn default() -> Self {
        Self::in_temp_dir()
    }
}

/// Default staging root: `<tmp>/resources-bridge-<pid>`.
pub fn default_root() -> PathBuf {
    std::env::temp_dir().join(format!("resources-bridge-{}", std::process::id()))
}

pub struct StagingScope<'a> {
    storage: &'a TemporaryStorage,
}

impl StagingScope<'_> {
    pub fn stage(&self, bytes: &[u8]) -> Result<PathBuf, StorageError> {
        self.storage.stage(bytes)
    }
}

impl Drop for StagingScope<'_> {
    fn drop(&mut self) {
        self.storage.cleanup();
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to stage payload at {}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },
}
