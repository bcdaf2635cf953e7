//! Standard filesystem paths for stowage.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

/// Default parent directory for per-update staging directories.
pub static STOWAGE_TMPDIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("STOWAGE_TMPDIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir())
});

const BLOBS_DIR: &str = "blobs";
const ROOT_INDEX_FILE: &str = "index.json";

/// Layout of a directory-backed blob archive.
#[derive(Debug, Clone)]
pub struct StowagePaths {
    /// Archive root directory.
    pub root: PathBuf,
}

impl StowagePaths {
    /// Create paths rooted at `root`.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Archive root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Content-addressable storage for blobs.
    #[must_use]
    pub fn blobs(&self) -> PathBuf {
        self.root.join(BLOBS_DIR)
    }

    /// Directory holding blobs of one hash algorithm.
    #[must_use]
    pub fn blobs_for(&self, algorithm: &str) -> PathBuf {
        self.blobs().join(algorithm)
    }

    /// Blob file by digest.
    #[must_use]
    pub fn blob(&self, algorithm: &str, hex: &str) -> PathBuf {
        self.blobs_for(algorithm).join(hex)
    }

    /// The root index file.
    #[must_use]
    pub fn root_index(&self) -> PathBuf {
        self.root.join(ROOT_INDEX_FILE)
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.blobs())?;
        Ok(())
    }
}
