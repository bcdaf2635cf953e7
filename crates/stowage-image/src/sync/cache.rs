//! Per-update staging area for blobs.

use std::fs::{self, File};
use std::io::{self, BufWriter, Read};
use std::path::{Path, PathBuf};

use stowage_common::{StowageError, StowageResult};
use stowage_oci::{Digest, HashingWriter};
use tempfile::TempDir;

/// A private directory holding one file per staged digest.
///
/// The directory is removed when the cache is dropped, whether the update
/// that owns it succeeded or not.
pub struct BlobCache {
    dir: TempDir,
}

impl BlobCache {
    /// Create a fresh staging directory under `parent`, which must exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn new(parent: &Path) -> StowageResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("stowage-update-")
            .tempdir_in(parent)?;
        tracing::debug!(path = %dir.path().display(), "Created blob cache");
        Ok(Self { dir })
    }

    #[cfg(test)]
    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.dir
            .path()
            .join(format!("{}-{}", digest.algorithm(), digest.hex()))
    }

    /// Stream `content` into the cache under `digest`.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::DigestMismatch`] if the content does not hash
    /// to `digest`, or an I/O error if writing fails.
    pub fn stage(&self, digest: &Digest, content: &mut dyn Read) -> StowageResult<i64> {
        let path = self.blob_path(digest);
        let mut writer = HashingWriter::new(BufWriter::new(File::create(&path)?));
        io::copy(content, &mut writer)?;
        let (buffered, actual, size) = writer.finish();
        buffered.into_inner().map_err(io::IntoInnerError::into_error)?;

        if &actual != digest {
            fs::remove_file(&path)?;
            return Err(StowageError::DigestMismatch {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }

        tracing::debug!(digest = %digest, size, "Blob staged");
        Ok(size)
    }

    #[cfg(test)]
    fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Open a staged blob.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::BlobNotFound`] if the digest was never staged.
    pub fn open(&self, digest: &Digest) -> StowageResult<File> {
        File::open(self.blob_path(digest)).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StowageError::BlobNotFound {
                digest: digest.to_string(),
            },
            _ => StowageError::Io(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_and_open() {
        let parent = tempfile::tempdir().unwrap();
        let cache = BlobCache::new(parent.path()).unwrap();
        let digest = Digest::sha256(b"staged");

        assert!(!cache.contains(&digest));
        assert_eq!(cache.stage(&digest, &mut &b"staged"[..]).unwrap(), 6);
        assert!(cache.contains(&digest));

        let mut data = Vec::new();
        cache.open(&digest).unwrap().read_to_end(&mut data).unwrap();
        assert_eq!(data, b"staged");
    }

    #[test]
    fn stage_rejects_wrong_content() {
        let parent = tempfile::tempdir().unwrap();
        let cache = BlobCache::new(parent.path()).unwrap();
        let digest = Digest::sha256(b"expected");

        let err = cache.stage(&digest, &mut &b"something else"[..]).unwrap_err();
        assert!(matches!(err, StowageError::DigestMismatch { .. }));
        assert!(!cache.contains(&digest));
    }

    #[test]
    fn open_missing_blob() {
        let parent = tempfile::tempdir().unwrap();
        let cache = BlobCache::new(parent.path()).unwrap();
        assert!(matches!(
            cache.open(&Digest::sha256(b"never")),
            Err(StowageError::BlobNotFound { .. })
        ));
    }

    #[test]
    fn missing_parent_is_not_created() {
        let parent = tempfile::tempdir().unwrap();
        let missing = parent.path().join("absent");

        assert!(matches!(BlobCache::new(&missing), Err(StowageError::Io(_))));
        assert!(!missing.exists());
    }

    #[test]
    fn drop_removes_directory() {
        let parent = tempfile::tempdir().unwrap();
        let path = {
            let cache = BlobCache::new(parent.path()).unwrap();
            cache
                .stage(&Digest::sha256(b"x"), &mut &b"x"[..])
                .unwrap();
            cache.path().to_path_buf()
        };
        assert!(!path.exists());
        assert_eq!(fs::read_dir(parent.path()).unwrap().count(), 0);
    }
}
