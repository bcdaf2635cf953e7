//! Blob stores.
//!
//! A blob store is a persisted set of digest-addressed content blobs plus a
//! single root index object naming what the store holds. [`crate::sync`]
//! reconciles a store against an [`crate::model::ImageIndex`] through the
//! [`BlobStore`] primitives only.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read};
use std::path::{Path, PathBuf};

use stowage_common::{StowageError, StowageResult, StowagePaths};
use stowage_oci::{Digest, HashingWriter, IndexManifest};
use tempfile::NamedTempFile;

/// Primitive operations on a persisted blob store.
pub trait BlobStore {
    /// Digests of all content blobs, excluding the root index.
    fn blob_digests(&self) -> StowageResult<Vec<Digest>>;

    /// Bytes of the root index, if the store has one.
    fn root_index(&self) -> StowageResult<Option<Vec<u8>>>;

    /// Open a content blob for reading.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::BlobNotFound`] if the blob does not exist.
    fn read_blob(&self, digest: &Digest) -> StowageResult<Box<dyn Read + '_>>;

    /// Add a content blob, returning the digest of what was written.
    fn write_blob(&mut self, content: &mut dyn Read) -> StowageResult<Digest>;

    /// Write the root index, replacing any existing one.
    fn write_root_index(&mut self, content: &mut dyn Read) -> StowageResult<Digest>;

    /// Remove a content blob.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::BlobNotFound`] if the blob does not exist.
    fn delete_blob(&mut self, digest: &Digest) -> StowageResult<()>;

    /// Remove the root index. Removing an absent root index is not an error.
    fn delete_root_index(&mut self) -> StowageResult<()>;

    /// Digest of the current root index.
    fn root_index_digest(&self) -> StowageResult<Option<Digest>> {
        Ok(self.root_index()?.map(|raw| Digest::sha256(&raw)))
    }
}

/// Parse the root index of `store`.
///
/// # Errors
///
/// Returns an error if the root index cannot be read or parsed.
pub fn read_root_index<S: BlobStore + ?Sized>(store: &S) -> StowageResult<Option<IndexManifest>> {
    match store.root_index()? {
        Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        None => Ok(None),
    }
}

/// A store mutation, as recorded by [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// A content blob was written.
    WriteBlob(Digest),
    /// The root index was written.
    WriteRootIndex(Digest),
    /// A content blob was deleted.
    DeleteBlob(Digest),
    /// The root index was deleted.
    DeleteRootIndex,
}

/// A blob store held in memory, recording every mutation.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: BTreeMap<Digest, Vec<u8>>,
    root: Option<Vec<u8>>,
    ops: Vec<StoreOp>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Content of a blob, if present.
    #[must_use]
    pub fn blob(&self, digest: &Digest) -> Option<&[u8]> {
        self.blobs.get(digest).map(Vec::as_slice)
    }

    /// Whether a blob is present.
    #[must_use]
    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.contains_key(digest)
    }

    /// Every mutation applied so far, in order.
    #[must_use]
    pub fn operations(&self) -> &[StoreOp] {
        &self.ops
    }

    /// Number of mutations applied so far.
    #[must_use]
    pub fn mutations(&self) -> usize {
        self.ops.len()
    }
}

impl BlobStore for MemoryStore {
    fn blob_digests(&self) -> StowageResult<Vec<Digest>> {
        Ok(self.blobs.keys().cloned().collect())
    }

    fn root_index(&self) -> StowageResult<Option<Vec<u8>>> {
        Ok(self.root.clone())
    }

    fn read_blob(&self, digest: &Digest) -> StowageResult<Box<dyn Read + '_>> {
        match self.blobs.get(digest) {
            Some(data) => Ok(Box::new(data.as_slice())),
            None => Err(StowageError::BlobNotFound {
                digest: digest.to_string(),
            }),
        }
    }

    fn write_blob(&mut self, content: &mut dyn Read) -> StowageResult<Digest> {
        let mut data = Vec::new();
        content.read_to_end(&mut data)?;
        let digest = Digest::sha256(&data);
        self.blobs.insert(digest.clone(), data);
        self.ops.push(StoreOp::WriteBlob(digest.clone()));
        Ok(digest)
    }

    fn write_root_index(&mut self, content: &mut dyn Read) -> StowageResult<Digest> {
        let mut data = Vec::new();
        content.read_to_end(&mut data)?;
        let digest = Digest::sha256(&data);
        self.root = Some(data);
        self.ops.push(StoreOp::WriteRootIndex(digest.clone()));
        Ok(digest)
    }

    fn delete_blob(&mut self, digest: &Digest) -> StowageResult<()> {
        if self.blobs.remove(digest).is_none() {
            return Err(StowageError::BlobNotFound {
                digest: digest.to_string(),
            });
        }
        self.ops.push(StoreOp::DeleteBlob(digest.clone()));
        Ok(())
    }

    fn delete_root_index(&mut self) -> StowageResult<()> {
        if self.root.take().is_some() {
            self.ops.push(StoreOp::DeleteRootIndex);
        }
        Ok(())
    }
}

/// A blob store persisted in a directory.
///
/// Blobs live at `blobs/<algorithm>/<hex>` and the root index at
/// `index.json`. Writes go to a temporary file in the store root and are
/// renamed into place once complete, so a blob path never holds partial
/// content.
#[derive(Debug)]
pub struct DirStore {
    paths: StowagePaths,
}

impl DirStore {
    /// Open or create a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directories cannot be created.
    pub fn open(root: impl Into<PathBuf>) -> StowageResult<Self> {
        let paths = StowagePaths::with_root(root);
        paths.create_dirs()?;
        Ok(Self { paths })
    }

    /// The store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.paths.blob(digest.algorithm(), digest.hex())
    }

    /// Copy `content` into a temporary file, returning it with its digest.
    fn spool(&self, content: &mut dyn Read) -> StowageResult<(NamedTempFile, Digest)> {
        let temp = NamedTempFile::new_in(self.paths.root())?;
        let mut writer = HashingWriter::new(BufWriter::new(temp));
        io::copy(content, &mut writer)?;
        let (buffered, digest, _) = writer.finish();
        let temp = buffered.into_inner().map_err(io::IntoInnerError::into_error)?;
        temp.as_file().sync_all()?;
        Ok((temp, digest))
    }
}

fn not_found(err: io::Error, digest: &Digest) -> StowageError {
    if err.kind() == io::ErrorKind::NotFound {
        StowageError::BlobNotFound {
            digest: digest.to_string(),
        }
    } else {
        StowageError::Io(err)
    }
}

impl BlobStore for DirStore {
    fn blob_digests(&self) -> StowageResult<Vec<Digest>> {
        let mut digests = Vec::new();
        for entry in walkdir::WalkDir::new(self.paths.blobs())
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| StowageError::Store {
                message: format!("Failed to list blobs: {}", e),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }

            let algorithm = entry
                .path()
                .parent()
                .and_then(Path::file_name)
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            let hex = entry.file_name().to_string_lossy();
            match Digest::new(&algorithm, &hex) {
                Ok(digest) => digests.push(digest),
                Err(_) => {
                    tracing::warn!(
                        path = %entry.path().display(),
                        "Ignoring unrecognized blob file"
                    );
                }
            }
        }
        Ok(digests)
    }

    fn root_index(&self) -> StowageResult<Option<Vec<u8>>> {
        match fs::read(self.paths.root_index()) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn read_blob(&self, digest: &Digest) -> StowageResult<Box<dyn Read + '_>> {
        let file = File::open(self.blob_path(digest)).map_err(|e| not_found(e, digest))?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn write_blob(&mut self, content: &mut dyn Read) -> StowageResult<Digest> {
        let (temp, digest) = self.spool(content)?;
        let dest = self.blob_path(&digest);
        if dest.exists() {
            tracing::debug!(digest = %digest, "Blob already present");
            return Ok(digest);
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        temp.persist(&dest).map_err(|e| StowageError::Io(e.error))?;
        tracing::debug!(digest = %digest, "Blob stored");
        Ok(digest)
    }

    fn write_root_index(&mut self, content: &mut dyn Read) -> StowageResult<Digest> {
        let (temp, digest) = self.spool(content)?;
        temp.persist(self.paths.root_index())
            .map_err(|e| StowageError::Io(e.error))?;
        tracing::debug!(digest = %digest, "Root index stored");
        Ok(digest)
    }

    fn delete_blob(&mut self, digest: &Digest) -> StowageResult<()> {
        fs::remove_file(self.blob_path(digest)).map_err(|e| not_found(e, digest))
    }

    fn delete_root_index(&mut self) -> StowageResult<()> {
        match fs::remove_file(self.paths.root_index()) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
