//! Store synchronization.
//!
//! [`update`] makes a [`BlobStore`] hold exactly the content of an
//! [`ImageIndex`]: blobs the index references but the store lacks are added,
//! blobs the store holds but the index does not reference are removed, and
//! the root index is replaced.
//!
//! Every blob that has to be added is first staged to a private temporary
//! directory, so the walk never holds whole blobs in memory and no store
//! mutation starts until every addition is fully materialized. Mutations
//! then run in this order:
//!
//! 1. add staged blobs,
//! 2. replace the root index,
//! 3. delete blobs the new index does not reference.
//!
//! The root index only becomes visible once everything it references is in
//! the store. A failure part way through is not rolled back; the store may
//! then hold extra blobs, and repeating the update finishes the job.
//!
//! Concurrent updates of one store are ruled out by `&mut` access.

pub mod cache;
pub mod walk;

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Serialize;
use stowage_common::{STOWAGE_TMPDIR, StowageError, StowageResult};
use stowage_oci::Digest;

use crate::model::ImageIndex;
use crate::store::BlobStore;

pub use cache::BlobCache;
pub use walk::{IndexWalker, WalkOutcome};

/// Options for [`update`].
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    temp_dir: Option<PathBuf>,
}

impl UpdateOptions {
    /// Default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage blobs under `dir` instead of the default temporary directory.
    /// The directory must already exist.
    #[must_use]
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Parent directory for the staging directory.
    #[must_use]
    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.as_deref().unwrap_or(STOWAGE_TMPDIR.as_path())
    }
}

/// What an [`update`] did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    /// Digest of the store's root index after the update.
    pub root: Digest,
    /// Blobs added to the store, in the order they were written.
    pub added: Vec<Digest>,
    /// Blobs that were already present and referenced by the new index.
    pub kept: Vec<Digest>,
    /// Blobs removed from the store.
    pub removed: Vec<Digest>,
    /// The store already matched the index; nothing was touched.
    pub unchanged: bool,
}

impl UpdateReport {
    fn unchanged(root: Digest) -> Self {
        Self {
            root,
            added: Vec::new(),
            kept: Vec::new(),
            removed: Vec::new(),
            unchanged: true,
        }
    }
}

/// Reconcile `store` with `index`.
///
/// If the store's root index already has the same digest as `index`, the
/// store is left untouched.
///
/// # Errors
///
/// Returns the first error raised while reading the index, staging content
/// or mutating the store. Errors before the first mutation leave the store
/// unchanged; later errors may leave it needing a repeat update. The staging
/// directory is removed in every case.
pub fn update<S: BlobStore + ?Sized>(
    store: &mut S,
    index: &dyn ImageIndex,
    options: &UpdateOptions,
) -> StowageResult<UpdateReport> {
    let new_root = index.digest()?;
    let current_root = store.root_index_digest()?;
    if current_root.as_ref() == Some(&new_root) {
        tracing::info!(root = %new_root, "Store already matches index");
        return Ok(UpdateReport::unchanged(new_root));
    }

    tracing::info!(
        from = ?current_root.as_ref().map(ToString::to_string),
        to = %new_root,
        "Updating store"
    );

    let existing = store.blob_digests()?;
    let existing_set: HashSet<Digest> = existing.iter().cloned().collect();

    let cache = BlobCache::new(options.temp_dir())?;
    let WalkOutcome { cached, kept } = IndexWalker::new(&existing_set, &cache).walk(index)?;
    let raw_root = index.raw_manifest()?;

    tracing::debug!(
        staged = cached.len(),
        kept = kept.len(),
        "Index walk complete"
    );

    for digest in &cached {
        let mut staged = cache.open(digest)?;
        let written = store.write_blob(&mut staged)?;
        if &written != digest {
            return Err(StowageError::DigestMismatch {
                expected: digest.to_string(),
                actual: written.to_string(),
            });
        }
        tracing::debug!(digest = %digest, "Blob added");
    }

    if current_root.is_some() {
        store.delete_root_index()?;
    }
    let written_root = store.write_root_index(&mut raw_root.as_slice())?;
    if written_root != new_root {
        return Err(StowageError::DigestMismatch {
            expected: new_root.to_string(),
            actual: written_root.to_string(),
        });
    }

    let keep: HashSet<&Digest> = kept.iter().collect();
    let mut removed = Vec::new();
    for digest in existing {
        if keep.contains(&digest) {
            continue;
        }
        store.delete_blob(&digest)?;
        tracing::debug!(digest = %digest, "Blob removed");
        removed.push(digest);
    }

    tracing::info!(
        root = %new_root,
        added = cached.len(),
        kept = kept.len(),
        removed = removed.len(),
        "Store updated"
    );

    Ok(UpdateReport {
        root: new_root,
        added: cached,
        kept,
        removed,
        unchanged: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_shared_tmpdir() {
        let options = UpdateOptions::new();
        assert_eq!(options.temp_dir(), STOWAGE_TMPDIR.as_path());

        let options = options.with_temp_dir("/var/tmp/stowage");
        assert_eq!(options.temp_dir(), Path::new("/var/tmp/stowage"));
    }

    #[test]
    fn unchanged_report_is_empty() {
        let report = UpdateReport::unchanged(Digest::sha256(b"root"));
        assert!(report.unchanged);
        assert!(report.added.is_empty() && report.kept.is_empty() && report.removed.is_empty());
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains(r#""unchanged":true"#));
    }
}
