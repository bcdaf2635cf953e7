//! Depth-first traversal of an image index.

use std::collections::HashSet;
use std::io::{Cursor, Read};

use stowage_common::StowageResult;
use stowage_oci::{Digest, media_types};

use super::cache::BlobCache;
use crate::model::{Image, ImageIndex, Layer};

/// Blobs referenced by an index, split by what the update must do with them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WalkOutcome {
    /// Digests staged in the cache, to be added to the store, in staging order.
    pub cached: Vec<Digest>,
    /// Digests already in the store, to be kept.
    pub kept: Vec<Digest>,
}

/// Walks an index, staging every referenced blob the store does not hold.
///
/// Children are handled before their parents: layers and config before an
/// image manifest, and the whole subtree before a nested index manifest.
pub struct IndexWalker<'a> {
    existing: &'a HashSet<Digest>,
    cache: &'a BlobCache,
    handled: HashSet<Digest>,
    outcome: WalkOutcome,
}

impl<'a> IndexWalker<'a> {
    /// Create a walker against the digests already present in the store.
    #[must_use]
    pub fn new(existing: &'a HashSet<Digest>, cache: &'a BlobCache) -> Self {
        Self {
            existing,
            cache,
            handled: HashSet::new(),
            outcome: WalkOutcome::default(),
        }
    }

    /// Walk `index` and everything it references.
    ///
    /// The root index's own manifest is not staged; it is written to the
    /// store separately.
    ///
    /// # Errors
    ///
    /// Returns the first error raised while reading or staging content.
    pub fn walk(mut self, index: &dyn ImageIndex) -> StowageResult<WalkOutcome> {
        self.walk_index(index)?;
        Ok(self.outcome)
    }

    fn walk_index(&mut self, index: &dyn ImageIndex) -> StowageResult<()> {
        let manifest = index.index_manifest()?;

        for descriptor in &manifest.manifests {
            let digest = &descriptor.digest;
            // A repeated image or index was walked in full the first time.
            if self.handled.contains(digest) {
                tracing::trace!(digest = %digest, "Already handled");
                continue;
            }

            if media_types::is_index(&descriptor.media_type) {
                let child = index.image_index(digest)?;
                self.walk_index(child.as_ref())?;
                self.visit(digest, || Ok(Cursor::new(child.raw_manifest()?)))?;
            } else if media_types::is_image(&descriptor.media_type) {
                let image = index.image(digest)?;
                self.walk_image(image.as_ref())?;
                self.visit(digest, || Ok(Cursor::new(image.raw_manifest()?)))?;
            } else {
                self.visit(digest, || index.blob(digest))?;
            }
        }

        Ok(())
    }

    fn walk_image(&mut self, image: &dyn Image) -> StowageResult<()> {
        for layer in image.layers()? {
            let digest = layer.digest()?;
            self.visit(&digest, || layer.compressed())?;
        }

        // Config is addressed by the digest the manifest declares.
        let manifest = image.manifest()?;
        self.visit(&manifest.config.digest, || {
            Ok(Cursor::new(image.raw_config_file()?))
        })
    }

    /// Keep `digest` if the store has it, otherwise stage it from `open`.
    fn visit<R: Read>(
        &mut self,
        digest: &Digest,
        open: impl FnOnce() -> StowageResult<R>,
    ) -> StowageResult<()> {
        if !self.handled.insert(digest.clone()) {
            return Ok(());
        }

        if self.existing.contains(digest) {
            tracing::debug!(digest = %digest, "Keeping blob");
            self.outcome.kept.push(digest.clone());
            return Ok(());
        }

        let mut content = open()?;
        self.cache.stage(digest, &mut content)?;
        self.outcome.cached.push(digest.clone());
        Ok(())
    }
}
