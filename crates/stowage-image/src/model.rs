//! Image model.
//!
//! The traits in this module are the capability sets the rest of the crate
//! works against. Anything that can hand out manifests, configs and layer
//! streams (an in-memory image, a registry-backed image, a store-backed
//! image) can be mutated with [`crate::mutate::LazyImage`] and persisted with
//! [`crate::sync::update`].

use std::io::Read;
use std::sync::Arc;

use stowage_common::{StowageError, StowageResult};
use stowage_oci::{ConfigFile, Descriptor, Digest, ImageManifest, IndexManifest};

/// A single filesystem layer.
pub trait Layer: Send + Sync {
    /// Digest of the compressed content.
    fn digest(&self) -> StowageResult<Digest>;

    /// Digest of the uncompressed content.
    fn diff_id(&self) -> StowageResult<Digest>;

    /// Size of the compressed content in bytes.
    fn size(&self) -> StowageResult<i64>;

    /// Media type of the compressed content.
    fn media_type(&self) -> StowageResult<String>;

    /// Stream over the compressed content.
    fn compressed(&self) -> StowageResult<Box<dyn Read + Send + '_>>;

    /// A full descriptor for this layer, if the layer carries one.
    ///
    /// Layers that were read from a manifest return the original descriptor
    /// here so URLs and annotations survive re-manifesting.
    fn descriptor(&self) -> StowageResult<Option<Descriptor>> {
        Ok(None)
    }
}

/// Descriptor for `layer`, preferring the one the layer carries.
///
/// # Errors
///
/// Propagates any error from the layer's accessors.
pub fn layer_descriptor(layer: &dyn Layer) -> StowageResult<Descriptor> {
    if let Some(descriptor) = layer.descriptor()? {
        return Ok(descriptor);
    }
    Ok(Descriptor::new(
        layer.media_type()?,
        layer.digest()?,
        layer.size()?,
    ))
}

/// A single-platform container image.
pub trait Image: Send + Sync {
    /// Media type of the image manifest.
    fn media_type(&self) -> StowageResult<String>;

    /// Parsed image manifest.
    fn manifest(&self) -> StowageResult<Arc<ImageManifest>>;

    /// Serialized image manifest.
    fn raw_manifest(&self) -> StowageResult<Vec<u8>>;

    /// Parsed image configuration.
    fn config_file(&self) -> StowageResult<Arc<ConfigFile>>;

    /// Serialized image configuration.
    fn raw_config_file(&self) -> StowageResult<Vec<u8>>;

    /// Layers in manifest order.
    fn layers(&self) -> StowageResult<Vec<Arc<dyn Layer>>>;

    /// Layer with the given compressed digest.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::LayerNotFound`] if no layer matches.
    fn layer_by_digest(&self, digest: &Digest) -> StowageResult<Arc<dyn Layer>>;

    /// Layer with the given uncompressed diff ID.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::LayerNotFound`] if no layer matches.
    fn layer_by_diff_id(&self, diff_id: &Digest) -> StowageResult<Arc<dyn Layer>>;

    /// Size of the serialized manifest.
    fn size(&self) -> StowageResult<i64> {
        Ok(self.raw_manifest()?.len() as i64)
    }

    /// Digest of the serialized manifest.
    fn digest(&self) -> StowageResult<Digest> {
        Ok(Digest::sha256(&self.raw_manifest()?))
    }

    /// Digest of the serialized config, also known as the image ID.
    fn config_name(&self) -> StowageResult<Digest> {
        Ok(Digest::sha256(&self.raw_config_file()?))
    }
}

/// An index of images, nested indices and other blobs.
pub trait ImageIndex: Send + Sync {
    /// Media type of the index manifest.
    fn media_type(&self) -> StowageResult<String>;

    /// Parsed index manifest.
    fn index_manifest(&self) -> StowageResult<Arc<IndexManifest>>;

    /// Serialized index manifest.
    fn raw_manifest(&self) -> StowageResult<Vec<u8>>;

    /// Child image with the given manifest digest.
    fn image(&self, digest: &Digest) -> StowageResult<Arc<dyn Image>>;

    /// Child index with the given manifest digest.
    fn image_index(&self, digest: &Digest) -> StowageResult<Arc<dyn ImageIndex>>;

    /// Content of a child entry that is neither an image nor an index.
    fn blob(&self, digest: &Digest) -> StowageResult<Box<dyn Read + Send + '_>> {
        Err(StowageError::Unsupported {
            feature: format!("reading raw blob {digest} from this index"),
        })
    }

    /// Size of the serialized index manifest.
    fn size(&self) -> StowageResult<i64> {
        Ok(self.raw_manifest()?.len() as i64)
    }

    /// Digest of the serialized index manifest.
    fn digest(&self) -> StowageResult<Digest> {
        Ok(Digest::sha256(&self.raw_manifest()?))
    }
}
