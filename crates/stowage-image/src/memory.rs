//! In-memory images, layers and indices.
//!
//! These hold their content in memory and derive every digest from it, which
//! makes them the natural way to assemble an index before writing it to a
//! store.

use std::collections::{BTreeMap, HashMap};
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use stowage_common::{StowageError, StowageResult};
use stowage_oci::{
    ConfigFile, Descriptor, Digest, ImageManifest, IndexManifest, Platform, media_types,
};

use crate::model::{Image, ImageIndex, Layer, layer_descriptor};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// A layer whose compressed bytes live in memory.
#[derive(Debug, Clone)]
pub struct MemoryLayer {
    compressed: Arc<[u8]>,
    digest: Digest,
    diff_id: Digest,
    media_type: String,
}

impl MemoryLayer {
    /// Gzip an uncompressed tar stream into a layer.
    ///
    /// # Errors
    ///
    /// Returns an error if compression fails.
    pub fn from_tar(tar: &[u8]) -> StowageResult<Self> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(tar)?;
        let compressed = encoder.finish()?;

        Ok(Self {
            digest: Digest::sha256(&compressed),
            diff_id: Digest::sha256(tar),
            compressed: compressed.into(),
            media_type: media_types::LAYER_TAR_GZIP.to_string(),
        })
    }

    /// Build a layer from already-compressed bytes.
    ///
    /// Gzip is detected by its magic bytes; anything else is treated as an
    /// uncompressed tar.
    ///
    /// # Errors
    ///
    /// Returns an error if the content cannot be decompressed.
    pub fn from_compressed(compressed: Vec<u8>) -> StowageResult<Self> {
        let (diff_id, media_type) = if compressed.starts_with(GZIP_MAGIC) {
            let (diff_id, _) = Digest::sha256_reader(GzDecoder::new(compressed.as_slice()))?;
            (diff_id, media_types::LAYER_TAR_GZIP)
        } else {
            (Digest::sha256(&compressed), media_types::LAYER_TAR)
        };

        Ok(Self {
            digest: Digest::sha256(&compressed),
            diff_id,
            compressed: compressed.into(),
            media_type: media_type.to_string(),
        })
    }
}

impl Layer for MemoryLayer {
    fn digest(&self) -> StowageResult<Digest> {
        Ok(self.digest.clone())
    }

    fn diff_id(&self) -> StowageResult<Digest> {
        Ok(self.diff_id.clone())
    }

    fn size(&self) -> StowageResult<i64> {
        Ok(self.compressed.len() as i64)
    }

    fn media_type(&self) -> StowageResult<String> {
        Ok(self.media_type.clone())
    }

    fn compressed(&self) -> StowageResult<Box<dyn Read + Send + '_>> {
        Ok(Box::new(Cursor::new(&self.compressed[..])))
    }
}

/// An image whose manifest, config and layers live in memory.
pub struct MemoryImage {
    manifest: Arc<ImageManifest>,
    raw_manifest: Vec<u8>,
    config_file: Arc<ConfigFile>,
    raw_config: Vec<u8>,
    layers: Vec<Arc<dyn Layer>>,
}

impl MemoryImage {
    /// Assemble an OCI image from a config and its layers.
    ///
    /// The config's diff ID list is overwritten from the layers.
    ///
    /// # Errors
    ///
    /// Returns an error if a layer accessor or serialization fails.
    pub fn new(mut config_file: ConfigFile, layers: Vec<Arc<dyn Layer>>) -> StowageResult<Self> {
        let mut descriptors = Vec::with_capacity(layers.len());
        let mut diff_ids = Vec::with_capacity(layers.len());
        for layer in &layers {
            descriptors.push(layer_descriptor(layer.as_ref())?);
            diff_ids.push(layer.diff_id()?);
        }
        config_file.rootfs.diff_ids = diff_ids;

        let raw_config = serde_json::to_vec(&config_file)?;
        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(media_types::MANIFEST.to_string()),
            config: Descriptor::new(
                media_types::CONFIG,
                Digest::sha256(&raw_config),
                raw_config.len() as i64,
            ),
            layers: descriptors,
            subject: None,
            annotations: BTreeMap::new(),
            extra: BTreeMap::new(),
        };
        let raw_manifest = serde_json::to_vec(&manifest)?;

        Ok(Self {
            manifest: Arc::new(manifest),
            raw_manifest,
            config_file: Arc::new(config_file),
            raw_config,
            layers,
        })
    }

    /// Wrap an existing serialized manifest and config.
    ///
    /// The bytes are kept verbatim, so the image digest is the digest of
    /// `raw_manifest` as given.
    ///
    /// # Errors
    ///
    /// Returns an error if either document fails to parse, or if the layer
    /// count does not match the manifest.
    pub fn from_raw(
        raw_manifest: Vec<u8>,
        raw_config: Vec<u8>,
        layers: Vec<Arc<dyn Layer>>,
    ) -> StowageResult<Self> {
        let manifest: ImageManifest = serde_json::from_slice(&raw_manifest)?;
        let config_file: ConfigFile = serde_json::from_slice(&raw_config)?;
        if manifest.layers.len() != layers.len() {
            return Err(StowageError::InvalidArgument {
                message: format!(
                    "manifest lists {} layers but {} were supplied",
                    manifest.layers.len(),
                    layers.len()
                ),
            });
        }

        Ok(Self {
            manifest: Arc::new(manifest),
            raw_manifest,
            config_file: Arc::new(config_file),
            raw_config,
            layers,
        })
    }

    fn find_layer(
        &self,
        wanted: &Digest,
        key: impl Fn(&dyn Layer) -> StowageResult<Digest>,
    ) -> StowageResult<Arc<dyn Layer>> {
        for layer in &self.layers {
            if &key(layer.as_ref())? == wanted {
                return Ok(Arc::clone(layer));
            }
        }
        Err(StowageError::LayerNotFound {
            digest: wanted.to_string(),
        })
    }
}

impl Image for MemoryImage {
    fn media_type(&self) -> StowageResult<String> {
        Ok(self
            .manifest
            .media_type
            .clone()
            .unwrap_or_else(|| media_types::MANIFEST.to_string()))
    }

    fn manifest(&self) -> StowageResult<Arc<ImageManifest>> {
        Ok(Arc::clone(&self.manifest))
    }

    fn raw_manifest(&self) -> StowageResult<Vec<u8>> {
        Ok(self.raw_manifest.clone())
    }

    fn config_file(&self) -> StowageResult<Arc<ConfigFile>> {
        Ok(Arc::clone(&self.config_file))
    }

    fn raw_config_file(&self) -> StowageResult<Vec<u8>> {
        Ok(self.raw_config.clone())
    }

    fn layers(&self) -> StowageResult<Vec<Arc<dyn Layer>>> {
        Ok(self.layers.clone())
    }

    fn layer_by_digest(&self, digest: &Digest) -> StowageResult<Arc<dyn Layer>> {
        self.find_layer(digest, |layer| layer.digest())
    }

    fn layer_by_diff_id(&self, diff_id: &Digest) -> StowageResult<Arc<dyn Layer>> {
        self.find_layer(diff_id, |layer| layer.diff_id())
    }
}

/// An index whose children live in memory.
pub struct MemoryIndex {
    manifest: Arc<IndexManifest>,
    raw_manifest: Vec<u8>,
    images: HashMap<Digest, Arc<dyn Image>>,
    indices: HashMap<Digest, Arc<dyn ImageIndex>>,
    blobs: HashMap<Digest, Arc<[u8]>>,
}

impl MemoryIndex {
    /// Start building an index.
    #[must_use]
    pub fn builder() -> IndexBuilder {
        IndexBuilder::default()
    }
}

impl ImageIndex for MemoryIndex {
    fn media_type(&self) -> StowageResult<String> {
        Ok(self
            .manifest
            .media_type
            .clone()
            .unwrap_or_else(|| media_types::INDEX.to_string()))
    }

    fn index_manifest(&self) -> StowageResult<Arc<IndexManifest>> {
        Ok(Arc::clone(&self.manifest))
    }

    fn raw_manifest(&self) -> StowageResult<Vec<u8>> {
        Ok(self.raw_manifest.clone())
    }

    fn image(&self, digest: &Digest) -> StowageResult<Arc<dyn Image>> {
        self.images
            .get(digest)
            .cloned()
            .ok_or_else(|| StowageError::BlobNotFound {
                digest: digest.to_string(),
            })
    }

    fn image_index(&self, digest: &Digest) -> StowageResult<Arc<dyn ImageIndex>> {
        self.indices
            .get(digest)
            .cloned()
            .ok_or_else(|| StowageError::BlobNotFound {
                digest: digest.to_string(),
            })
    }

    fn blob(&self, digest: &Digest) -> StowageResult<Box<dyn Read + Send + '_>> {
        match self.blobs.get(digest) {
            Some(data) => Ok(Box::new(Cursor::new(&data[..]))),
            None => Err(StowageError::BlobNotFound {
                digest: digest.to_string(),
            }),
        }
    }
}

/// Builder for [`MemoryIndex`]. Entries keep insertion order.
#[derive(Default)]
pub struct IndexBuilder {
    manifests: Vec<Descriptor>,
    annotations: BTreeMap<String, String>,
    images: HashMap<Digest, Arc<dyn Image>>,
    indices: HashMap<Digest, Arc<dyn ImageIndex>>,
    blobs: HashMap<Digest, Arc<[u8]>>,
}

impl IndexBuilder {
    /// Append an image entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the image's manifest cannot be produced.
    pub fn image(
        mut self,
        image: Arc<dyn Image>,
        platform: Option<Platform>,
    ) -> StowageResult<Self> {
        let mut descriptor = Descriptor::new(image.media_type()?, image.digest()?, image.size()?);
        descriptor.platform = platform;
        self.images.insert(descriptor.digest.clone(), image);
        self.manifests.push(descriptor);
        Ok(self)
    }

    /// Append a nested index entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the child's manifest cannot be produced.
    pub fn index(mut self, index: Arc<dyn ImageIndex>) -> StowageResult<Self> {
        let descriptor = Descriptor::new(index.media_type()?, index.digest()?, index.size()?);
        self.indices.insert(descriptor.digest.clone(), index);
        self.manifests.push(descriptor);
        Ok(self)
    }

    /// Append an arbitrary blob entry.
    #[must_use]
    pub fn blob(mut self, media_type: &str, data: impl Into<Vec<u8>>) -> Self {
        let data: Vec<u8> = data.into();
        let descriptor = Descriptor::new(media_type, Digest::sha256(&data), data.len() as i64);
        self.blobs.insert(descriptor.digest.clone(), data.into());
        self.manifests.push(descriptor);
        self
    }

    /// Add an annotation to the index manifest.
    #[must_use]
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Serialize the index manifest and finish.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn build(self) -> StowageResult<MemoryIndex> {
        let mut manifest = IndexManifest::new(self.manifests);
        manifest.annotations = self.annotations;
        let raw_manifest = serde_json::to_vec(&manifest)?;

        Ok(MemoryIndex {
            manifest: Arc::new(manifest),
            raw_manifest,
            images: self.images,
            indices: self.indices,
            blobs: self.blobs,
        })
    }
}
