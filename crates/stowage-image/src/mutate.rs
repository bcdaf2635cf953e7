//! Layer substitution on top of an immutable image.
//!
//! [`LazyImage`] presents a base image with some of its layers swapped out.
//! Everything that depends on the layer set (the manifest's layer list, the
//! config's diff IDs, the config digest, the manifest digest) is derived in a
//! single pass the first time any of it is needed, then reused for the life
//! of the instance.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use parking_lot::Mutex;
use stowage_common::{StowageError, StowageResult};
use stowage_oci::{ConfigFile, Digest, History, ImageManifest};

use crate::model::{Image, Layer, layer_descriptor};

/// An image view with per-layer overrides applied to a base image.
pub struct LazyImage {
    base: Arc<dyn Image>,
    overrides: Vec<Option<Arc<dyn Layer>>>,
    history: Option<History>,
    /// `None` until a compute pass succeeds.
    state: Mutex<Option<Arc<Computed>>>,
}

/// Derived state, committed only as a whole.
struct Computed {
    layers: Vec<Arc<dyn Layer>>,
    by_digest: HashMap<Digest, Arc<dyn Layer>>,
    by_diff_id: HashMap<Digest, Arc<dyn Layer>>,
    manifest: Arc<ImageManifest>,
    raw_manifest: Vec<u8>,
    config_file: Arc<ConfigFile>,
    raw_config: Vec<u8>,
}

impl LazyImage {
    /// Create an image view over `base`.
    ///
    /// `overrides` holds one slot per base layer; `None` keeps the base
    /// layer at that position. When `history` is given it replaces the whole
    /// history of the config.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::InvalidArgument`] if `overrides` does not have
    /// exactly one entry per base layer.
    pub fn new(
        base: Arc<dyn Image>,
        overrides: Vec<Option<Arc<dyn Layer>>>,
        history: Option<History>,
    ) -> StowageResult<Self> {
        let base_layers = base.layers()?.len();
        if overrides.len() != base_layers {
            return Err(StowageError::InvalidArgument {
                message: format!(
                    "{} layer overrides given for an image with {} layers",
                    overrides.len(),
                    base_layers
                ),
            });
        }

        Ok(Self {
            base,
            overrides,
            history,
            state: Mutex::new(None),
        })
    }

    /// Replace the single layer at `index`, keeping every other layer.
    ///
    /// # Errors
    ///
    /// Returns [`StowageError::InvalidArgument`] if `index` is out of range.
    pub fn replace_layer(
        base: Arc<dyn Image>,
        index: usize,
        layer: Arc<dyn Layer>,
    ) -> StowageResult<Self> {
        let count = base.layers()?.len();
        if index >= count {
            return Err(StowageError::InvalidArgument {
                message: format!("layer index {index} out of range for {count} layers"),
            });
        }
        let mut overrides = vec![None; count];
        overrides[index] = Some(layer);
        Self::new(base, overrides, None)
    }

    /// Return the derived state, computing it on first use.
    fn computed(&self) -> StowageResult<Arc<Computed>> {
        let mut state = self.state.lock();
        if let Some(computed) = state.as_ref() {
            return Ok(Arc::clone(computed));
        }

        let computed = Arc::new(self.compute()?);
        *state = Some(Arc::clone(&computed));
        Ok(computed)
    }

    fn compute(&self) -> StowageResult<Computed> {
        tracing::debug!(layers = self.overrides.len(), "Computing image with layer overrides");

        // Owned copies; the base's Arcs are never written through.
        let mut config_file = ConfigFile::clone(&*self.base.config_file()?);
        let mut manifest = ImageManifest::clone(&*self.base.manifest()?);
        let base_layers = self.base.layers()?;

        let count = self.overrides.len();
        let mut layers = Vec::with_capacity(count);
        let mut descriptors = Vec::with_capacity(count);
        let mut diff_ids = Vec::with_capacity(count);
        let mut by_digest = HashMap::with_capacity(count);
        let mut by_diff_id = HashMap::with_capacity(count);

        for (i, slot) in self.overrides.iter().enumerate() {
            let layer = match slot {
                Some(layer) => Arc::clone(layer),
                None => base_layers
                    .get(i)
                    .cloned()
                    .ok_or_else(|| StowageError::InvalidArgument {
                        message: format!("base image has no layer at index {i}"),
                    })?,
            };

            let descriptor = layer_descriptor(layer.as_ref())?;
            let diff_id = layer.diff_id()?;

            by_digest.insert(descriptor.digest.clone(), Arc::clone(&layer));
            by_diff_id.insert(diff_id.clone(), Arc::clone(&layer));
            descriptors.push(descriptor);
            diff_ids.push(diff_id);
            layers.push(layer);
        }

        manifest.layers = descriptors;
        config_file.rootfs.diff_ids = diff_ids;

        if let Some(history) = &self.history {
            config_file.history = vec![history.clone()];
        }

        let raw_config = serde_json::to_vec(&config_file)?;
        manifest.config.digest = Digest::sha256(&raw_config);
        manifest.config.size = raw_config.len() as i64;
        if manifest.config.data.is_some() {
            manifest.config.data = Some(BASE64.encode(&raw_config));
        }
        let raw_manifest = serde_json::to_vec(&manifest)?;

        tracing::debug!(config = %manifest.config.digest, "Image overrides computed");

        Ok(Computed {
            layers,
            by_digest,
            by_diff_id,
            manifest: Arc::new(manifest),
            raw_manifest,
            config_file: Arc::new(config_file),
            raw_config,
        })
    }
}

impl Image for LazyImage {
    fn media_type(&self) -> StowageResult<String> {
        self.base.media_type()
    }

    fn manifest(&self) -> StowageResult<Arc<ImageManifest>> {
        Ok(Arc::clone(&self.computed()?.manifest))
    }

    fn raw_manifest(&self) -> StowageResult<Vec<u8>> {
        Ok(self.computed()?.raw_manifest.clone())
    }

    fn config_file(&self) -> StowageResult<Arc<ConfigFile>> {
        Ok(Arc::clone(&self.computed()?.config_file))
    }

    fn raw_config_file(&self) -> StowageResult<Vec<u8>> {
        Ok(self.computed()?.raw_config.clone())
    }

    fn layers(&self) -> StowageResult<Vec<Arc<dyn Layer>>> {
        Ok(self.computed()?.layers.clone())
    }

    fn layer_by_digest(&self, digest: &Digest) -> StowageResult<Arc<dyn Layer>> {
        self.computed()?
            .by_digest
            .get(digest)
            .cloned()
            .ok_or_else(|| StowageError::LayerNotFound {
                digest: digest.to_string(),
            })
    }

    fn layer_by_diff_id(&self, diff_id: &Digest) -> StowageResult<Arc<dyn Layer>> {
        self.computed()?
            .by_diff_id
            .get(diff_id)
            .cloned()
            .ok_or_else(|| StowageError::LayerNotFound {
                digest: diff_id.to_string(),
            })
    }

    fn config_name(&self) -> StowageResult<Digest> {
        Ok(self.computed()?.manifest.config.digest.clone())
    }
}
