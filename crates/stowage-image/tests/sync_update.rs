//! Integration tests for store synchronization.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use stowage_common::{StowageError, StowageResult};
use stowage_image::{
    BlobStore, DirStore, Image, ImageIndex, LazyImage, Layer, MemoryImage, MemoryIndex,
    MemoryLayer, MemoryStore, StoreOp, UpdateOptions, read_root_index, update,
};
use stowage_oci::{ConfigFile, Digest, Platform};
use tempfile::tempdir;

const BLOB: &str = "application/octet-stream";

fn options(staging: &Path) -> UpdateOptions {
    UpdateOptions::new().with_temp_dir(staging)
}

fn sorted(mut digests: Vec<Digest>) -> Vec<Digest> {
    digests.sort();
    digests
}

fn assert_staging_removed(staging: &Path) {
    assert_eq!(std::fs::read_dir(staging).unwrap().count(), 0);
}

fn image(layers: &[&str]) -> Arc<MemoryImage> {
    let layers = layers
        .iter()
        .map(|content| {
            Arc::new(MemoryLayer::from_tar(content.as_bytes()).unwrap()) as Arc<dyn Layer>
        })
        .collect();
    let config = ConfigFile {
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        ..Default::default()
    };
    Arc::new(MemoryImage::new(config, layers).unwrap())
}

fn read_all(mut reader: impl Read) -> Vec<u8> {
    let mut data = Vec::new();
    reader.read_to_end(&mut data).unwrap();
    data
}

#[test_log::test]
fn update_prunes_stale_and_adds_nested() {
    let staging = tempdir().unwrap();
    let mut store = MemoryStore::new();
    let a = store.write_blob(&mut &b"A"[..]).unwrap();
    let b = store.write_blob(&mut &b"B"[..]).unwrap();
    let c = store.write_blob(&mut &b"C"[..]).unwrap();
    let r1 = MemoryIndex::builder().blob(BLOB, b"B".to_vec()).build().unwrap();
    store
        .write_root_index(&mut r1.raw_manifest().unwrap().as_slice())
        .unwrap();
    let setup = store.mutations();

    let e: Arc<dyn ImageIndex> = Arc::new(
        MemoryIndex::builder()
            .blob(BLOB, b"B".to_vec())
            .blob(BLOB, b"D".to_vec())
            .build()
            .unwrap(),
    );
    let r2 = MemoryIndex::builder()
        .index(Arc::clone(&e))
        .unwrap()
        .build()
        .unwrap();

    let report = update(&mut store, &r2, &options(staging.path())).unwrap();

    let d = Digest::sha256(b"D");
    let e_digest = e.digest().unwrap();
    assert_eq!(
        sorted(store.blob_digests().unwrap()),
        sorted(vec![b.clone(), d.clone(), e_digest.clone()])
    );
    assert_eq!(store.root_index_digest().unwrap(), Some(r2.digest().unwrap()));
    assert_eq!(store.blob(&b), Some(&b"B"[..]));
    assert_eq!(store.blob(&d), Some(&b"D"[..]));

    assert!(!report.unchanged);
    assert_eq!(report.added, vec![d, e_digest]);
    assert_eq!(report.kept, vec![b.clone()]);
    assert_eq!(sorted(report.removed), sorted(vec![a, c]));

    // B was kept, never rewritten or deleted.
    let touched_b = store.operations()[setup..].iter().any(|op| {
        matches!(op, StoreOp::WriteBlob(digest) | StoreOp::DeleteBlob(digest) if *digest == b)
    });
    assert!(!touched_b);
    assert_staging_removed(staging.path());
}

#[test_log::test]
fn second_update_is_a_no_op() {
    let staging = tempdir().unwrap();
    let mut store = MemoryStore::new();
    let index = MemoryIndex::builder()
        .image(image(&["base", "app"]), Some(Platform::linux_amd64()))
        .unwrap()
        .build()
        .unwrap();

    let first = update(&mut store, &index, &options(staging.path())).unwrap();
    assert_eq!(first.added.len(), 4);
    let mutations = store.mutations();

    let second = update(&mut store, &index, &options(staging.path())).unwrap();
    assert!(second.unchanged);
    assert_eq!(second.root, first.root);
    assert_eq!(store.mutations(), mutations);
    assert_staging_removed(staging.path());
}

#[test]
fn new_root_index_is_written_after_its_content() {
    let staging = tempdir().unwrap();
    let mut store = MemoryStore::new();
    store.write_blob(&mut &b"old"[..]).unwrap();
    store.write_root_index(&mut &b"{}"[..]).unwrap();
    let setup = store.mutations();

    let index = MemoryIndex::builder()
        .image(image(&["layer"]), None)
        .unwrap()
        .build()
        .unwrap();
    update(&mut store, &index, &options(staging.path())).unwrap();

    let ops = &store.operations()[setup..];
    let root_write = ops
        .iter()
        .position(|op| matches!(op, StoreOp::WriteRootIndex(_)))
        .unwrap();
    let root_delete = ops
        .iter()
        .position(|op| *op == StoreOp::DeleteRootIndex)
        .unwrap();
    let last_add = ops
        .iter()
        .rposition(|op| matches!(op, StoreOp::WriteBlob(_)))
        .unwrap();
    let first_delete = ops
        .iter()
        .position(|op| matches!(op, StoreOp::DeleteBlob(_)))
        .unwrap();

    assert!(last_add < root_delete);
    assert!(root_delete < root_write);
    assert!(root_write < first_delete);
}

#[test_log::test]
fn dir_store_tracks_layer_substitution() {
    let staging = tempdir().unwrap();
    let archive = tempdir().unwrap();
    let mut store = DirStore::open(archive.path()).unwrap();

    let base = image(&["base", "app"]);
    let index = MemoryIndex::builder()
        .image(base.clone(), Some(Platform::linux_amd64()))
        .unwrap()
        .build()
        .unwrap();
    let report = update(&mut store, &index, &options(staging.path())).unwrap();
    assert_eq!(report.added.len(), 4);
    assert!(report.removed.is_empty());

    let root = read_root_index(&store).unwrap().unwrap();
    assert_eq!(root.manifests[0].digest, base.digest().unwrap());
    assert_eq!(root.manifests[0].platform, Some(Platform::linux_amd64()));

    let base_layers = base.layers().unwrap();
    let stored = read_all(store.read_blob(&base_layers[1].digest().unwrap()).unwrap());
    assert_eq!(stored, read_all(base_layers[1].compressed().unwrap()));

    // Swap the app layer and persist the result.
    let new_app: Arc<dyn Layer> = Arc::new(MemoryLayer::from_tar(b"app v2").unwrap());
    let patched =
        Arc::new(LazyImage::replace_layer(base.clone(), 1, Arc::clone(&new_app)).unwrap());
    let index = MemoryIndex::builder()
        .image(patched.clone(), Some(Platform::linux_amd64()))
        .unwrap()
        .build()
        .unwrap();
    let report = update(&mut store, &index, &options(staging.path())).unwrap();

    let patched_manifest = patched.manifest().unwrap();
    assert_eq!(report.kept, vec![base_layers[0].digest().unwrap()]);
    assert_eq!(
        report.added,
        vec![
            new_app.digest().unwrap(),
            patched_manifest.config.digest.clone(),
            patched.digest().unwrap(),
        ]
    );
    assert_eq!(
        sorted(report.removed),
        sorted(vec![
            base_layers[1].digest().unwrap(),
            base.manifest().unwrap().config.digest.clone(),
            base.digest().unwrap(),
        ])
    );

    assert_eq!(
        sorted(store.blob_digests().unwrap()),
        sorted(vec![
            base_layers[0].digest().unwrap(),
            new_app.digest().unwrap(),
            patched_manifest.config.digest.clone(),
            patched.digest().unwrap(),
        ])
    );
    let config = read_all(store.read_blob(&patched_manifest.config.digest).unwrap());
    assert_eq!(config, patched.raw_config_file().unwrap());
    assert_eq!(
        store.root_index_digest().unwrap(),
        Some(index.digest().unwrap())
    );
    assert_staging_removed(staging.path());
}

/// A layer that claims one digest but streams different bytes, or fails.
struct BadLayer {
    claimed: MemoryLayer,
    stream: Option<Vec<u8>>,
}

impl Layer for BadLayer {
    fn digest(&self) -> StowageResult<Digest> {
        self.claimed.digest()
    }

    fn diff_id(&self) -> StowageResult<Digest> {
        self.claimed.diff_id()
    }

    fn size(&self) -> StowageResult<i64> {
        self.claimed.size()
    }

    fn media_type(&self) -> StowageResult<String> {
        self.claimed.media_type()
    }

    fn compressed(&self) -> StowageResult<Box<dyn Read + Send + '_>> {
        match &self.stream {
            Some(bytes) => Ok(Box::new(bytes.as_slice())),
            None => Err(StowageError::Io(std::io::Error::other("layer source went away"))),
        }
    }
}

fn index_with_layer(layer: BadLayer) -> MemoryIndex {
    let layer: Arc<dyn Layer> = Arc::new(layer);
    let image = MemoryImage::new(ConfigFile::default(), vec![layer]).unwrap();
    MemoryIndex::builder()
        .image(Arc::new(image), None)
        .unwrap()
        .build()
        .unwrap()
}

fn seeded_store() -> MemoryStore {
    let mut store = MemoryStore::new();
    store.write_blob(&mut &b"stale"[..]).unwrap();
    store.write_root_index(&mut &b"{}"[..]).unwrap();
    store
}

#[test]
fn unreadable_layer_leaves_store_untouched() {
    let staging = tempdir().unwrap();
    let mut store = seeded_store();
    let setup = store.mutations();

    let index = index_with_layer(BadLayer {
        claimed: MemoryLayer::from_tar(b"real").unwrap(),
        stream: None,
    });
    let err = update(&mut store, &index, &options(staging.path())).unwrap_err();

    assert!(matches!(err, StowageError::Io(_)));
    assert_eq!(store.mutations(), setup);
    assert_staging_removed(staging.path());
}

#[test]
fn corrupt_layer_is_rejected_before_mutation() {
    let staging = tempdir().unwrap();
    let mut store = seeded_store();
    let setup = store.mutations();

    let index = index_with_layer(BadLayer {
        claimed: MemoryLayer::from_tar(b"real").unwrap(),
        stream: Some(b"tampered".to_vec()),
    });
    let err = update(&mut store, &index, &options(staging.path())).unwrap_err();

    assert!(matches!(err, StowageError::DigestMismatch { .. }));
    assert_eq!(store.mutations(), setup);
    assert_staging_removed(staging.path());
}

/// Store that refuses blob writes.
struct ReadOnlyStore(MemoryStore);

impl BlobStore for ReadOnlyStore {
    fn blob_digests(&self) -> StowageResult<Vec<Digest>> {
        self.0.blob_digests()
    }

    fn root_index(&self) -> StowageResult<Option<Vec<u8>>> {
        self.0.root_index()
    }

    fn read_blob(&self, digest: &Digest) -> StowageResult<Box<dyn Read + '_>> {
        self.0.read_blob(digest)
    }

    fn write_blob(&mut self, _content: &mut dyn Read) -> StowageResult<Digest> {
        Err(StowageError::Store {
            message: "archive is read-only".to_string(),
        })
    }

    fn write_root_index(&mut self, content: &mut dyn Read) -> StowageResult<Digest> {
        self.0.write_root_index(content)
    }

    fn delete_blob(&mut self, digest: &Digest) -> StowageResult<()> {
        self.0.delete_blob(digest)
    }

    fn delete_root_index(&mut self) -> StowageResult<()> {
        self.0.delete_root_index()
    }
}

#[test]
fn store_failure_is_surfaced_and_staging_removed() {
    let staging = tempdir().unwrap();
    let mut store = ReadOnlyStore(seeded_store());
    let root_before = store.root_index_digest().unwrap();

    let index = MemoryIndex::builder()
        .image(image(&["layer"]), None)
        .unwrap()
        .build()
        .unwrap();
    let err = update(&mut store, &index, &options(staging.path())).unwrap_err();

    assert!(matches!(err, StowageError::Store { .. }));
    // The old root index still stands and still points at what it did.
    assert_eq!(store.root_index_digest().unwrap(), root_before);
    assert_staging_removed(staging.path());
}

#[test]
fn update_into_empty_store() {
    let staging = tempdir().unwrap();
    let mut store = MemoryStore::new();
    let index = MemoryIndex::builder()
        .blob(BLOB, b"only".to_vec())
        .build()
        .unwrap();

    let report = update(&mut store, &index, &options(staging.path())).unwrap();
    assert_eq!(report.added, vec![Digest::sha256(b"only")]);
    assert!(!store.operations().contains(&StoreOp::DeleteRootIndex));
    assert_eq!(
        store.root_index_digest().unwrap(),
        Some(index.digest().unwrap())
    );
}

#[test]
fn missing_staging_directory_is_an_error() {
    let parent = tempdir().unwrap();
    let missing = parent.path().join("no-such-dir");
    let mut store = seeded_store();
    let mutations = store.mutations();

    let index = MemoryIndex::builder()
        .blob(BLOB, b"new".to_vec())
        .build()
        .unwrap();
    let err = update(&mut store, &index, &options(&missing)).unwrap_err();

    assert!(matches!(err, StowageError::Io(_)));
    assert!(!missing.exists());
    assert_eq!(store.mutations(), mutations);
}
