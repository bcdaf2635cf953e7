//! # stowage-oci
//!
//! OCI (Open Container Initiative) image types for stowage.
//!
//! This crate provides Rust types for:
//! - Content digests and hashing
//! - OCI Image Specification (manifests, indices, configs)

#![warn(missing_docs)]

pub mod digest;
pub mod image;

pub use digest::{Digest, HashingWriter};
pub use image::{
    ConfigFile, Descriptor, History, ImageManifest, IndexManifest, Platform, RootFs, media_types,
};
