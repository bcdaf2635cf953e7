//! # stowage-image
//!
//! Content-addressed container images and the stores that hold them.
//!
//! This crate provides:
//! - The image model traits ([`Image`], [`ImageIndex`], [`Layer`])
//! - In-memory images, layers and indices
//! - [`LazyImage`], a base image with individual layers swapped out
//! - Blob stores, in memory and on disk
//! - [`sync::update`], which makes a store hold exactly one index

#![warn(missing_docs)]

pub mod memory;
pub mod model;
pub mod mutate;
pub mod store;
pub mod sync;

pub use memory::{IndexBuilder, MemoryImage, MemoryIndex, MemoryLayer};
pub use model::{Image, ImageIndex, Layer};
pub use mutate::LazyImage;
pub use store::{BlobStore, DirStore, MemoryStore, StoreOp, read_root_index};
pub use sync::{UpdateOptions, UpdateReport, update};
