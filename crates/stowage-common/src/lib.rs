//! # stowage-common
//!
//! Shared types for the stowage crates.
//!
//! This crate provides:
//! - The common error type
//! - Standard filesystem paths and environment-driven defaults

#![warn(missing_docs)]

pub mod error;
pub mod paths;

pub use error::{StowageError, StowageResult};
pub use paths::{STOWAGE_TMPDIR, StowagePaths};
