//! Common error types for stowage.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`StowageError`].
pub type StowageResult<T> = Result<T, StowageError>;

/// Errors raised while building images or synchronizing blob stores.
#[derive(Error, Diagnostic, Debug)]
pub enum StowageError {
    /// Layer lookup by digest or diff ID missed.
    #[error("Layer not found: {digest}")]
    #[diagnostic(code(stowage::layer::not_found))]
    LayerNotFound {
        /// The digest or diff ID that was looked up.
        digest: String,
    },

    /// Blob lookup in a store or index missed.
    #[error("Blob not found: {digest}")]
    #[diagnostic(code(stowage::blob::not_found))]
    BlobNotFound {
        /// The digest that was looked up.
        digest: String,
    },

    /// A caller passed an argument that violates an operation's contract.
    #[error("Invalid argument: {message}")]
    #[diagnostic(code(stowage::invalid_argument))]
    InvalidArgument {
        /// What was wrong with the argument.
        message: String,
    },

    /// A digest string could not be parsed.
    #[error("Invalid digest: {value}")]
    #[diagnostic(
        code(stowage::digest::invalid),
        help("Digests look like 'sha256:' followed by 64 lowercase hex characters")
    )]
    InvalidDigest {
        /// The rejected value.
        value: String,
    },

    /// Content did not hash to the digest it was stored under.
    #[error("Digest mismatch: expected {expected}, got {actual}")]
    #[diagnostic(code(stowage::digest::mismatch))]
    DigestMismatch {
        /// The digest the content was expected to have.
        expected: String,
        /// The digest the content actually has.
        actual: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(stowage::io))]
    Io(#[from] std::io::Error),

    /// Blob store failure that is not a plain I/O error.
    #[error("Store error: {message}")]
    #[diagnostic(code(stowage::store))]
    Store {
        /// The error message.
        message: String,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(stowage::serialization))]
    Serialization(String),

    /// Operation not supported by this implementation.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(stowage::unsupported))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },
}

impl From<serde_json::Error> for StowageError {
    fn from(err: serde_json::Error) -> Self {
        StowageError::Serialization(err.to_string())
    }
}

impl StowageError {
    /// Whether this error is a layer lookup miss.
    #[must_use]
    pub fn is_layer_not_found(&self) -> bool {
        matches!(self, StowageError::LayerNotFound { .. })
    }
}
