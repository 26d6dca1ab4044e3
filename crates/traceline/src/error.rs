//! Error types for tracing operations.

use thiserror::Error;

/// Lifecycle and input errors reported to instrumentation call sites.
///
/// None of these are fatal: the entity that triggered the error is left
/// unchanged and the surrounding call chain continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TraceError {
    /// A close was requested on an entity that already left the `Open` state.
    #[error("`{name}` is already closed")]
    AlreadyClosed {
        /// Name of the entity the close targeted.
        name: String,
    },

    /// A mutation or child creation targeted an entity that is not `Open`.
    #[error("`{name}` is not open")]
    NotOpen {
        /// Name of the entity the operation targeted.
        name: String,
    },

    /// The annotation or metadata key is empty, too long, or contains
    /// characters other than ASCII alphanumerics and underscores.
    #[error("invalid annotation key `{0}`")]
    InvalidAnnotationKey(String),
}

impl TraceError {
    /// Returns `true` if the error is a lifecycle violation (as opposed to
    /// malformed input such as a bad annotation key).
    #[inline]
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Self::AlreadyClosed { .. } | Self::NotOpen { .. })
    }
}

/// Errors raised while turning a closed tree into collector datagrams.
///
/// These never reach the instrumented call path; the emitter counts and
/// logs them and drops the affected document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EmitError {
    /// A single entity alone serializes above the packet limit. Splitting
    /// cannot help; the document is dropped rather than truncated.
    #[error("`{name}` serializes to {size} bytes, over the {limit} byte packet limit")]
    Oversized {
        /// Name of the oversized entity.
        name: String,
        /// Framed size of the document in bytes.
        size: usize,
        /// Configured packet limit in bytes.
        limit: usize,
    },

    /// The document could not be encoded as JSON.
    #[error("serialization failed: {0}")]
    Serialization(String),
}
