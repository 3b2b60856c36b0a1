//! Object Validation Errors

use thiserror::Error;

/// Errors raised when validating object identity or preconditions.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Bucket name is empty.
    #[error("Bucket name is empty")]
    EmptyBucket,

    /// Object name is empty.
    #[error("Object name is empty")]
    EmptyObject,

    /// A precondition set has no conditions.
    #[error("Empty conditions")]
    EmptyConditions,

    /// Two preconditions cannot hold at once.
    #[error("Conflicting conditions: {first} and {second}")]
    ConflictingConditions {
        /// First condition.
        first: &'static str,
        /// Second condition.
        second: &'static str,
    },

    /// Customer-supplied key is not 32 bytes.
    #[error("Encryption key must be 32 bytes, got {len}")]
    InvalidKeyLength {
        /// Supplied length.
        len: usize,
    },
}
