//! Object Identity
//!
//! What a stream targets: bucket, object, generation, preconditions,
//! customer-supplied encryption key, and the opaque handles the server
//! returns to speed up reopening.

mod errors;

pub use errors::ValidationError;

use bytes::Bytes;
use sha2::{Digest, Sha256};

/// Project alias used in bucket resource names.
pub const GLOBAL_PROJECT_ALIAS: &str = "_";

/// Resource name of a bucket: `projects/_/buckets/{bucket}`.
#[must_use]
pub fn bucket_resource_name(bucket: &str) -> String {
    format!("projects/{GLOBAL_PROJECT_ALIAS}/buckets/{bucket}")
}

// =============================================================================
// Object Spec
// =============================================================================

/// Identifies an object and how to access it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSpec {
    /// Bucket name (not the resource name).
    pub bucket: String,
    /// Object name.
    pub object: String,
    /// Specific generation; `None` targets the live version.
    pub generation: Option<i64>,
    /// Preconditions on the live version.
    pub conditions: Option<Conditions>,
    /// Customer-supplied encryption key.
    pub encryption_key: Option<EncryptionKey>,
    /// Handle from an earlier read of this object.
    pub read_handle: Option<ReadHandle>,
}

impl ObjectSpec {
    /// Spec for the live version of `bucket/object`.
    #[must_use]
    pub fn new(bucket: impl Into<String>, object: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            object: object.into(),
            generation: None,
            conditions: None,
            encryption_key: None,
            read_handle: None,
        }
    }

    /// `projects/_/buckets/{bucket}`.
    #[must_use]
    pub fn bucket_resource(&self) -> String {
        bucket_resource_name(&self.bucket)
    }

    /// Check names and preconditions.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] for empty names or invalid conditions.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.bucket.is_empty() {
            return Err(ValidationError::EmptyBucket);
        }
        if self.object.is_empty() {
            return Err(ValidationError::EmptyObject);
        }
        if let Some(conditions) = &self.conditions {
            conditions.validate()?;
        }
        Ok(())
    }
}

// =============================================================================
// Conditions
// =============================================================================

/// Preconditions evaluated by the server against the live object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Conditions {
    /// Live generation must equal this.
    pub generation_match: Option<i64>,
    /// Live generation must differ from this.
    pub generation_not_match: Option<i64>,
    /// The object must not exist yet.
    pub does_not_exist: bool,
    /// Live metageneration must equal this.
    pub metageneration_match: Option<i64>,
    /// Live metageneration must differ from this.
    pub metageneration_not_match: Option<i64>,
}

impl Conditions {
    /// Reject empty or contradictory sets.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::EmptyConditions`] or
    /// [`ValidationError::ConflictingConditions`].
    pub const fn validate(&self) -> Result<(), ValidationError> {
        let generation_set = self.generation_match.is_some() || self.generation_not_match.is_some();
        if !generation_set
            && !self.does_not_exist
            && self.metageneration_match.is_none()
            && self.metageneration_not_match.is_none()
        {
            return Err(ValidationError::EmptyConditions);
        }
        if self.generation_match.is_some() && self.generation_not_match.is_some() {
            return Err(ValidationError::ConflictingConditions {
                first: "generation_match",
                second: "generation_not_match",
            });
        }
        if self.does_not_exist && generation_set {
            return Err(ValidationError::ConflictingConditions {
                first: "does_not_exist",
                second: "generation condition",
            });
        }
        if self.metageneration_match.is_some() && self.metageneration_not_match.is_some() {
            return Err(ValidationError::ConflictingConditions {
                first: "metageneration_match",
                second: "metageneration_not_match",
            });
        }
        Ok(())
    }

    /// Value for `if_generation_match`; `does_not_exist` is generation 0.
    #[must_use]
    pub const fn if_generation_match(&self) -> Option<i64> {
        if self.does_not_exist {
            Some(0)
        } else {
            self.generation_match
        }
    }
}

// =============================================================================
// Encryption Key
// =============================================================================

/// Customer-supplied AES-256 key.
#[derive(Clone, PartialEq, Eq)]
pub struct EncryptionKey([u8; 32]);

impl EncryptionKey {
    /// Algorithm name sent with the key.
    pub const ALGORITHM: &'static str = "AES256";

    /// Wrap raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::InvalidKeyLength`] unless `key` is 32 bytes.
    pub fn new(key: &[u8]) -> Result<Self, ValidationError> {
        let bytes: [u8; 32] = key
            .try_into()
            .map_err(|_| ValidationError::InvalidKeyLength { len: key.len() })?;
        Ok(Self(bytes))
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// SHA-256 of the key.
    #[must_use]
    pub fn sha256(&self) -> [u8; 32] {
        Sha256::digest(self.0).into()
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

// =============================================================================
// Handles
// =============================================================================

/// Opaque read handle returned by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ReadHandle(Bytes);

impl ReadHandle {
    /// Wrap handle bytes.
    #[must_use]
    pub const fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Handle bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Whether the server sent no handle.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Opaque write handle returned by the server for appendable objects.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct WriteHandle(Bytes);

impl WriteHandle {
    /// Wrap handle bytes.
    #[must_use]
    pub const fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Handle bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}
