//! Content-addressed digest type and instance-name validation

use crate::error::{Error, Result};
use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;

/// A content-addressed digest (SHA-256 hash + size)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// SHA-256 hash, lowercase hex
    pub hash: String,

    /// Size of the content in bytes
    pub size_bytes: i64,
}

impl Digest {
    /// Create a new digest from hash and size
    ///
    /// The hash must be exactly 64 lowercase hex characters and the size
    /// must be non-negative.
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Result<Self> {
        let hash = hash.into();

        if hash.len() != 64 || !hash.bytes().all(|b| matches!(b, b'a'..=b'f' | b'0'..=b'9')) {
            return Err(Error::invalid_digest(format!(
                "expected 64 lowercase hex characters, got '{hash}'"
            )));
        }

        if size_bytes < 0 {
            return Err(Error::invalid_digest(format!(
                "size must be non-negative, got {size_bytes}"
            )));
        }

        Ok(Self { hash, size_bytes })
    }

    /// Re-check the syntactic invariants on an existing digest
    ///
    /// Useful at service boundaries where a digest may have been built
    /// directly from wire data.
    pub fn validate(&self) -> Result<()> {
        Self::new(self.hash.clone(), self.size_bytes).map(|_| ())
    }

    /// Compute the digest of a byte slice
    #[must_use]
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let hash = format!("{:x}", hasher.finalize());

        Self {
            hash,
            size_bytes: bytes.len() as i64,
        }
    }

    /// Check if this is the digest of the empty blob
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    /// Get the hash string
    #[must_use]
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Get the advisory size in bytes
    #[must_use]
    pub fn size(&self) -> i64 {
        self.size_bytes
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

/// Validate a cache instance name
///
/// Instances partition the key space per tenant. A valid name consists of
/// ASCII alphanumerics, `_`, `-`, and `/`, and contains no `..` component.
pub fn validate_instance(instance: &str) -> Result<()> {
    if instance.is_empty() {
        return Err(Error::invalid_instance("instance name must not be empty"));
    }

    if !instance
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'/'))
    {
        return Err(Error::invalid_instance(format!(
            "instance name '{instance}' contains invalid characters"
        )));
    }

    if instance.split('/').any(|component| component == "..") {
        return Err(Error::invalid_instance(format!(
            "instance name '{instance}' contains a '..' component"
        )));
    }

    Ok(())
}
