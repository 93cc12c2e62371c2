//! Error taxonomy shared across the forgecache crates
//!
//! Internal code paths construct these kinds; the single translation to
//! transport codes happens at the RPC boundary.

use miette::Diagnostic;
use thiserror::Error;

/// Error type for cache, storage, and pruning operations
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// Digest failed syntactic validation
    #[error("invalid digest: {message}")]
    #[diagnostic(code(forgecache::invalid_digest))]
    InvalidDigest {
        /// What was wrong with the digest
        message: String,
    },

    /// Instance name failed validation
    #[error("invalid instance: {message}")]
    #[diagnostic(code(forgecache::invalid_instance))]
    InvalidInstance {
        /// What was wrong with the instance name
        message: String,
    },

    /// Malformed request: missing field, empty digest list, data before metadata
    #[error("invalid request: {message}")]
    #[diagnostic(code(forgecache::invalid_request))]
    InvalidRequest {
        /// What was missing or malformed
        message: String,
    },

    /// The entry does not exist; counted as a cache miss, not a failure
    #[error("not found: {key}")]
    #[diagnostic(code(forgecache::not_found))]
    NotFound {
        /// The object name or cache key that was absent
        key: String,
    },

    /// Uploaded bytes hash to something other than the declared digest
    #[error("digest mismatch: declared {expected}, computed {actual}")]
    #[diagnostic(
        code(forgecache::digest_mismatch),
        help("The client must re-hash its payload before retrying the upload")
    )]
    DigestMismatch {
        /// Digest the client declared
        expected: String,
        /// Digest computed over the received bytes
        actual: String,
    },

    /// Retriable backend failure (timeout, 5xx, connection reset)
    #[error("backend transiently unavailable during {operation}: {message}")]
    #[diagnostic(code(forgecache::backend_transient))]
    BackendTransient {
        /// Operation that failed
        operation: String,
        /// Underlying failure description
        message: String,
    },

    /// Non-retriable backend failure (authorization, misconfiguration)
    #[error("backend rejected {operation}: {message}")]
    #[diagnostic(code(forgecache::backend_permanent))]
    BackendPermanent {
        /// Operation that failed
        operation: String,
        /// Underlying failure description
        message: String,
    },

    /// RPC framing failure mid-stream
    #[error("stream error: {message}")]
    #[diagnostic(code(forgecache::stream))]
    Stream {
        /// What broke in the stream
        message: String,
    },

    /// Invalid or incomplete configuration
    #[error("configuration error: {message}")]
    #[diagnostic(code(forgecache::config))]
    Configuration {
        /// What was wrong with the configuration
        message: String,
    },
}

impl Error {
    /// Create an invalid-digest error
    #[must_use]
    pub fn invalid_digest(message: impl Into<String>) -> Self {
        Self::InvalidDigest {
            message: message.into(),
        }
    }

    /// Create an invalid-instance error
    #[must_use]
    pub fn invalid_instance(message: impl Into<String>) -> Self {
        Self::InvalidInstance {
            message: message.into(),
        }
    }

    /// Create an invalid-request error
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Create a not-found error
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Create a digest-mismatch error
    #[must_use]
    pub fn digest_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::DigestMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    /// Create a transient backend error
    #[must_use]
    pub fn backend_transient(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendTransient {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a permanent backend error
    #[must_use]
    pub fn backend_permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::BackendPermanent {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a stream error
    #[must_use]
    pub fn stream(message: impl Into<String>) -> Self {
        Self::Stream {
            message: message.into(),
        }
    }

    /// Create a configuration error
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this is an absent-entry outcome rather than a failure
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether a client observing this error may retry with backoff
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::BackendTransient { .. } | Self::Stream { .. })
    }

    /// Whether this error originated in request validation
    #[must_use]
    pub fn is_invalid(&self) -> bool {
        matches!(
            self,
            Self::InvalidDigest { .. }
                | Self::InvalidInstance { .. }
                | Self::InvalidRequest { .. }
                | Self::DigestMismatch { .. }
        )
    }
}

/// Result type for forgecache operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_predicate() {
        assert!(Error::not_found("cache/teamA/abc").is_not_found());
        assert!(!Error::stream("reset").is_not_found());
    }

    #[test]
    fn test_transient_predicate() {
        assert!(Error::backend_transient("stat", "503").is_transient());
        assert!(Error::stream("mid-stream reset").is_transient());
        assert!(!Error::backend_permanent("stat", "403").is_transient());
        assert!(!Error::invalid_digest("short").is_transient());
    }

    #[test]
    fn test_invalid_predicate() {
        assert!(Error::invalid_digest("short").is_invalid());
        assert!(Error::invalid_instance("empty").is_invalid());
        assert!(Error::invalid_request("no metadata").is_invalid());
        assert!(Error::digest_mismatch("aa", "bb").is_invalid());
        assert!(!Error::not_found("k").is_invalid());
    }

    #[test]
    fn test_display_includes_context() {
        let err = Error::digest_mismatch("a".repeat(4), "b".repeat(4));
        let rendered = err.to_string();
        assert!(rendered.contains("aaaa"));
        assert!(rendered.contains("bbbb"));
    }
}
