//! Object-store adapter for forgecache
//!
//! Presents a uniform seam over an external blob store: streamed reads,
//! atomically committed writes, metadata patching, and lazy iteration.
//! Two implementations ship here: [`GcsStore`] for Google Cloud Storage
//! and [`MemoryStore`] for tests.
//!
//! The adapter never retries; retry policy belongs to callers. Errors are
//! classified into `NotFound`, transient, and permanent kinds so callers
//! can make that decision.

mod auth;
mod gcs;
mod memory;

pub use gcs::GcsStore;
pub use memory::{FaultKind, MemoryStore};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgecache_core::{Error, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::io::AsyncRead;

/// User-metadata key recording the original cache key
pub const META_CACHE_KEY: &str = "cache_key";
/// User-metadata key recording the commit time, RFC 3339
pub const META_STORED_AT: &str = "stored_at";
/// User-metadata key recording the most recent read, RFC 3339
pub const META_LAST_ACCESSED: &str = "last_accessed";

/// Streamed object contents
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Attributes of a stored object
#[derive(Debug, Clone)]
pub struct ObjectAttrs {
    /// Full object name within the bucket
    pub name: String,
    /// Authoritative size in bytes
    pub size: u64,
    /// Content type recorded at write time
    pub content_type: String,
    /// Store-reported content hash; audit only, never authorization
    pub store_hash: String,
    /// Store-assigned creation time
    pub created: DateTime<Utc>,
    /// Store-assigned last mutation time
    pub updated: DateTime<Utc>,
    /// Opaque user metadata
    pub user_metadata: HashMap<String, String>,
}

impl ObjectAttrs {
    /// Time of the most recent recorded access, falling back to the
    /// store's update timestamp when the metadata field is absent or
    /// unparsable
    #[must_use]
    pub fn last_accessed(&self) -> DateTime<Utc> {
        self.parse_meta_time(META_LAST_ACCESSED).unwrap_or(self.updated)
    }

    /// Commit time as recorded in user metadata, falling back to the
    /// store's creation timestamp
    #[must_use]
    pub fn stored_at(&self) -> DateTime<Utc> {
        self.parse_meta_time(META_STORED_AT).unwrap_or(self.created)
    }

    fn parse_meta_time(&self, key: &str) -> Option<DateTime<Utc>> {
        self.user_metadata
            .get(key)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|t| t.with_timezone(&Utc))
    }
}

/// An in-progress object write
///
/// Bytes are buffered by the implementation; nothing becomes visible in
/// the store until [`ObjectWriter::finish`] returns. Dropping a writer
/// without finishing aborts the write and leaves no partial object.
#[async_trait]
pub trait ObjectWriter: Send {
    /// Append a chunk to the pending object
    async fn write(&mut self, chunk: &[u8]) -> Result<()>;

    /// Commit the object atomically and return its attributes
    async fn finish(self: Box<Self>) -> Result<ObjectAttrs>;
}

/// Uniform interface over an external blob store
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a streamed reader for an object along with its attributes
    async fn open_reader(&self, name: &str) -> Result<(ObjectReader, ObjectAttrs)>;

    /// Begin an atomic write; see [`ObjectWriter`]
    async fn open_writer(
        &self,
        name: &str,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<Box<dyn ObjectWriter>>;

    /// Merge the given fields into an object's user metadata
    ///
    /// Callers treat failures here as non-fatal; they only degrade LRU
    /// accuracy.
    async fn update_user_metadata(
        &self,
        name: &str,
        patch: HashMap<String, String>,
    ) -> Result<()>;

    /// Fetch an object's attributes without transferring its bytes
    async fn stat(&self, name: &str) -> Result<ObjectAttrs>;

    /// Delete an object; deleting an absent object is success
    async fn delete(&self, name: &str) -> Result<()>;

    /// Lazily iterate attributes of every object under a prefix
    ///
    /// The sequence is finite but not time-sorted; pagination is internal.
    async fn iterate(&self, prefix: &str) -> Result<BoxStream<'static, Result<ObjectAttrs>>>;

    /// Total size in bytes of all objects under a prefix
    ///
    /// The default implementation sums [`ObjectStore::iterate`] and is
    /// therefore O(n) in the number of objects.
    async fn total_size(&self, prefix: &str) -> Result<u64> {
        let mut stream = self.iterate(prefix).await?;
        let mut total = 0u64;
        while let Some(attrs) = stream.next().await {
            total += attrs?.size;
        }
        Ok(total)
    }
}

/// Classify an HTTP status from the backing store into an error kind
pub(crate) fn classify_status(operation: &str, status: u16, detail: &str) -> Error {
    match status {
        404 => Error::not_found(detail),
        401 | 403 => Error::backend_permanent(
            operation,
            format!("store returned HTTP {status}"),
        ),
        408 | 429 | 500..=599 => Error::backend_transient(
            operation,
            format!("store returned HTTP {status}: {detail}"),
        ),
        _ => Error::backend_permanent(
            operation,
            format!("store returned unexpected HTTP {status}: {detail}"),
        ),
    }
}
