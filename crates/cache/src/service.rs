//! The cache service: validated streaming I/O over the object store

use crate::keys::{action_result_name, object_name};
use crate::touch::TouchPool;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use forgecache_core::metrics::CacheOp;
use forgecache_core::{validate_instance, Digest, Error, MetricsCollector, Result};
use forgecache_storage::{
    ObjectAttrs, ObjectReader, ObjectStore, META_CACHE_KEY, META_LAST_ACCESSED, META_STORED_AT,
};
use futures::{Stream, StreamExt};
use sha2::{Digest as Sha2Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tracing::{debug, instrument};

/// A cached build artifact as seen by callers
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Original cache key (`instance/hash`)
    pub key: String,
    /// Authoritative byte length
    pub size: u64,
    /// Most recent successful read, or store time for unread entries
    pub last_accessed: DateTime<Utc>,
    /// Content type echoed back from the write
    pub content_type: String,
    /// Store-reported content hash, audit only
    pub hash: String,
}

impl CacheEntry {
    fn from_attrs(attrs: &ObjectAttrs) -> Self {
        Self {
            key: attrs
                .user_metadata
                .get(META_CACHE_KEY)
                .cloned()
                .unwrap_or_else(|| attrs.name.clone()),
            size: attrs.size,
            last_accessed: attrs.last_accessed(),
            content_type: attrs.content_type.clone(),
            hash: attrs.store_hash.clone(),
        }
    }
}

/// Cache operations over a content-addressable object store
///
/// Calls are independent; there is no state shared across requests beyond
/// the store itself and the metric collectors.
pub struct CacheService {
    store: Arc<dyn ObjectStore>,
    metrics: MetricsCollector,
    touch: TouchPool,
}

impl CacheService {
    /// Create a service over the given store
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>, metrics: MetricsCollector) -> Self {
        let touch = TouchPool::new(store.clone());
        Self {
            store,
            metrics,
            touch,
        }
    }

    /// Retrieve a cache entry as a byte stream
    ///
    /// A successful open enqueues a best-effort `last_accessed` update
    /// that never surfaces failures to this caller.
    #[instrument(skip(self), fields(hash = %digest.hash))]
    pub async fn get(
        &self,
        instance: &str,
        digest: &Digest,
    ) -> Result<(ObjectReader, CacheEntry)> {
        self.timed(CacheOp::Get, self.get_inner(instance, digest)).await
    }

    async fn get_inner(
        &self,
        instance: &str,
        digest: &Digest,
    ) -> Result<(ObjectReader, CacheEntry)> {
        validate_instance(instance)?;
        digest.validate()?;

        let name = object_name(instance, &digest.hash);
        self.open_entry(name).await
    }

    /// Shared read path for content and action-result entries
    async fn open_entry(&self, name: String) -> Result<(ObjectReader, CacheEntry)> {
        match self.store.stat(&name).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                self.metrics.record_cache_lookup(false);
                debug!(key = %name, "Cache miss");
                return Err(err);
            }
            Err(err) => return Err(err),
        }

        let (reader, attrs) = self.store.open_reader(&name).await?;
        self.touch.enqueue(name.clone());
        self.metrics.record_cache_lookup(true);

        debug!(key = %name, size = attrs.size, "Cache hit");
        Ok((reader, CacheEntry::from_attrs(&attrs)))
    }

    /// Store a cache entry from a chunk stream
    ///
    /// The received bytes are hashed while being copied to the store
    /// writer; a mismatch against the declared digest aborts the write
    /// before anything becomes visible. Returns the committed size.
    #[instrument(skip(self, chunks), fields(hash = %digest.hash))]
    pub async fn put<S>(
        &self,
        instance: &str,
        digest: &Digest,
        chunks: S,
        content_type: &str,
    ) -> Result<u64>
    where
        S: Stream<Item = Result<Bytes>> + Send + Unpin,
    {
        self.timed(CacheOp::Put, self.put_inner(instance, digest, chunks, content_type))
            .await
    }

    async fn put_inner<S>(
        &self,
        instance: &str,
        digest: &Digest,
        mut chunks: S,
        content_type: &str,
    ) -> Result<u64>
    where
        S: Stream<Item = Result<Bytes>> + Send + Unpin,
    {
        validate_instance(instance)?;
        digest.validate()?;

        let name = object_name(instance, &digest.hash);
        let now = Utc::now().to_rfc3339();
        let mut metadata = HashMap::new();
        metadata.insert(
            META_CACHE_KEY.to_string(),
            format!("{instance}/{}", digest.hash),
        );
        metadata.insert(META_STORED_AT.to_string(), now.clone());
        metadata.insert(META_LAST_ACCESSED.to_string(), now);

        let mut writer = self.store.open_writer(&name, content_type, metadata).await?;

        let mut hasher = Sha256::new();
        let mut total = 0u64;
        while let Some(chunk) = chunks.next().await {
            // A stream error drops the writer, so no partial object can
            // become visible
            let chunk = chunk?;
            hasher.update(&chunk);
            writer.write(&chunk).await?;
            total += chunk.len() as u64;
        }

        let computed = format!("{:x}", hasher.finalize());
        if computed != digest.hash {
            return Err(Error::digest_mismatch(&digest.hash, computed));
        }

        let attrs = writer.finish().await?;
        self.metrics.record_cache_write();
        self.metrics.add_bytes_stored(total);

        debug!(key = %name, size = total, "Cache write");
        Ok(attrs.size)
    }

    /// Check which of the given digests exist under the instance
    ///
    /// Existence is probed with `stat` only; no bytes move and no
    /// `last_accessed` update happens. Results preserve input order.
    #[instrument(skip(self, digests), fields(digest_count = digests.len()))]
    pub async fn contains(&self, instance: &str, digests: &[Digest]) -> Result<Vec<bool>> {
        self.timed(CacheOp::Contains, self.contains_inner(instance, digests))
            .await
    }

    async fn contains_inner(&self, instance: &str, digests: &[Digest]) -> Result<Vec<bool>> {
        validate_instance(instance)?;
        if digests.is_empty() {
            return Err(Error::invalid_request("at least one digest is required"));
        }

        let mut results = Vec::with_capacity(digests.len());
        for digest in digests {
            digest.validate()?;
            let name = object_name(instance, &digest.hash);
            match self.store.stat(&name).await {
                Ok(_) => results.push(true),
                Err(err) if err.is_not_found() => results.push(false),
                Err(Error::BackendPermanent { .. }) => {
                    // A per-entry authorization failure reads as absent;
                    // the client will fall back to uploading
                    debug!(key = %name, "Existence probe rejected, reporting absent");
                    results.push(false);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(results)
    }

    /// Retrieve a previously stored action result as opaque bytes
    #[instrument(skip(self), fields(hash = %action_digest.hash))]
    pub async fn get_action_result(
        &self,
        instance: &str,
        action_digest: &Digest,
    ) -> Result<Vec<u8>> {
        self.timed(
            CacheOp::GetActionResult,
            self.get_action_result_inner(instance, action_digest),
        )
        .await
    }

    async fn get_action_result_inner(
        &self,
        instance: &str,
        action_digest: &Digest,
    ) -> Result<Vec<u8>> {
        validate_instance(instance)?;
        action_digest.validate()?;

        let name = action_result_name(instance, &action_digest.hash);
        let (mut reader, entry) = self.open_entry(name).await?;

        let mut payload = Vec::with_capacity(entry.size as usize);
        reader
            .read_to_end(&mut payload)
            .await
            .map_err(|e| Error::backend_transient("read", e.to_string()))?;
        Ok(payload)
    }

    /// Store an action result keyed by its action digest
    ///
    /// The payload is opaque; the digest names the action, not the
    /// payload, so no content-hash check applies here.
    #[instrument(skip(self, payload), fields(hash = %action_digest.hash))]
    pub async fn update_action_result(
        &self,
        instance: &str,
        action_digest: &Digest,
        payload: Bytes,
    ) -> Result<u64> {
        self.timed(
            CacheOp::UpdateActionResult,
            self.update_action_result_inner(instance, action_digest, payload),
        )
        .await
    }

    async fn update_action_result_inner(
        &self,
        instance: &str,
        action_digest: &Digest,
        payload: Bytes,
    ) -> Result<u64> {
        validate_instance(instance)?;
        action_digest.validate()?;

        let name = action_result_name(instance, &action_digest.hash);
        let now = Utc::now().to_rfc3339();
        let mut metadata = HashMap::new();
        metadata.insert(
            META_CACHE_KEY.to_string(),
            format!("{instance}/action_result/{}", action_digest.hash),
        );
        metadata.insert(META_STORED_AT.to_string(), now.clone());
        metadata.insert(META_LAST_ACCESSED.to_string(), now);

        let mut writer = self
            .store
            .open_writer(&name, "application/octet-stream", metadata)
            .await?;
        writer.write(&payload).await?;
        let attrs = writer.finish().await?;

        self.metrics.record_cache_write();
        self.metrics.add_bytes_stored(payload.len() as u64);

        debug!(key = %name, size = attrs.size, "Action result write");
        Ok(attrs.size)
    }

    /// Remove a cache entry; administrative, not exposed over RPC
    #[instrument(skip(self), fields(hash = %digest.hash))]
    pub async fn delete(&self, instance: &str, digest: &Digest) -> Result<()> {
        self.timed(CacheOp::Delete, self.delete_inner(instance, digest))
            .await
    }

    async fn delete_inner(&self, instance: &str, digest: &Digest) -> Result<()> {
        validate_instance(instance)?;
        digest.validate()?;

        let name = object_name(instance, &digest.hash);
        self.store.delete(&name).await?;
        self.metrics.record_cache_deletion();

        debug!(key = %name, "Cache delete");
        Ok(())
    }

    /// Observe duration and error counters around an operation
    async fn timed<T, F>(&self, op: CacheOp, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let start = Instant::now();
        let result = operation.await;
        self.metrics.observe_cache_op(op, start.elapsed());

        if let Err(err) = &result {
            // A miss is an expected outcome, not an error
            if !err.is_not_found() {
                self.metrics.record_cache_error(op);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgecache_storage::MemoryStore;

    fn chunk_stream(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = Result<Bytes>> + Send + Unpin {
        futures::stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    fn service() -> (CacheService, MemoryStore) {
        let store = MemoryStore::new();
        let service = CacheService::new(Arc::new(store.clone()), MetricsCollector::new());
        (service, store)
    }

    #[tokio::test]
    async fn test_put_rejects_invalid_instance() {
        let (service, _) = service();
        let digest = Digest::from_bytes(b"x");
        let err = service
            .put("bad instance", &digest, chunk_stream(vec![b"x"]), "text/plain")
            .await
            .unwrap_err();
        assert!(err.is_invalid());
    }

    #[tokio::test]
    async fn test_get_rejects_malformed_digest() {
        let (service, _) = service();
        let digest = Digest {
            hash: "not-hex".into(),
            size_bytes: 1,
        };
        let err = service.get("teamA", &digest).await.unwrap_err();
        assert!(err.is_invalid());
    }

    #[tokio::test]
    async fn test_digest_mismatch_aborts_before_commit() {
        let (service, store) = service();
        let declared = Digest::from_bytes(b"A");

        let err = service
            .put("teamA", &declared, chunk_stream(vec![b"B"]), "text/plain")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DigestMismatch { .. }));
        assert!(store.is_empty());

        // The declared digest must remain a miss
        let err = service.get("teamA", &declared).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_stream_error_aborts_put() {
        let (service, store) = service();
        let digest = Digest::from_bytes(b"abcdef");

        let chunks = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(Error::stream("connection reset")),
        ]);
        let err = service
            .put("teamA", &digest, chunks, "text/plain")
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_contains_empty_list_rejected() {
        let (service, _) = service();
        let err = service.contains("teamA", &[]).await.unwrap_err();
        assert!(err.is_invalid());
    }

    #[tokio::test]
    async fn test_contains_permanent_error_reads_as_absent() {
        let (service, store) = service();
        let digest = Digest::from_bytes(b"payload");
        service
            .put("teamA", &digest, chunk_stream(vec![b"payload"]), "text/plain")
            .await
            .unwrap();

        store.fail_next("stat", forgecache_storage::FaultKind::Permanent);
        let results = service.contains("teamA", &[digest]).await.unwrap();
        assert_eq!(results, vec![false]);
    }

    #[tokio::test]
    async fn test_contains_transient_error_fails_call() {
        let (service, store) = service();
        let digest = Digest::from_bytes(b"payload");

        store.fail_next("stat", forgecache_storage::FaultKind::Transient);
        let err = service.contains("teamA", &[digest]).await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_action_result_round_trip() {
        let (service, _) = service();
        let action_digest = Digest::from_bytes(b"the action definition");
        let payload = Bytes::from_static(b"serialized action result");

        service
            .update_action_result("teamA", &action_digest, payload.clone())
            .await
            .unwrap();

        let fetched = service
            .get_action_result("teamA", &action_digest)
            .await
            .unwrap();
        assert_eq!(fetched, payload.as_ref());
    }

    #[tokio::test]
    async fn test_action_results_do_not_shadow_content() {
        let (service, _) = service();
        let digest = Digest::from_bytes(b"blob");

        service
            .update_action_result("teamA", &digest, Bytes::from_static(b"result"))
            .await
            .unwrap();

        // The content namespace stays empty
        let err = service.get("teamA", &digest).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_delete_then_miss() {
        let (service, _) = service();
        let digest = Digest::from_bytes(b"to be removed");
        service
            .put("teamA", &digest, chunk_stream(vec![b"to be removed"]), "text/plain")
            .await
            .unwrap();

        service.delete("teamA", &digest).await.unwrap();
        assert!(service.get("teamA", &digest).await.unwrap_err().is_not_found());
    }
}
