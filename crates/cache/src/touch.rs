//! Bounded, best-effort last-accessed updates
//!
//! Reads enqueue a touch and move on. A fixed pool of workers drains the
//! queue and patches object metadata; when the queue is full the touch is
//! dropped. Failures only degrade LRU accuracy, so nothing here is ever
//! surfaced to the read path.

use chrono::Utc;
use forgecache_storage::{ObjectStore, META_LAST_ACCESSED};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

const WORKERS: usize = 4;
const QUEUE_CAPACITY: usize = 256;

/// Fire-and-forget queue of last-accessed metadata updates
#[derive(Clone)]
pub struct TouchPool {
    tx: mpsc::Sender<String>,
}

impl TouchPool {
    /// Spawn the worker pool against the given store
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self::with_capacity(store, WORKERS, QUEUE_CAPACITY)
    }

    /// Spawn with explicit worker count and queue capacity
    #[must_use]
    pub fn with_capacity(store: Arc<dyn ObjectStore>, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<String>(capacity);
        let rx = Arc::new(Mutex::new(rx));

        for _ in 0..workers.max(1) {
            let store = store.clone();
            let rx = rx.clone();
            tokio::spawn(async move {
                loop {
                    let name = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(name) = name else { break };

                    let mut patch = HashMap::new();
                    patch.insert(META_LAST_ACCESSED.to_string(), Utc::now().to_rfc3339());

                    if let Err(err) = store.update_user_metadata(&name, patch).await {
                        debug!(name = %name, error = %err, "Failed to update last accessed time");
                    }
                }
            });
        }

        Self { tx }
    }

    /// Enqueue a touch for the named object; drops silently when the
    /// queue is full or the workers have shut down
    pub fn enqueue(&self, name: String) {
        if let Err(err) = self.tx.try_send(name) {
            debug!(error = %err, "Dropped last-accessed update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forgecache_storage::MemoryStore;
    use std::time::Duration;

    async fn seed(store: &MemoryStore, name: &str) {
        let mut writer = store
            .open_writer(name, "application/octet-stream", HashMap::new())
            .await
            .unwrap();
        writer.write(b"x").await.unwrap();
        writer.finish().await.unwrap();
    }

    #[tokio::test]
    async fn test_touch_records_last_accessed() {
        let store = MemoryStore::new();
        seed(&store, "cache/teamA/abc").await;

        let pool = TouchPool::new(Arc::new(store.clone()));
        pool.enqueue("cache/teamA/abc".to_string());

        // Workers run asynchronously; poll briefly for the patch
        for _ in 0..50 {
            let attrs = store.stat("cache/teamA/abc").await.unwrap();
            if attrs.user_metadata.contains_key(META_LAST_ACCESSED) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("last_accessed was never patched");
    }

    #[tokio::test]
    async fn test_touch_of_absent_object_is_silent() {
        let store = MemoryStore::new();
        let pool = TouchPool::new(Arc::new(store.clone()));

        pool.enqueue("cache/teamA/gone".to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Nothing to assert beyond the absence of a panic; the failure
        // must be swallowed by the pool
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let store = MemoryStore::new();
        let pool = TouchPool::with_capacity(Arc::new(store), 1, 1);

        // Far more enqueues than capacity; must return immediately
        for i in 0..100 {
            pool.enqueue(format!("cache/teamA/{i}"));
        }
    }
}
