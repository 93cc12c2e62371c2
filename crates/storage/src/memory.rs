//! In-memory object store used by tests
//!
//! Honours the same contracts as the real backend: writers commit
//! atomically on finish, deletes of absent objects succeed, and listing
//! is unordered. Fault hooks let tests exercise error paths.

use crate::{ObjectAttrs, ObjectReader, ObjectStore, ObjectWriter};
use async_trait::async_trait;
use chrono::Utc;
use forgecache_core::{Error, Result};
use futures::stream::BoxStream;
use futures::StreamExt;
use sha2::{Digest as Sha2Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    attrs: ObjectAttrs,
}

/// Kind of failure to inject for a single operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Retriable failure (timeout, 5xx)
    Transient,
    /// Non-retriable failure (authorization)
    Permanent,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, StoredObject>,
    faults: HashMap<String, FaultKind>,
}

/// Object store backed by process memory
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Arrange for the next call of `operation` to fail
    ///
    /// Operation names match the trait methods: `open_reader`,
    /// `open_writer`, `update_user_metadata`, `stat`, `delete`, `iterate`.
    pub fn fail_next(&self, operation: &str, kind: FaultKind) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.faults.insert(operation.to_string(), kind);
    }

    /// Number of stored objects
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock poisoned").objects.len()
    }

    /// Whether the store holds no objects
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Directly overwrite an object's user metadata (test setup helper)
    pub fn set_user_metadata(&self, name: &str, metadata: HashMap<String, String>) {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        if let Some(object) = inner.objects.get_mut(name) {
            object.attrs.user_metadata = metadata;
        }
    }

    fn take_fault(&self, operation: &str) -> Option<Error> {
        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.faults.remove(operation).map(|kind| match kind {
            FaultKind::Transient => Error::backend_transient(operation, "injected fault"),
            FaultKind::Permanent => Error::backend_permanent(operation, "injected fault"),
        })
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn open_reader(&self, name: &str) -> Result<(ObjectReader, ObjectAttrs)> {
        if let Some(err) = self.take_fault("open_reader") {
            return Err(err);
        }

        let inner = self.inner.lock().expect("store lock poisoned");
        let object = inner
            .objects
            .get(name)
            .ok_or_else(|| Error::not_found(name))?;

        let reader: ObjectReader = Box::new(std::io::Cursor::new(object.data.clone()));
        Ok((reader, object.attrs.clone()))
    }

    async fn open_writer(
        &self,
        name: &str,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<Box<dyn ObjectWriter>> {
        if let Some(err) = self.take_fault("open_writer") {
            return Err(err);
        }

        Ok(Box::new(MemoryWriter {
            store: self.inner.clone(),
            name: name.to_string(),
            content_type: content_type.to_string(),
            user_metadata,
            buf: Vec::new(),
        }))
    }

    async fn update_user_metadata(
        &self,
        name: &str,
        patch: HashMap<String, String>,
    ) -> Result<()> {
        if let Some(err) = self.take_fault("update_user_metadata") {
            return Err(err);
        }

        let mut inner = self.inner.lock().expect("store lock poisoned");
        let object = inner
            .objects
            .get_mut(name)
            .ok_or_else(|| Error::not_found(name))?;

        object.attrs.user_metadata.extend(patch);
        object.attrs.updated = Utc::now();
        Ok(())
    }

    async fn stat(&self, name: &str) -> Result<ObjectAttrs> {
        if let Some(err) = self.take_fault("stat") {
            return Err(err);
        }

        let inner = self.inner.lock().expect("store lock poisoned");
        inner
            .objects
            .get(name)
            .map(|object| object.attrs.clone())
            .ok_or_else(|| Error::not_found(name))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if let Some(err) = self.take_fault("delete") {
            return Err(err);
        }

        let mut inner = self.inner.lock().expect("store lock poisoned");
        inner.objects.remove(name);
        Ok(())
    }

    async fn iterate(&self, prefix: &str) -> Result<BoxStream<'static, Result<ObjectAttrs>>> {
        if let Some(err) = self.take_fault("iterate") {
            return Err(err);
        }

        let inner = self.inner.lock().expect("store lock poisoned");
        let attrs: Vec<ObjectAttrs> = inner
            .objects
            .values()
            .filter(|object| object.attrs.name.starts_with(prefix))
            .map(|object| object.attrs.clone())
            .collect();

        Ok(futures::stream::iter(attrs.into_iter().map(Ok)).boxed())
    }
}

/// Buffering writer; the object appears in the store only on finish
struct MemoryWriter {
    store: Arc<Mutex<Inner>>,
    name: String,
    content_type: String,
    user_metadata: HashMap<String, String>,
    buf: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<ObjectAttrs> {
        let now = Utc::now();
        let mut hasher = Sha256::new();
        hasher.update(&self.buf);

        let attrs = ObjectAttrs {
            name: self.name.clone(),
            size: self.buf.len() as u64,
            content_type: self.content_type,
            store_hash: format!("{:x}", hasher.finalize()),
            created: now,
            updated: now,
            user_metadata: self.user_metadata,
        };

        let mut inner = self.store.lock().expect("store lock poisoned");
        inner.objects.insert(
            self.name,
            StoredObject {
                data: self.buf,
                attrs: attrs.clone(),
            },
        );
        Ok(attrs)
    }
}
