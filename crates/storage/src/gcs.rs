//! Google Cloud Storage implementation of the object-store adapter
//!
//! Talks to the GCS JSON API directly: streamed media reads, resumable
//! uploads for atomic commits, metadata patches, and paginated listing.
//! An uncommitted resumable session never surfaces an object, which is
//! what gives writers their all-or-nothing contract.

use crate::auth::TokenProvider;
use crate::{classify_status, ObjectAttrs, ObjectReader, ObjectStore, ObjectWriter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forgecache_core::{Error, Result};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::io::StreamReader;
use tracing::{debug, instrument, warn};

const DEFAULT_BASE_URL: &str = "https://storage.googleapis.com";

/// Objects listed per page
const PAGE_SIZE: usize = 1000;

/// Bytes per intermediate resumable-upload chunk; GCS requires a multiple
/// of 256 KiB for every chunk except the last
const UPLOAD_CHUNK: usize = 8 * 1024 * 1024;

/// Shared request context, cheap to clone into streams and writers
#[derive(Clone)]
struct GcsClient {
    http: reqwest::Client,
    bucket: String,
    base_url: String,
    auth: Option<Arc<TokenProvider>>,
}

impl GcsClient {
    fn object_url(&self, name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.base_url,
            self.bucket,
            encode_path_segment(name)
        )
    }

    fn list_url(&self) -> String {
        format!("{}/storage/v1/b/{}/o", self.base_url, self.bucket)
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o",
            self.base_url, self.bucket
        )
    }

    async fn authorize(&self, request: reqwest::RequestBuilder) -> Result<reqwest::RequestBuilder> {
        match &self.auth {
            Some(provider) => Ok(request.bearer_auth(provider.token().await?)),
            None => Ok(request),
        }
    }

    async fn send(
        &self,
        operation: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        self.authorize(request)
            .await?
            .send()
            .await
            .map_err(|e| Error::backend_transient(operation, e.to_string()))
    }
}

/// Object-store adapter backed by a Google Cloud Storage bucket
pub struct GcsStore {
    client: GcsClient,
}

impl GcsStore {
    /// Create a store for the given bucket using ambient GCP credentials
    #[must_use]
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            client: GcsClient {
                http: build_http_client(),
                bucket: bucket.into(),
                base_url: DEFAULT_BASE_URL.to_string(),
                auth: Some(Arc::new(TokenProvider::new())),
            },
        }
    }

    /// Create an unauthenticated store against a custom endpoint
    ///
    /// Intended for storage emulators in development environments.
    #[must_use]
    pub fn with_endpoint(bucket: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            client: GcsClient {
                http: build_http_client(),
                bucket: bucket.into(),
                base_url: endpoint.into().trim_end_matches('/').to_string(),
                auth: None,
            },
        }
    }
}

fn build_http_client() -> reqwest::Client {
    // Resumable uploads answer intermediate chunks with 308; following it
    // as a redirect would re-send the body in a loop
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(10))
        .build()
        .unwrap_or_default()
}

#[async_trait]
impl ObjectStore for GcsStore {
    #[instrument(skip(self), fields(bucket = %self.client.bucket))]
    async fn open_reader(&self, name: &str) -> Result<(ObjectReader, ObjectAttrs)> {
        let attrs = self.stat(name).await?;

        let url = self.client.object_url(name);
        let request = self.client.http.get(&url).query(&[("alt", "media")]);
        let response = self.client.send("read", request).await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(classify_status("read", status, name));
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::other(e.to_string()))
            .boxed();
        let reader: ObjectReader = Box::new(StreamReader::new(stream));

        debug!(name, size = attrs.size, "Opened object reader");
        Ok((reader, attrs))
    }

    #[instrument(skip(self, user_metadata), fields(bucket = %self.client.bucket))]
    async fn open_writer(
        &self,
        name: &str,
        content_type: &str,
        user_metadata: HashMap<String, String>,
    ) -> Result<Box<dyn ObjectWriter>> {
        let body = serde_json::json!({
            "name": name,
            "contentType": content_type,
            "metadata": user_metadata,
        });

        let request = self
            .client
            .http
            .post(self.client.upload_url())
            .query(&[("uploadType", "resumable"), ("name", name)])
            .header("X-Upload-Content-Type", content_type)
            .json(&body);
        let response = self.client.send("write", request).await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(classify_status("write", status, name));
        }

        let session_uri = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| {
                Error::backend_transient("write", "resumable session missing Location header")
            })?;

        debug!(name, "Started resumable upload session");

        Ok(Box::new(GcsWriter {
            client: self.client.clone(),
            name: name.to_string(),
            session_uri,
            buf: Vec::new(),
            offset: 0,
        }))
    }

    #[instrument(skip(self, patch), fields(bucket = %self.client.bucket))]
    async fn update_user_metadata(
        &self,
        name: &str,
        patch: HashMap<String, String>,
    ) -> Result<()> {
        let body = serde_json::json!({ "metadata": patch });
        let request = self.client.http.patch(self.client.object_url(name)).json(&body);
        let response = self.client.send("update_metadata", request).await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(classify_status("update_metadata", status, name));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.client.bucket))]
    async fn stat(&self, name: &str) -> Result<ObjectAttrs> {
        let request = self.client.http.get(self.client.object_url(name));
        let response = self.client.send("stat", request).await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            return Err(classify_status("stat", status, name));
        }

        let object: GcsObject = response
            .json()
            .await
            .map_err(|e| Error::backend_transient("stat", format!("invalid response: {e}")))?;
        Ok(object.into_attrs())
    }

    #[instrument(skip(self), fields(bucket = %self.client.bucket))]
    async fn delete(&self, name: &str) -> Result<()> {
        let request = self.client.http.delete(self.client.object_url(name));
        let response = self.client.send("delete", request).await?;

        let status = response.status().as_u16();
        // An already-absent object counts as a successful delete
        if status == 404 || (200..300).contains(&status) {
            return Ok(());
        }
        Err(classify_status("delete", status, name))
    }

    async fn iterate(&self, prefix: &str) -> Result<BoxStream<'static, Result<ObjectAttrs>>> {
        struct PageState {
            client: GcsClient,
            prefix: String,
            page_token: Option<String>,
            buffer: VecDeque<ObjectAttrs>,
            exhausted: bool,
        }

        let state = PageState {
            client: self.client.clone(),
            prefix: prefix.to_string(),
            page_token: None,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        let stream = futures::stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(attrs) = state.buffer.pop_front() {
                    return Ok(Some((attrs, state)));
                }
                if state.exhausted {
                    return Ok(None);
                }

                let mut query: Vec<(&str, String)> = vec![
                    ("prefix", state.prefix.clone()),
                    ("maxResults", PAGE_SIZE.to_string()),
                ];
                if let Some(token) = &state.page_token {
                    query.push(("pageToken", token.clone()));
                }

                let request = state.client.http.get(state.client.list_url()).query(&query);
                let response = state.client.send("list", request).await?;

                let status = response.status().as_u16();
                if !(200..300).contains(&status) {
                    return Err(classify_status("list", status, &state.prefix));
                }

                let page: ListResponse = response.json().await.map_err(|e| {
                    Error::backend_transient("list", format!("invalid response: {e}"))
                })?;

                state
                    .buffer
                    .extend(page.items.into_iter().map(GcsObject::into_attrs));
                state.page_token = page.next_page_token;
                state.exhausted = state.page_token.is_none();
            }
        });

        Ok(Box::pin(stream))
    }
}

/// Writer over a GCS resumable-upload session
///
/// Intermediate chunks are flushed at 8 MiB boundaries; the object only
/// becomes visible when the final chunk carries the total size.
struct GcsWriter {
    client: GcsClient,
    name: String,
    session_uri: String,
    buf: Vec<u8>,
    offset: u64,
}

impl GcsWriter {
    async fn flush_chunk(&mut self, data: Vec<u8>) -> Result<()> {
        let start = self.offset;
        let end = start + data.len() as u64 - 1;

        let request = self
            .client
            .http
            .put(&self.session_uri)
            .header("Content-Range", format!("bytes {start}-{end}/*"))
            .body(data);
        let response = self.client.send("write", request).await?;

        let status = response.status().as_u16();
        // 308 acknowledges an intermediate chunk
        if status != 308 && !(200..300).contains(&status) {
            self.cancel_session().await;
            return Err(classify_status("write", status, &self.name));
        }

        self.offset = end + 1;
        Ok(())
    }

    async fn cancel_session(&self) {
        // Best effort: an uncancelled session expires server-side and
        // never produces a visible object either way
        let request = self.client.http.delete(&self.session_uri);
        if let Ok(request) = self.client.authorize(request).await {
            if let Err(err) = request.send().await {
                warn!(name = %self.name, error = %err, "Failed to cancel upload session");
            }
        }
    }
}

#[async_trait]
impl ObjectWriter for GcsWriter {
    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(chunk);
        while self.buf.len() >= UPLOAD_CHUNK {
            let rest = self.buf.split_off(UPLOAD_CHUNK);
            let full = std::mem::replace(&mut self.buf, rest);
            self.flush_chunk(full).await?;
        }
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<ObjectAttrs> {
        let total = self.offset + self.buf.len() as u64;
        let data = std::mem::take(&mut self.buf);

        let content_range = if data.is_empty() {
            format!("bytes */{total}")
        } else {
            format!("bytes {}-{}/{total}", self.offset, total - 1)
        };

        let request = self
            .client
            .http
            .put(&self.session_uri)
            .header("Content-Range", content_range)
            .body(data);
        let response = self.client.send("write", request).await?;

        let status = response.status().as_u16();
        if !(200..300).contains(&status) {
            self.cancel_session().await;
            return Err(classify_status("write", status, &self.name));
        }

        let object: GcsObject = response
            .json()
            .await
            .map_err(|e| Error::backend_transient("write", format!("invalid response: {e}")))?;

        debug!(name = %self.name, size = total, "Committed object");
        Ok(object.into_attrs())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: String,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    content_type: Option<String>,
    #[serde(default)]
    md5_hash: Option<String>,
    #[serde(default)]
    time_created: Option<DateTime<Utc>>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
    #[serde(default)]
    metadata: Option<HashMap<String, String>>,
}

impl GcsObject {
    fn into_attrs(self) -> ObjectAttrs {
        let fallback = Utc::now();
        ObjectAttrs {
            name: self.name,
            size: self
                .size
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            content_type: self.content_type.unwrap_or_default(),
            store_hash: self.md5_hash.unwrap_or_default(),
            created: self.time_created.unwrap_or(fallback),
            updated: self.updated.unwrap_or(fallback),
            user_metadata: self.metadata.unwrap_or_default(),
        }
    }
}

/// Percent-encode a single path segment, including `/`
fn encode_path_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char);
            }
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_path_segment_escapes_slashes() {
        assert_eq!(
            encode_path_segment("cache/teamA/abc123"),
            "cache%2FteamA%2Fabc123"
        );
    }

    #[test]
    fn test_encode_path_segment_passes_unreserved() {
        assert_eq!(encode_path_segment("a-b_c.d~e"), "a-b_c.d~e");
    }

    #[test]
    fn test_object_json_parses() {
        let raw = r#"{
            "name": "cache/teamA/abc",
            "size": "1234",
            "contentType": "application/octet-stream",
            "md5Hash": "CY9rzUYh03PK3k6DJie09g==",
            "timeCreated": "2026-01-01T00:00:00Z",
            "updated": "2026-01-02T00:00:00Z",
            "metadata": {"last_accessed": "2026-01-03T00:00:00Z"}
        }"#;
        let object: GcsObject = serde_json::from_str(raw).unwrap();
        let attrs = object.into_attrs();

        assert_eq!(attrs.name, "cache/teamA/abc");
        assert_eq!(attrs.size, 1234);
        assert_eq!(
            attrs.last_accessed(),
            "2026-01-03T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_object_json_tolerates_missing_fields() {
        let object: GcsObject = serde_json::from_str(r#"{"name": "x"}"#).unwrap();
        let attrs = object.into_attrs();
        assert_eq!(attrs.size, 0);
        assert!(attrs.user_metadata.is_empty());
    }

    #[test]
    fn test_store_urls() {
        let store = GcsStore::with_endpoint("artifacts", "http://localhost:4443/");
        assert_eq!(
            store.client.object_url("cache/teamA/abc"),
            "http://localhost:4443/storage/v1/b/artifacts/o/cache%2FteamA%2Fabc"
        );
        assert_eq!(
            store.client.list_url(),
            "http://localhost:4443/storage/v1/b/artifacts/o"
        );
    }
}
