//! Bearer-token acquisition for Google Cloud Storage
//!
//! Mode is auto-negotiated per request: the GCE metadata server is tried
//! first (sub-millisecond inside GCP), falling back to the `gcloud` CLI
//! for workstation use. Tokens are cached until shortly before expiry.

use forgecache_core::{Error, Result};
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// Refresh this long before the token actually expires
const EXPIRY_LEEWAY: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct MetadataToken {
    access_token: String,
    expires_in: u64,
}

#[derive(Debug)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Caching access-token provider with metadata-server and CLI modes
#[derive(Debug)]
pub(crate) struct TokenProvider {
    http: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl TokenProvider {
    pub(crate) fn new() -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            http,
            cached: Mutex::new(None),
        }
    }

    /// Get a bearer token, refreshing if the cached one is near expiry
    pub(crate) async fn token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() + EXPIRY_LEEWAY {
                return Ok(token.value.clone());
            }
        }

        let fresh = self.fetch().await?;
        let value = fresh.value.clone();
        *cached = Some(fresh);
        Ok(value)
    }

    async fn fetch(&self) -> Result<CachedToken> {
        match self.fetch_metadata_server().await {
            Ok(token) => Ok(token),
            Err(err) => {
                debug!(error = %err, "Metadata server unavailable, falling back to gcloud CLI");
                self.fetch_gcloud_cli().await
            }
        }
    }

    async fn fetch_metadata_server(&self) -> Result<CachedToken> {
        let response = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| Error::backend_transient("token", e.to_string()))?;

        if !response.status().is_success() {
            return Err(Error::backend_transient(
                "token",
                format!("metadata server returned HTTP {}", response.status()),
            ));
        }

        let token: MetadataToken = response
            .json()
            .await
            .map_err(|e| Error::backend_transient("token", e.to_string()))?;

        Ok(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        })
    }

    async fn fetch_gcloud_cli(&self) -> Result<CachedToken> {
        let output = Command::new("gcloud")
            .args(["auth", "print-access-token"])
            .output()
            .await
            .map_err(|e| {
                Error::backend_permanent("token", format!("failed to execute gcloud CLI: {e}"))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::backend_permanent(
                "token",
                format!("gcloud CLI failed: {stderr}"),
            ));
        }

        Ok(CachedToken {
            value: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            // gcloud tokens last an hour; refresh well inside that
            expires_at: Instant::now() + Duration::from_secs(1800),
        })
    }
}
