//! Tracing bootstrap for the server binary

use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured JSON, one event per line
    Json,
    /// Compact human-readable output
    Compact,
}

impl LogFormat {
    /// Pick the format from `FORGECACHE_LOG_FORMAT`, defaulting to JSON
    /// since the binary runs as a daemon
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("FORGECACHE_LOG_FORMAT").as_deref() {
            Ok("compact") | Ok("dev") => Self::Compact,
            _ => Self::Json,
        }
    }
}

/// Initialize the global tracing subscriber
///
/// The filter honours `RUST_LOG` and falls back to `info` for the
/// forgecache crates.
pub fn init_tracing(format: LogFormat) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| {
            EnvFilter::try_new(
                "forgecache_server=info,forgecache_cache=info,forgecache_pruner=info,\
                 forgecache_storage=info,forgecache_core=info",
            )
        })
        .map_err(|e| format!("failed to create tracing filter: {e}"))?;

    let registry = tracing_subscriber::registry().with(env_filter);

    match format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .try_init(),
    }
    .map_err(|e| format!("failed to initialize tracing: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_defaults_to_json() {
        // Absent or unrecognized values fall back to JSON
        assert_eq!(LogFormat::from_env(), LogFormat::Json);
    }
}
