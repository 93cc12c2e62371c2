//! Frozen, environment-sourced configuration record
//!
//! The process harness loads this once at startup and passes it by
//! reference to every component; nothing else reads the environment.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_PREFIX: &str = "FORGECACHE_";

/// Application configuration, immutable after load
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Object-store bucket holding the cache
    pub bucket: String,

    /// gRPC listen port
    #[serde(default = "default_server_port")]
    pub server_port: u16,

    /// Metrics HTTP listen port (must differ from the server port)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Cache size soft ceiling in GiB
    #[serde(default = "default_max_cache_size_gib")]
    pub max_cache_size_gib: u64,

    /// Fraction of the ceiling the pruner aims to leave occupied
    #[serde(default = "default_target_utilization")]
    pub target_utilization: f64,

    /// Hours between pruning cycles
    #[serde(default = "default_prune_interval_hours")]
    pub prune_interval_hours: u64,

    /// Absolute retention: entries unread for this many days are swept
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// Minimum age in hours before an entry becomes eligible for LRU pruning
    #[serde(default = "default_retention_floor_hours")]
    pub retention_floor_hours: u64,

    /// Deletions between informational progress reports
    #[serde(default = "default_delete_batch")]
    pub delete_batch: usize,

    /// Register gRPC reflection (development convenience)
    #[serde(default)]
    pub enable_reflection: bool,

    /// Reject requests that carry no authenticated identity
    #[serde(default)]
    pub require_auth: bool,

    /// When set, only these instances may be addressed
    #[serde(default)]
    pub allowed_instances: Option<Vec<String>>,
}

impl Config {
    /// Load configuration from `FORGECACHE_*` environment variables
    ///
    /// # Errors
    /// Returns `Error::Configuration` when a variable fails to parse or the
    /// resulting record is invalid.
    pub fn from_env() -> Result<Self> {
        let cfg = Self {
            bucket: read_var("BUCKET")?.unwrap_or_default(),
            server_port: read_parsed("SERVER_PORT")?.unwrap_or_else(default_server_port),
            metrics_port: read_parsed("METRICS_PORT")?.unwrap_or_else(default_metrics_port),
            max_cache_size_gib: read_parsed("MAX_CACHE_SIZE_GIB")?
                .unwrap_or_else(default_max_cache_size_gib),
            target_utilization: read_parsed("TARGET_UTILIZATION")?
                .unwrap_or_else(default_target_utilization),
            prune_interval_hours: read_parsed("PRUNE_INTERVAL_HOURS")?
                .unwrap_or_else(default_prune_interval_hours),
            retention_days: read_parsed("RETENTION_DAYS")?.unwrap_or_else(default_retention_days),
            retention_floor_hours: read_parsed("RETENTION_FLOOR_HOURS")?
                .unwrap_or_else(default_retention_floor_hours),
            delete_batch: read_parsed("DELETE_BATCH")?.unwrap_or_else(default_delete_batch),
            enable_reflection: read_parsed("ENABLE_REFLECTION")?.unwrap_or(false),
            require_auth: read_parsed("REQUIRE_AUTH")?.unwrap_or(false),
            allowed_instances: read_var("ALLOWED_INSTANCES")?.map(|raw| {
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            }),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the record
    ///
    /// # Errors
    /// Returns `Error::Configuration` for any invalid combination.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(Error::configuration("bucket name is required"));
        }
        if self.server_port == 0 {
            return Err(Error::configuration("server port must be non-zero"));
        }
        if self.metrics_port == 0 {
            return Err(Error::configuration("metrics port must be non-zero"));
        }
        if self.server_port == self.metrics_port {
            return Err(Error::configuration(format!(
                "server port and metrics port must differ (both {})",
                self.server_port
            )));
        }
        if self.max_cache_size_gib == 0 {
            return Err(Error::configuration("max cache size must be positive"));
        }
        if !(self.target_utilization > 0.0 && self.target_utilization <= 1.0) {
            return Err(Error::configuration(format!(
                "target utilization must be in (0, 1], got {}",
                self.target_utilization
            )));
        }
        if self.prune_interval_hours == 0 {
            return Err(Error::configuration("prune interval must be positive"));
        }
        if self.retention_days == 0 {
            return Err(Error::configuration("retention days must be positive"));
        }
        if self.retention_floor_hours == 0 {
            return Err(Error::configuration("retention floor must be positive"));
        }
        if self.delete_batch == 0 {
            return Err(Error::configuration("delete batch must be positive"));
        }
        Ok(())
    }

    /// Cache size ceiling in bytes
    #[must_use]
    pub fn max_cache_size_bytes(&self) -> u64 {
        self.max_cache_size_gib * 1024 * 1024 * 1024
    }

    /// Wall-clock period between pruning cycles
    #[must_use]
    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_hours * 3600)
    }

    /// Minimum age below which an entry is exempt from LRU pruning
    #[must_use]
    pub fn retention_floor(&self) -> Duration {
        Duration::from_secs(self.retention_floor_hours * 3600)
    }

    /// Whether the instance is permitted by the allowlist (if any)
    #[must_use]
    pub fn instance_allowed(&self, instance: &str) -> bool {
        match &self.allowed_instances {
            Some(allowed) => allowed.iter().any(|a| a == instance),
            None => true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            server_port: default_server_port(),
            metrics_port: default_metrics_port(),
            max_cache_size_gib: default_max_cache_size_gib(),
            target_utilization: default_target_utilization(),
            prune_interval_hours: default_prune_interval_hours(),
            retention_days: default_retention_days(),
            retention_floor_hours: default_retention_floor_hours(),
            delete_batch: default_delete_batch(),
            enable_reflection: false,
            require_auth: false,
            allowed_instances: None,
        }
    }
}

fn read_var(name: &str) -> Result<Option<String>> {
    match std::env::var(format!("{ENV_PREFIX}{name}")) {
        Ok(value) => Ok(Some(value)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(std::env::VarError::NotUnicode(_)) => Err(Error::configuration(format!(
            "{ENV_PREFIX}{name} is not valid unicode"
        ))),
    }
}

fn read_parsed<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match read_var(name)? {
        Some(raw) => raw.parse().map(Some).map_err(|e| {
            Error::configuration(format!("failed to parse {ENV_PREFIX}{name}='{raw}': {e}"))
        }),
        None => Ok(None),
    }
}

// Default value functions

fn default_server_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_max_cache_size_gib() -> u64 {
    1000
}

fn default_target_utilization() -> f64 {
    0.8
}

fn default_prune_interval_hours() -> u64 {
    24
}

fn default_retention_days() -> u32 {
    30
}

fn default_retention_floor_hours() -> u64 {
    24
}

fn default_delete_batch() -> usize {
    100
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            bucket: "forgecache-artifacts".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_missing_bucket_rejected() {
        let cfg = Config::default();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_equal_ports_rejected() {
        let cfg = Config {
            metrics_port: 8080,
            server_port: 8080,
            ..valid_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_cache_size_rejected() {
        let cfg = Config {
            max_cache_size_gib: 0,
            ..valid_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_utilization_bounds() {
        for bad in [0.0, -0.5, 1.5] {
            let cfg = Config {
                target_utilization: bad,
                ..valid_config()
            };
            assert!(cfg.validate().is_err(), "{bad} should be rejected");
        }

        let cfg = Config {
            target_utilization: 1.0,
            ..valid_config()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let cfg = Config {
            retention_days: 0,
            ..valid_config()
        };
        assert!(cfg.validate().is_err());

        let cfg = Config {
            retention_floor_hours: 0,
            ..valid_config()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_size_conversion() {
        let cfg = Config {
            max_cache_size_gib: 2,
            ..valid_config()
        };
        assert_eq!(cfg.max_cache_size_bytes(), 2 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_interval_conversion() {
        let cfg = Config {
            prune_interval_hours: 6,
            ..valid_config()
        };
        assert_eq!(cfg.prune_interval(), Duration::from_secs(6 * 3600));
    }

    #[test]
    fn test_allowlist() {
        let cfg = valid_config();
        assert!(cfg.instance_allowed("anything"));

        let cfg = Config {
            allowed_instances: Some(vec!["teamA".into(), "teamB".into()]),
            ..valid_config()
        };
        assert!(cfg.instance_allowed("teamA"));
        assert!(!cfg.instance_allowed("teamC"));
    }
}
