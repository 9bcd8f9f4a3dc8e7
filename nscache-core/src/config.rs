//! Cache configuration.
//!
//! Configuration is static: it is fixed when the registry is built and never
//! negotiated with the backend. Values come from built-in defaults, a TOML
//! file, or `NSCACHE_*` environment variables layered on the defaults.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CacheResult, ConfigError};
use crate::expiry::Expiry;
use crate::identity::Endpoint;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 11211;
pub const DEFAULT_NAMESPACE_PREFIX: &str = "my_ns_";
pub const DEFAULT_EPOCH_MIN: u64 = 1;
pub const DEFAULT_EPOCH_MAX: u64 = 10_000;
pub const DEFAULT_MAX_PROBE_ATTEMPTS: u32 = 10_000;

/// Configuration for tenant sessions and epoch allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    /// Backend host.
    pub host: String,

    /// Backend port.
    pub port: u16,

    /// Prepended to every tenant id when composing keys.
    pub namespace_prefix: String,

    /// Lowest epoch drawn at first allocation (inclusive).
    pub epoch_min: u64,

    /// Highest epoch drawn at first allocation (inclusive).
    pub epoch_max: u64,

    /// Candidates tried before epoch allocation gives up.
    pub max_probe_attempts: u32,

    /// Expiry written on guard markers. Zero keeps them until evicted.
    pub guard_expiry: Expiry,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            namespace_prefix: DEFAULT_NAMESPACE_PREFIX.to_string(),
            epoch_min: DEFAULT_EPOCH_MIN,
            epoch_max: DEFAULT_EPOCH_MAX,
            max_probe_attempts: DEFAULT_MAX_PROBE_ATTEMPTS,
            guard_expiry: Expiry::NEVER,
        }
    }
}

impl CacheConfig {
    /// Create CacheConfig from environment variables.
    ///
    /// Environment variables:
    /// - `NSCACHE_HOST`: backend host (default: localhost)
    /// - `NSCACHE_PORT`: backend port (default: 11211)
    /// - `NSCACHE_NAMESPACE_PREFIX`: key prefix (default: my_ns_)
    /// - `NSCACHE_EPOCH_MIN` / `NSCACHE_EPOCH_MAX`: initial epoch range (default: 1..=10000)
    /// - `NSCACHE_MAX_PROBE_ATTEMPTS`: allocation attempts (default: 10000)
    /// - `NSCACHE_GUARD_EXPIRY`: guard marker expiry in seconds (default: 0, never)
    ///
    /// Unparseable numbers fall back to the default; call `validate` for
    /// range checks.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let host = lookup("NSCACHE_HOST")
            .map(|s| s.trim().to_string())
            .unwrap_or(defaults.host);

        let port = lookup("NSCACHE_PORT")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.port);

        let namespace_prefix = lookup("NSCACHE_NAMESPACE_PREFIX").unwrap_or(defaults.namespace_prefix);

        let epoch_min = lookup("NSCACHE_EPOCH_MIN")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.epoch_min);

        let epoch_max = lookup("NSCACHE_EPOCH_MAX")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.epoch_max);

        let max_probe_attempts = lookup("NSCACHE_MAX_PROBE_ATTEMPTS")
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(defaults.max_probe_attempts);

        let guard_expiry = lookup("NSCACHE_GUARD_EXPIRY")
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map(Expiry::from_secs)
            .unwrap_or(defaults.guard_expiry);

        Self {
            host,
            port,
            namespace_prefix,
            epoch_min,
            epoch_max,
            max_probe_attempts,
            guard_expiry,
        }
    }

    /// Load configuration from a TOML file. Missing fields take defaults.
    pub fn from_path(path: &Path) -> CacheResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> CacheResult<Self> {
        let config: CacheConfig = toml::from_str(contents).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        Ok(config)
    }

    /// The backend endpoint this configuration points at.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - host is not empty and port > 0
    /// - namespace_prefix is not empty and has no whitespace or control characters
    /// - 0 < epoch_min <= epoch_max
    /// - max_probe_attempts > 0
    pub fn validate(&self) -> CacheResult<()> {
        if self.host.trim().is_empty() {
            return Err(invalid("host", &self.host, "must not be empty"));
        }
        if self.port == 0 {
            return Err(invalid("port", &self.port.to_string(), "must be > 0"));
        }
        if self.namespace_prefix.is_empty() {
            return Err(invalid("namespace_prefix", "", "must not be empty"));
        }
        if self
            .namespace_prefix
            .chars()
            .any(|c| c.is_whitespace() || c.is_control())
        {
            return Err(invalid(
                "namespace_prefix",
                &self.namespace_prefix,
                "must not contain whitespace or control characters",
            ));
        }
        if self.epoch_min == 0 {
            return Err(invalid("epoch_min", "0", "must be > 0"));
        }
        if self.epoch_min > self.epoch_max {
            return Err(invalid(
                "epoch_max",
                &self.epoch_max.to_string(),
                &format!("must be >= epoch_min ({})", self.epoch_min),
            ));
        }
        if self.max_probe_attempts == 0 {
            return Err(invalid("max_probe_attempts", "0", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> crate::error::CacheError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
    .into()
}
