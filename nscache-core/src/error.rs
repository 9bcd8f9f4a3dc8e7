//! Error types for nscache operations

use thiserror::Error;

/// Failures reported by a cache backend while executing an operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("{operation} failed for key '{key}': {reason}")]
    Operation {
        operation: &'static str,
        key: String,
        reason: String,
    },

    #[error("Cannot increment non-numeric value at key '{key}'")]
    NotNumeric { key: String },

    #[error("Connection is closed")]
    Closed,
}

/// Input validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Failed to parse config TOML: {reason}")]
    Parse { reason: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Master error type for all nscache errors.
///
/// A missing key is not an error: reads report it as `Ok(None)` and
/// conditional writes as `Ok(false)`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("Cache backend {endpoint} unavailable: {reason}")]
    ConnectionUnavailable { endpoint: String, reason: String },

    #[error("Namespace epoch for tenant '{tenant}' is not initialized")]
    EpochUninitialized { tenant: String },

    #[error("No free namespace epoch for tenant '{tenant}' after {attempts} attempts")]
    EpochRangeExhausted { tenant: String, attempts: u32 },

    #[error("Stored namespace epoch for tenant '{tenant}' is not a number: {raw:?}")]
    CorruptEpoch { tenant: String, raw: String },

    #[error("Invalid cache key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl CacheError {
    /// True for the error a degraded (never connected) session returns.
    pub fn is_connection_unavailable(&self) -> bool {
        matches!(self, CacheError::ConnectionUnavailable { .. })
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Serialization {
            reason: e.to_string(),
        }
    }
}

/// Result type alias for nscache operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
