//! nscache Core - shared types
//!
//! Identity types, the error taxonomy, configuration and key composition
//! used by every other nscache crate. This crate never talks to a backend.

pub mod config;
pub mod error;
pub mod expiry;
pub mod identity;
pub mod key;
pub mod telemetry;

pub use config::CacheConfig;
pub use error::{BackendError, CacheError, CacheResult, ConfigError, ValidationError};
pub use expiry::{is_expired, Expiry, MAX_RELATIVE_EXPIRY_SECS};
pub use identity::{Endpoint, Epoch, TenantId, DEFAULT_TENANT};
pub use key::{validate_key, NamespaceKeys, TenantScopedKey, MAX_KEY_LEN, SEPARATOR};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

/// Opaque value bytes as stored in the backend.
pub type RawValue = Vec<u8>;

/// Flags stored alongside a value, opaque to nscache.
pub type Flags = u32;
