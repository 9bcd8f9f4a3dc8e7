//! Identity types for tenants, epochs and backend endpoints

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;

use crate::error::{CacheError, ValidationError};

/// Tenant used when the caller does not name one.
pub const DEFAULT_TENANT: &str = "default";

/// Opaque name of a logical owner of cache data.
///
/// Tenant ids are never empty. Beyond that they are not interpreted: any
/// string that survives key validation is a valid tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Create a tenant id, rejecting empty strings.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();
        if id.is_empty() {
            return Err(ValidationError::RequiredFieldMissing {
                field: "tenant_id".to_string(),
            });
        }
        Ok(Self(id))
    }

    /// The tenant used when none is given.
    pub fn default_tenant() -> Self {
        Self(DEFAULT_TENANT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for TenantId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TenantId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TenantId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for TenantId {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(id: TenantId) -> Self {
        id.0
    }
}

impl FromStr for TenantId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Generation number of a tenant's namespace.
///
/// Every live key of a tenant embeds the tenant's current epoch. Bumping the
/// epoch orphans everything written under the previous value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Epoch(u64);

impl Epoch {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// The epoch that follows this one, wrapping like the backend counter.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    /// Encode as the ASCII decimal bytes stored in the backend.
    pub fn to_bytes(self) -> Vec<u8> {
        self.0.to_string().into_bytes()
    }

    /// Parse the ASCII decimal form stored in the backend.
    ///
    /// Surrounding whitespace is tolerated; anything else is rejected.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes)
            .ok()?
            .trim()
            .parse::<u64>()
            .ok()
            .map(Self)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Epoch {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Network location of a cache backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| {
            CacheError::Validation(ValidationError::InvalidValue {
                field: "endpoint".to_string(),
                reason: format!("'{}': {}", s, reason),
            })
        };
        let (host, port) = s.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
        if host.is_empty() {
            return Err(invalid("host must not be empty"));
        }
        let port = port.parse::<u16>().map_err(|_| invalid("port must be 0-65535"))?;
        Ok(Self::new(host, port))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_rejects_empty() {
        assert!(TenantId::new("").is_err());
        assert_eq!(TenantId::new("alice").unwrap().as_str(), "alice");
    }

    #[test]
    fn test_default_tenant() {
        assert_eq!(TenantId::default_tenant().as_str(), "default");
    }

    #[test]
    fn test_tenant_id_serde_rejects_empty() {
        let ok: TenantId = serde_json::from_str("\"bob\"").unwrap();
        assert_eq!(ok.as_str(), "bob");
        assert!(serde_json::from_str::<TenantId>("\"\"").is_err());
    }

    #[test]
    fn test_epoch_bytes() {
        let epoch = Epoch::new(4217);
        assert_eq!(epoch.to_bytes(), b"4217".to_vec());
        assert_eq!(Epoch::from_bytes(b"4217"), Some(epoch));
        assert_eq!(Epoch::from_bytes(b" 12 \r\n"), Some(Epoch::new(12)));
        assert_eq!(Epoch::from_bytes(b"abc"), None);
        assert_eq!(Epoch::from_bytes(b"-3"), None);
        assert_eq!(Epoch::from_bytes(&[0xff, 0xfe]), None);
    }

    #[test]
    fn test_epoch_next_wraps() {
        assert_eq!(Epoch::new(9).next(), Epoch::new(10));
        assert_eq!(Epoch::new(u64::MAX).next(), Epoch::new(0));
    }

    #[test]
    fn test_endpoint_parse() {
        let endpoint: Endpoint = "cache.internal:11211".parse().unwrap();
        assert_eq!(endpoint, Endpoint::new("cache.internal", 11211));
        assert_eq!(endpoint.to_string(), "cache.internal:11211");

        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":11211".parse::<Endpoint>().is_err());
        assert!("host:99999".parse::<Endpoint>().is_err());
    }
}
