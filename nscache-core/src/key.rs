//! Tenant-scoped key composition.
//!
//! Every backend key this crate touches is built here. A full data key is
//!
//! ```text
//! <namespace_prefix><tenant_id>_<epoch>_<logical_key>
//! ```
//!
//! and the two bookkeeping keys of a tenant are its epoch entry
//! (`<namespace_prefix><tenant_id>`) and the guard marker for a candidate
//! epoch (`<namespace_prefix><tenant_id>_<candidate>`).
//!
//! The separator is not escaped. A logical key containing `_` is legal, but
//! callers must keep tenant ids and logical keys from colliding through it.

use std::fmt;

use crate::error::{CacheError, CacheResult};
use crate::identity::{Epoch, TenantId};

/// Separator between the key segments.
pub const SEPARATOR: char = '_';

/// Longest key a backend accepts (the memcached limit).
pub const MAX_KEY_LEN: usize = 250;

/// Builds bookkeeping keys for a fixed namespace prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceKeys {
    prefix: String,
}

impl NamespaceKeys {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn namespace_prefix(&self) -> &str {
        &self.prefix
    }

    /// `<namespace_prefix><tenant_id>`: also the key of the tenant's epoch entry.
    pub fn tenant_prefix(&self, tenant: &TenantId) -> String {
        let mut key = String::with_capacity(self.prefix.len() + tenant.as_str().len());
        key.push_str(&self.prefix);
        key.push_str(tenant.as_str());
        key
    }

    /// Key holding the tenant's current epoch.
    pub fn epoch_key(&self, tenant: &TenantId) -> String {
        self.tenant_prefix(tenant)
    }

    /// Key of the guard marker claiming `candidate` for the tenant.
    pub fn guard_key(&self, tenant: &TenantId, candidate: Epoch) -> String {
        format!("{}{}{}", self.tenant_prefix(tenant), SEPARATOR, candidate)
    }

    /// Compose a full data key and check it against backend key rules.
    pub fn full_key(&self, tenant: &TenantId, epoch: Epoch, logical_key: &str) -> CacheResult<String> {
        let key = TenantScopedKey::new(tenant, epoch, logical_key).encode(&self.prefix);
        validate_key(&key)?;
        Ok(key)
    }
}

/// A data key bound to a tenant and an epoch.
///
/// The private inner struct means a scoped key can only come from `new`,
/// which requires both the tenant and the epoch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantScopedKey<'a> {
    inner: ScopedKeyInner<'a>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ScopedKeyInner<'a> {
    tenant: &'a TenantId,
    epoch: Epoch,
    logical_key: &'a str,
}

impl<'a> TenantScopedKey<'a> {
    pub fn new(tenant: &'a TenantId, epoch: Epoch, logical_key: &'a str) -> Self {
        Self {
            inner: ScopedKeyInner {
                tenant,
                epoch,
                logical_key,
            },
        }
    }

    pub fn tenant(&self) -> &TenantId {
        self.inner.tenant
    }

    pub fn epoch(&self) -> Epoch {
        self.inner.epoch
    }

    pub fn logical_key(&self) -> &str {
        self.inner.logical_key
    }

    /// Encode under `prefix` as `<prefix><tenant>_<epoch>_<logical_key>`.
    pub fn encode(&self, prefix: &str) -> String {
        use fmt::Write;

        let tenant = self.inner.tenant.as_str();
        let mut key =
            String::with_capacity(prefix.len() + tenant.len() + self.inner.logical_key.len() + 24);
        key.push_str(prefix);
        key.push_str(tenant);
        key.push(SEPARATOR);
        // Writing to a String cannot fail.
        let _ = write!(key, "{}", self.inner.epoch);
        key.push(SEPARATOR);
        key.push_str(self.inner.logical_key);
        key
    }
}

/// Check a composed key against the rules shared by the backends.
pub fn validate_key(key: &str) -> CacheResult<()> {
    let reason = if key.is_empty() {
        Some("key is empty".to_string())
    } else if key.len() > MAX_KEY_LEN {
        Some(format!("{} bytes exceeds the {} byte limit", key.len(), MAX_KEY_LEN))
    } else if key.chars().any(|c| c.is_ascii_whitespace() || c.is_control()) {
        Some("contains whitespace or control characters".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(CacheError::InvalidKey {
            key: key.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    #[test]
    fn test_tenant_prefix_and_epoch_key() {
        let keys = NamespaceKeys::new("my_ns_");
        let alice = tenant("alice");
        assert_eq!(keys.tenant_prefix(&alice), "my_ns_alice");
        assert_eq!(keys.epoch_key(&alice), "my_ns_alice");
        assert_eq!(keys.namespace_prefix(), "my_ns_");
    }

    #[test]
    fn test_guard_key() {
        let keys = NamespaceKeys::new("my_ns_");
        assert_eq!(
            keys.guard_key(&tenant("alice"), Epoch::new(4217)),
            "my_ns_alice_4217"
        );
    }

    #[test]
    fn test_full_key_layout() {
        let keys = NamespaceKeys::new("my_ns_");
        let key = keys
            .full_key(&tenant("alice"), Epoch::new(42), "profile")
            .unwrap();
        assert_eq!(key, "my_ns_alice_42_profile");
    }

    #[test]
    fn test_scoped_key_getters() {
        let alice = tenant("alice");
        let key = TenantScopedKey::new(&alice, Epoch::new(3), "k");
        assert_eq!(key.tenant(), &alice);
        assert_eq!(key.epoch(), Epoch::new(3));
        assert_eq!(key.logical_key(), "k");
        assert_eq!(key.encode("p_"), "p_alice_3_k");
    }

    #[test]
    fn test_different_epochs_different_keys() {
        let keys = NamespaceKeys::new("my_ns_");
        let alice = tenant("alice");
        let k1 = keys.full_key(&alice, Epoch::new(1), "k").unwrap();
        let k2 = keys.full_key(&alice, Epoch::new(2), "k").unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_different_tenants_different_keys() {
        let keys = NamespaceKeys::new("my_ns_");
        let k1 = keys.full_key(&tenant("alice"), Epoch::new(1), "k").unwrap();
        let k2 = keys.full_key(&tenant("bob"), Epoch::new(1), "k").unwrap();
        assert_ne!(k1, k2);
    }

    #[test]
    fn test_separator_in_logical_key_is_not_escaped() {
        let keys = NamespaceKeys::new("my_ns_");
        let key = keys
            .full_key(&tenant("alice"), Epoch::new(1), "a_b")
            .unwrap();
        assert_eq!(key, "my_ns_alice_1_a_b");
    }

    #[test]
    fn test_validate_key_rejects() {
        assert!(validate_key("").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key("tab\there").is_err());
        assert!(validate_key("nul\0").is_err());
        assert!(validate_key(&"x".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(validate_key(&"x".repeat(MAX_KEY_LEN)).is_ok());
    }

    #[test]
    fn test_full_key_too_long() {
        let keys = NamespaceKeys::new("my_ns_");
        let long = "k".repeat(MAX_KEY_LEN);
        let err = keys
            .full_key(&tenant("alice"), Epoch::new(1), &long)
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }
}
