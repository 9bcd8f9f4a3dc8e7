//! Namespace epochs.
//!
//! A tenant's epoch lives in the backend under the tenant prefix. All of
//! the tenant's data keys embed it, so incrementing it makes every existing
//! key unreachable in one atomic operation, however many keys there are.
//!
//! # Initial allocation
//!
//! The first epoch is not 1 but a random candidate from the configured
//! range. Data from an earlier lifetime of the tenant (an epoch entry that
//! was evicted while its data keys survived) would otherwise come back to
//! life the moment a fresh counter reached the same value.
//!
//! Each candidate is claimed through a guard marker written with `add`, so
//! two initializers never claim the same value. The epoch entry itself is
//! also written with `add`; an initializer that loses that race adopts the
//! winner's epoch instead of overwriting it.

use std::ops::RangeInclusive;

use nscache_core::{
    validate_key, CacheConfig, CacheError, CacheResult, Epoch, Expiry, NamespaceKeys, TenantId,
};
use rand::Rng;

use crate::backend::CacheClient;

/// Value stored in guard markers.
const GUARD_VALUE: &[u8] = b"1";

/// Establishes, reads and bumps tenant epochs.
#[derive(Debug, Clone)]
pub struct EpochManager {
    keys: NamespaceKeys,
    range: RangeInclusive<u64>,
    max_probe_attempts: u32,
    guard_expiry: Expiry,
}

impl EpochManager {
    /// Build from a configuration, rejecting one that fails validation.
    pub fn new(config: &CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        Ok(Self {
            keys: NamespaceKeys::new(config.namespace_prefix.clone()),
            range: config.epoch_min..=config.epoch_max,
            max_probe_attempts: config.max_probe_attempts,
            guard_expiry: config.guard_expiry,
        })
    }

    pub fn keys(&self) -> &NamespaceKeys {
        &self.keys
    }

    /// Range initial epochs are drawn from.
    pub fn range(&self) -> &RangeInclusive<u64> {
        &self.range
    }

    /// Read the tenant's current epoch without initializing it.
    pub fn current<C: CacheClient + ?Sized>(
        &self,
        client: &C,
        tenant: &TenantId,
    ) -> CacheResult<Option<Epoch>> {
        let key = self.keys.epoch_key(tenant);
        validate_key(&key)?;

        let Some(item) = client.get(&key)? else {
            return Ok(None);
        };
        Epoch::from_bytes(&item.value)
            .map(Some)
            .ok_or_else(|| CacheError::CorruptEpoch {
                tenant: tenant.to_string(),
                raw: String::from_utf8_lossy(&item.value).into_owned(),
            })
    }

    /// Return the tenant's epoch, allocating one if it has none yet.
    pub fn get_or_init<C: CacheClient + ?Sized>(
        &self,
        client: &C,
        tenant: &TenantId,
    ) -> CacheResult<Epoch> {
        self.get_or_init_with_rng(client, tenant, &mut rand::rng())
    }

    /// [`get_or_init`](Self::get_or_init) drawing candidates from `rng`.
    pub fn get_or_init_with_rng<C: CacheClient + ?Sized, R: Rng>(
        &self,
        client: &C,
        tenant: &TenantId,
        rng: &mut R,
    ) -> CacheResult<Epoch> {
        if let Some(epoch) = self.current(client, tenant)? {
            tracing::debug!(tenant = %tenant, epoch = %epoch, "Loaded namespace epoch");
            return Ok(epoch);
        }

        let candidate = self.claim_candidate(client, tenant, rng)?;
        let epoch_key = self.keys.epoch_key(tenant);

        if client.add(&epoch_key, &candidate.to_bytes(), 0, Expiry::NEVER)? {
            tracing::info!(tenant = %tenant, epoch = %candidate, "Allocated namespace epoch");
            return Ok(candidate);
        }

        // Another initializer wrote the entry between our read and our add.
        match self.current(client, tenant)? {
            Some(winner) => {
                tracing::warn!(
                    tenant = %tenant,
                    candidate = %candidate,
                    epoch = %winner,
                    "Lost epoch initialization race, adopting existing epoch"
                );
                Ok(winner)
            }
            None => {
                // The winner's entry vanished again (evicted or expired):
                // last writer wins.
                client.set(&epoch_key, &candidate.to_bytes(), 0, Expiry::NEVER)?;
                tracing::info!(tenant = %tenant, epoch = %candidate, "Allocated namespace epoch");
                Ok(candidate)
            }
        }
    }

    /// Draw candidates until one is claimed through its guard marker.
    fn claim_candidate<C: CacheClient + ?Sized, R: Rng>(
        &self,
        client: &C,
        tenant: &TenantId,
        rng: &mut R,
    ) -> CacheResult<Epoch> {
        for attempt in 1..=self.max_probe_attempts {
            let candidate = Epoch::new(rng.random_range(self.range.clone()));
            let guard = self.keys.guard_key(tenant, candidate);

            if client.add(&guard, GUARD_VALUE, 0, self.guard_expiry)? {
                tracing::trace!(tenant = %tenant, candidate = %candidate, attempt, "Claimed epoch guard");
                return Ok(candidate);
            }
            tracing::trace!(tenant = %tenant, candidate = %candidate, attempt, "Epoch guard taken");
        }

        tracing::error!(
            tenant = %tenant,
            attempts = self.max_probe_attempts,
            "No free namespace epoch"
        );
        Err(CacheError::EpochRangeExhausted {
            tenant: tenant.to_string(),
            attempts: self.max_probe_attempts,
        })
    }

    /// Invalidate all of the tenant's data by incrementing its epoch.
    ///
    /// Fails with `EpochUninitialized` if the tenant has no epoch entry.
    pub fn bump<C: CacheClient + ?Sized>(&self, client: &C, tenant: &TenantId) -> CacheResult<Epoch> {
        let key = self.keys.epoch_key(tenant);
        validate_key(&key)?;

        match client.increment(&key, 1)? {
            Some(value) => {
                let epoch = Epoch::new(value);
                tracing::info!(tenant = %tenant, epoch = %epoch, "Namespace cleared");
                Ok(epoch)
            }
            None => Err(CacheError::EpochUninitialized {
                tenant: tenant.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CacheConnector, InMemoryClient, InMemoryConnector, InMemoryServer};
    use nscache_core::{BackendError, ConfigError, Endpoint};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup() -> (InMemoryServer, InMemoryClient) {
        let endpoint = Endpoint::new("localhost", 11211);
        let (connector, server) = InMemoryConnector::with_server(&endpoint);
        let client = connector.connect(&endpoint).unwrap();
        (server, client)
    }

    fn tenant(id: &str) -> TenantId {
        TenantId::new(id).unwrap()
    }

    fn manager_with_range(min: u64, max: u64) -> EpochManager {
        EpochManager::new(&CacheConfig {
            epoch_min: min,
            epoch_max: max,
            max_probe_attempts: 50,
            ..CacheConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_current_is_none_before_init() {
        let (_server, client) = setup();
        let manager = EpochManager::new(&CacheConfig::default()).unwrap();
        assert_eq!(manager.current(&client, &tenant("alice")).unwrap(), None);
    }

    #[test]
    fn test_init_allocates_in_range_and_writes_guard() {
        let (server, client) = setup();
        let manager = EpochManager::new(&CacheConfig::default()).unwrap();
        let alice = tenant("alice");

        let epoch = manager.get_or_init(&client, &alice).unwrap();
        assert!((1..=10_000).contains(&epoch.get()));

        assert!(server.contains_key("my_ns_alice"));
        assert!(server.contains_key(&format!("my_ns_alice_{}", epoch)));
        assert_eq!(manager.current(&client, &alice).unwrap(), Some(epoch));
    }

    #[test]
    fn test_init_is_stable() {
        let (_server, client) = setup();
        let manager = EpochManager::new(&CacheConfig::default()).unwrap();
        let alice = tenant("alice");

        let first = manager.get_or_init(&client, &alice).unwrap();
        let second = manager.get_or_init(&client, &alice).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_init_skips_claimed_candidates() {
        let (_server, client) = setup();
        let manager = manager_with_range(1, 3);
        let alice = tenant("alice");

        // Guards for 1 and 2 survive from an earlier lifetime of the tenant.
        client.set("my_ns_alice_1", b"1", 0, Expiry::NEVER).unwrap();
        client.set("my_ns_alice_2", b"1", 0, Expiry::NEVER).unwrap();

        let mut rng = StdRng::seed_from_u64(7);
        let epoch = manager
            .get_or_init_with_rng(&client, &alice, &mut rng)
            .unwrap();
        assert_eq!(epoch, Epoch::new(3));
    }

    #[test]
    fn test_init_exhausted_range() {
        let (_server, client) = setup();
        let manager = manager_with_range(5, 5);
        let alice = tenant("alice");
        client.set("my_ns_alice_5", b"1", 0, Expiry::NEVER).unwrap();

        let err = manager.get_or_init(&client, &alice).unwrap_err();
        assert_eq!(
            err,
            CacheError::EpochRangeExhausted {
                tenant: "alice".to_string(),
                attempts: 50
            }
        );
        assert_eq!(manager.current(&client, &alice).unwrap(), None);
    }

    #[test]
    fn test_init_adopts_existing_entry() {
        let (_server, client) = setup();
        let manager = EpochManager::new(&CacheConfig::default()).unwrap();
        client.set("my_ns_alice", b"777", 0, Expiry::NEVER).unwrap();

        let epoch = manager.get_or_init(&client, &tenant("alice")).unwrap();
        assert_eq!(epoch, Epoch::new(777));
    }

    #[test]
    fn test_corrupt_epoch_is_an_error() {
        let (_server, client) = setup();
        let manager = EpochManager::new(&CacheConfig::default()).unwrap();
        client.set("my_ns_alice", b"garbage", 0, Expiry::NEVER).unwrap();

        let err = manager.get_or_init(&client, &tenant("alice")).unwrap_err();
        assert_eq!(
            err,
            CacheError::CorruptEpoch {
                tenant: "alice".to_string(),
                raw: "garbage".to_string()
            }
        );
    }

    #[test]
    fn test_bump_increments() {
        let (_server, client) = setup();
        let manager = EpochManager::new(&CacheConfig::default()).unwrap();
        let alice = tenant("alice");

        let epoch = manager.get_or_init(&client, &alice).unwrap();
        let bumped = manager.bump(&client, &alice).unwrap();
        assert_eq!(bumped, epoch.next());
        assert_eq!(manager.current(&client, &alice).unwrap(), Some(bumped));
    }

    #[test]
    fn test_bump_uninitialized_fails() {
        let (_server, client) = setup();
        let manager = EpochManager::new(&CacheConfig::default()).unwrap();
        let err = manager.bump(&client, &tenant("ghost")).unwrap_err();
        assert_eq!(
            err,
            CacheError::EpochUninitialized {
                tenant: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_bump_backend_failure() {
        let (server, client) = setup();
        let manager = EpochManager::new(&CacheConfig::default()).unwrap();
        let alice = tenant("alice");
        manager.get_or_init(&client, &alice).unwrap();

        server.set_reachable(false);
        assert!(matches!(
            manager.bump(&client, &alice),
            Err(CacheError::Backend(BackendError::Operation { .. }))
        ));
    }

    #[test]
    fn test_tenants_are_independent() {
        let (_server, client) = setup();
        let manager = EpochManager::new(&CacheConfig::default()).unwrap();
        let (alice, bob) = (tenant("alice"), tenant("bob"));

        let bob_epoch = manager.get_or_init(&client, &bob).unwrap();
        manager.get_or_init(&client, &alice).unwrap();
        manager.bump(&client, &alice).unwrap();

        assert_eq!(manager.current(&client, &bob).unwrap(), Some(bob_epoch));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let err = EpochManager::new(&CacheConfig {
            epoch_min: 10,
            epoch_max: 5,
            ..CacheConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, CacheError::Config(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn test_invalid_tenant_key_rejected() {
        let (_server, client) = setup();
        let manager = EpochManager::new(&CacheConfig::default()).unwrap();
        let err = manager
            .get_or_init(&client, &tenant("has space"))
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }
}
