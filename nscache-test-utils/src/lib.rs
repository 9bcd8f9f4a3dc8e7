//! nscache Test Utilities
//!
//! Shared test infrastructure for the nscache workspace:
//! - Proptest generators for tenants, keys and values
//! - Fixtures wiring registries to in-memory or LMDB backends
//! - Tracing setup that routes events to the test harness

pub use nscache_core::{CacheConfig, CacheError, CacheResult, Endpoint, Epoch, Expiry, TenantId};
pub use nscache_storage::{
    CacheClient, CacheConnector, InMemoryConnector, InMemoryServer, LmdbConnector,
    SessionRegistry, TenantSession,
};

use std::sync::Once;
use tempfile::TempDir;

// ============================================================================
// TRACING
// ============================================================================

static TRACING: Once = Once::new();

/// Route tracing output to the test harness. Safe to call from every test.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("nscache_storage=debug")),
            )
            .with_test_writer()
            .try_init();
    });
}

// ============================================================================
// FIXTURES
// ============================================================================

/// A registry over a fresh in-memory server at the default endpoint.
pub struct MemoryFixture {
    pub config: CacheConfig,
    pub connector: InMemoryConnector,
    pub server: InMemoryServer,
    pub registry: SessionRegistry<InMemoryConnector>,
}

impl MemoryFixture {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        init_test_tracing();
        let (connector, server) = InMemoryConnector::with_server(&config.endpoint());
        let registry = SessionRegistry::new(connector.clone(), &config)
            .expect("test config should be valid");
        Self {
            config,
            connector,
            server,
            registry,
        }
    }

    /// A second registry on the same server, standing in for another process.
    pub fn peer_registry(&self) -> SessionRegistry<InMemoryConnector> {
        SessionRegistry::new(self.connector.clone(), &self.config)
            .expect("test config should be valid")
    }
}

impl Default for MemoryFixture {
    fn default() -> Self {
        Self::new()
    }
}

/// A registry over an LMDB environment in a temporary directory.
pub struct LmdbFixture {
    pub config: CacheConfig,
    pub connector: LmdbConnector,
    pub registry: SessionRegistry<LmdbConnector>,
    // Dropped last so the environment directory outlives the registry.
    pub dir: TempDir,
}

impl LmdbFixture {
    pub fn new() -> Self {
        init_test_tracing();
        let dir = TempDir::new().expect("TempDir creation should succeed");
        let config = CacheConfig::default();
        let connector = LmdbConnector::new(dir.path(), 10);
        let registry =
            SessionRegistry::new(connector.clone(), &config).expect("test config should be valid");
        Self {
            config,
            connector,
            registry,
            dir,
        }
    }

    /// A second registry sharing the same environment.
    pub fn peer_registry(&self) -> SessionRegistry<LmdbConnector> {
        SessionRegistry::new(self.connector.clone(), &self.config)
            .expect("test config should be valid")
    }
}

impl Default for LmdbFixture {
    fn default() -> Self {
        Self::new()
    }
}

pub fn tenant(id: &str) -> TenantId {
    TenantId::new(id).expect("test tenant ids are non-empty")
}

// ============================================================================
// GENERATORS
// ============================================================================

pub mod generators {
    use super::TenantId;
    use proptest::prelude::*;

    /// Tenant ids that compose into valid keys and contain no separator.
    pub fn arb_tenant_id() -> impl Strategy<Value = TenantId> {
        "[a-z][a-z0-9.-]{0,15}".prop_map(|s| TenantId::new(s).expect("non-empty by construction"))
    }

    /// Logical keys without separator or whitespace.
    pub fn arb_logical_key() -> impl Strategy<Value = String> {
        "[a-zA-Z0-9:.-]{1,32}"
    }

    /// Arbitrary value bytes, including empty values.
    pub fn arb_value() -> impl Strategy<Value = Vec<u8>> {
        prop::collection::vec(any::<u8>(), 0..256)
    }
}
