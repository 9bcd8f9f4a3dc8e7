//! nscache Storage - tenant sessions over a shared cache
//!
//! Many tenants share one key/value cache. Each tenant's keys are prefixed
//! with its id and its current *namespace epoch*; bumping the epoch
//! invalidates everything the tenant stored in a single atomic increment.
//!
//! # Example
//!
//! ```
//! use nscache_core::{CacheConfig, Expiry};
//! use nscache_storage::{InMemoryConnector, SessionRegistry};
//!
//! let config = CacheConfig::default();
//! let (connector, _server) = InMemoryConnector::with_server(&config.endpoint());
//! let registry = SessionRegistry::new(connector, &config)?;
//!
//! let alice = registry.session_for("alice")?;
//! alice.set("profile", b"v1", 0, Expiry::NEVER)?;
//! assert_eq!(alice.get("profile")?, Some(b"v1".to_vec()));
//!
//! alice.clear_namespace()?;
//! assert_eq!(alice.get("profile")?, None);
//! # Ok::<(), nscache_core::CacheError>(())
//! ```

pub mod backend;
pub mod epoch;
pub mod registry;
pub mod session;

pub use backend::{
    CacheClient, CacheConnector, CacheItem, CacheStats, InMemoryClient, InMemoryConnector,
    InMemoryServer, LmdbClient, LmdbConnector,
};
pub use epoch::EpochManager;
pub use registry::{SessionHandle, SessionRegistry};
pub use session::TenantSession;
