//! Cache backend traits and the shipped backends.
//!
//! A backend is reached through a [`CacheConnector`], which hands out
//! [`CacheClient`] connections. Everything above this module (epochs,
//! sessions, the registry) is written against these two traits only.

pub mod lmdb;
pub mod memory;

pub use lmdb::{LmdbClient, LmdbConnector};
pub use memory::{InMemoryClient, InMemoryConnector, InMemoryServer};

use nscache_core::{CacheResult, Endpoint, Expiry, Flags, RawValue};

/// A value read back from the backend together with its flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheItem {
    pub value: RawValue,
    pub flags: Flags,
}

impl CacheItem {
    pub fn new(value: impl Into<RawValue>, flags: Flags) -> Self {
        Self {
            value: value.into(),
            flags,
        }
    }
}

/// A live connection to a shared key/value store.
///
/// Keys passed here are full backend keys; the client does not know about
/// tenants or epochs. Implementations must be thread-safe, and the
/// check-then-write operations (`add`, `replace`, `increment`) must be
/// atomic with respect to every other client of the same store.
///
/// A missing key is never an error: `get` returns `None`, `add`, `replace`
/// and `delete` return whether they took effect, and `increment` returns
/// `None`.
pub trait CacheClient: Send + Sync {
    /// Read a value.
    fn get(&self, key: &str) -> CacheResult<Option<CacheItem>>;

    /// Store a value unconditionally.
    fn set(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<()>;

    /// Store a value only if the key is absent. Returns false if it exists.
    fn add(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<bool>;

    /// Store a value only if the key exists. Returns false if it is absent.
    fn replace(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<bool>;

    /// Remove a key. Returns false if it was absent.
    fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Atomically add `delta` to the decimal number stored at `key`.
    ///
    /// Returns the new value, or `None` if the key is absent. The counter
    /// wraps at `u64::MAX`. A non-numeric value is a
    /// [`BackendError::NotNumeric`](nscache_core::BackendError::NotNumeric).
    fn increment(&self, key: &str, delta: u64) -> CacheResult<Option<u64>>;

    /// Release the connection. Idempotent; later calls fail with
    /// [`BackendError::Closed`](nscache_core::BackendError::Closed).
    fn close(&self);

    fn is_closed(&self) -> bool;

    /// Usage statistics for the store behind this connection.
    fn stats(&self) -> CacheResult<CacheStats>;
}

/// Opens connections to a backend.
pub trait CacheConnector: Send + Sync {
    type Client: CacheClient + 'static;

    /// Connect to the backend at `endpoint`.
    ///
    /// Fails with [`CacheError::ConnectionUnavailable`](nscache_core::CacheError::ConnectionUnavailable)
    /// when nothing answers there.
    fn connect(&self, endpoint: &Endpoint) -> CacheResult<Self::Client>;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of reads that found a live value.
    pub hits: u64,
    /// Number of reads that found nothing.
    pub misses: u64,
    /// Number of entries currently stored, expired ones included until reclaimed.
    pub entry_count: u64,
    /// Approximate payload size in bytes.
    pub memory_bytes: u64,
    /// Number of expired entries reclaimed.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Parse the decimal counter stored at a key, as `increment` sees it.
pub(crate) fn parse_counter(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.trim().parse::<u64>().ok()
}
