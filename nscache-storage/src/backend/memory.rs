//! In-process cache backend.
//!
//! An [`InMemoryConnector`] plays the role of the network: servers listen on
//! endpoints, and connecting to an endpoint nobody listens on fails the way
//! a refused TCP connection would. Every client connected to the same
//! server shares one store, so several registries (standing in for several
//! processes) can race over the same tenant.
//!
//! Expired items are reclaimed lazily. The server tracks the earliest
//! deadline it holds, and the first operation after that deadline sweeps
//! every expired entry, so keys nobody touches again (an old epoch's data)
//! are reclaimed too.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use nscache_core::{
    is_expired, BackendError, CacheError, CacheResult, Endpoint, Expiry, Flags, RawValue,
};

use super::{parse_counter, CacheClient, CacheConnector, CacheItem, CacheStats};

#[derive(Debug, Clone)]
struct StoredItem {
    value: RawValue,
    flags: Flags,
    expires_at: Option<DateTime<Utc>>,
}

impl StoredItem {
    fn new(value: &[u8], flags: Flags, expiry: Expiry, now: DateTime<Utc>) -> Self {
        Self {
            value: value.to_vec(),
            flags,
            expires_at: expiry.deadline(now),
        }
    }
}

/// `next_deadline` value when nothing stored can expire.
const NO_DEADLINE: i64 = i64::MAX;

#[derive(Debug)]
struct ServerState {
    items: RwLock<HashMap<String, StoredItem>>,
    stats: RwLock<CacheStats>,
    open_connections: AtomicUsize,
    reachable: AtomicBool,
    /// Earliest expiry (unix millis) among stored items, or `NO_DEADLINE`.
    /// Only ever earlier than the true minimum, never later.
    next_deadline: AtomicI64,
}

impl ServerState {
    fn due_for_sweep(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() >= self.next_deadline.load(Ordering::SeqCst)
    }

    /// Remove every expired item. Caller holds the items write lock.
    fn sweep_expired(&self, items: &mut HashMap<String, StoredItem>, now: DateTime<Utc>) -> usize {
        let before = items.len();
        items.retain(|_, item| !is_expired(item.expires_at, now));
        let reclaimed = before - items.len();

        let next = items
            .values()
            .filter_map(|item| item.expires_at)
            .map(|deadline| deadline.timestamp_millis())
            .min()
            .unwrap_or(NO_DEADLINE);
        self.next_deadline.store(next, Ordering::SeqCst);

        if reclaimed > 0 {
            if let Ok(mut stats) = self.stats.write() {
                stats.evictions += reclaimed as u64;
            }
            tracing::trace!(reclaimed, remaining = items.len(), "Swept expired entries");
        }
        reclaimed
    }

    fn track_deadline(&self, item: &StoredItem) {
        if let Some(deadline) = item.expires_at {
            self.next_deadline
                .fetch_min(deadline.timestamp_millis(), Ordering::SeqCst);
        }
    }
}

/// A cache server living in this process.
#[derive(Debug, Clone)]
pub struct InMemoryServer {
    state: Arc<ServerState>,
}

impl Default for InMemoryServer {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(ServerState {
                items: RwLock::new(HashMap::new()),
                stats: RwLock::new(CacheStats::default()),
                open_connections: AtomicUsize::new(0),
                reachable: AtomicBool::new(true),
                next_deadline: AtomicI64::new(NO_DEADLINE),
            }),
        }
    }

    /// Simulate a network partition. While unreachable, new connections are
    /// refused and operations on existing ones fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.state.reachable.load(Ordering::SeqCst)
    }

    /// Number of client connections not yet closed.
    pub fn open_connections(&self) -> usize {
        self.state.open_connections.load(Ordering::SeqCst)
    }

    /// Whether a raw backend key is present and unexpired.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = Utc::now();
        self.state
            .items
            .read()
            .map(|items| {
                items
                    .get(key)
                    .is_some_and(|item| !is_expired(item.expires_at, now))
            })
            .unwrap_or(false)
    }

    /// Raw keys currently stored, expired ones included.
    pub fn keys(&self) -> Vec<String> {
        self.state
            .items
            .read()
            .map(|items| items.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of stored entries, expired ones included until reclaimed.
    pub fn len(&self) -> usize {
        self.state.items.read().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every stored entry.
    pub fn flush_all(&self) {
        if let Ok(mut items) = self.state.items.write() {
            items.clear();
            self.state.next_deadline.store(NO_DEADLINE, Ordering::SeqCst);
        }
    }

    /// Reclaim every expired entry now. Returns how many were removed.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        let mut items = self
            .state
            .items
            .write()
            .map_err(|_| CacheError::LockPoisoned)?;
        Ok(self.state.sweep_expired(&mut items, Utc::now()))
    }
}

/// Connects to [`InMemoryServer`]s by endpoint.
///
/// Cloning the connector shares the set of listening servers.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConnector {
    servers: Arc<RwLock<HashMap<Endpoint, InMemoryServer>>>,
}

impl InMemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector with one server already listening on `endpoint`.
    pub fn with_server(endpoint: &Endpoint) -> (Self, InMemoryServer) {
        let connector = Self::new();
        let server = connector.listen(endpoint);
        (connector, server)
    }

    /// Start a server on `endpoint`, or return the one already listening.
    pub fn listen(&self, endpoint: &Endpoint) -> InMemoryServer {
        match self.servers.write() {
            Ok(mut servers) => servers.entry(endpoint.clone()).or_default().clone(),
            // A poisoned map still needs a server to hand back; it is simply
            // not registered, so connects will be refused.
            Err(_) => InMemoryServer::new(),
        }
    }

    /// Stop listening on `endpoint`. Existing connections keep working.
    pub fn stop(&self, endpoint: &Endpoint) -> Option<InMemoryServer> {
        self.servers.write().ok()?.remove(endpoint)
    }

    pub fn server(&self, endpoint: &Endpoint) -> Option<InMemoryServer> {
        self.servers.read().ok()?.get(endpoint).cloned()
    }
}

impl CacheConnector for InMemoryConnector {
    type Client = InMemoryClient;

    fn connect(&self, endpoint: &Endpoint) -> CacheResult<InMemoryClient> {
        let server = self
            .servers
            .read()
            .map_err(|_| CacheError::LockPoisoned)?
            .get(endpoint)
            .cloned();

        let server = server.ok_or_else(|| CacheError::ConnectionUnavailable {
            endpoint: endpoint.to_string(),
            reason: "connection refused".to_string(),
        })?;

        if !server.is_reachable() {
            return Err(CacheError::ConnectionUnavailable {
                endpoint: endpoint.to_string(),
                reason: "host unreachable".to_string(),
            });
        }

        server.state.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryClient {
            state: Arc::clone(&server.state),
            closed: AtomicBool::new(false),
        })
    }
}

/// A connection to an [`InMemoryServer`]. Closed on drop.
#[derive(Debug)]
pub struct InMemoryClient {
    state: Arc<ServerState>,
    closed: AtomicBool,
}

impl InMemoryClient {
    fn check_open(&self, operation: &'static str, key: &str) -> CacheResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed.into());
        }
        if !self.state.reachable.load(Ordering::SeqCst) {
            return Err(BackendError::Operation {
                operation,
                key: key.to_string(),
                reason: "host unreachable".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn record_read(&self, hit: bool) {
        if let Ok(mut stats) = self.state.stats.write() {
            if hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }
    }

    /// Run `f` against the item map after reclaiming expired entries.
    ///
    /// Sweeps only once the earliest known deadline has passed.
    fn with_live_entry<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut HashMap<String, StoredItem>, DateTime<Utc>) -> T,
    ) -> CacheResult<T> {
        let now = Utc::now();
        let mut items = self
            .state
            .items
            .write()
            .map_err(|_| CacheError::LockPoisoned)?;
        if self.state.due_for_sweep(now) {
            self.state.sweep_expired(&mut items, now);
        }
        let result = f(&mut items, now);
        if let Some(item) = items.get(key) {
            self.state.track_deadline(item);
        }
        Ok(result)
    }
}

impl CacheClient for InMemoryClient {
    fn get(&self, key: &str) -> CacheResult<Option<CacheItem>> {
        self.check_open("get", key)?;
        let found = self.with_live_entry(key, |items, _| {
            items
                .get(key)
                .map(|item| CacheItem::new(item.value.clone(), item.flags))
        })?;
        self.record_read(found.is_some());
        Ok(found)
    }

    fn set(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<()> {
        self.check_open("set", key)?;
        self.with_live_entry(key, |items, now| {
            items.insert(key.to_string(), StoredItem::new(value, flags, expiry, now));
        })
    }

    fn add(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<bool> {
        self.check_open("add", key)?;
        self.with_live_entry(key, |items, now| {
            if items.contains_key(key) {
                return false;
            }
            items.insert(key.to_string(), StoredItem::new(value, flags, expiry, now));
            true
        })
    }

    fn replace(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<bool> {
        self.check_open("replace", key)?;
        self.with_live_entry(key, |items, now| match items.get_mut(key) {
            Some(item) => {
                *item = StoredItem::new(value, flags, expiry, now);
                true
            }
            None => false,
        })
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        self.check_open("delete", key)?;
        self.with_live_entry(key, |items, _| items.remove(key).is_some())
    }

    fn increment(&self, key: &str, delta: u64) -> CacheResult<Option<u64>> {
        self.check_open("incr", key)?;
        self.with_live_entry(key, |items, _| {
            let Some(item) = items.get_mut(key) else {
                return Ok(None);
            };
            let current = parse_counter(&item.value).ok_or_else(|| BackendError::NotNumeric {
                key: key.to_string(),
            })?;
            let next = current.wrapping_add(delta);
            item.value = next.to_string().into_bytes();
            Ok(Some(next))
        })?
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn stats(&self) -> CacheResult<CacheStats> {
        let items = self
            .state
            .items
            .read()
            .map_err(|_| CacheError::LockPoisoned)?;
        let mut stats = self
            .state
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.entry_count = items.len() as u64;
        stats.memory_bytes = items
            .iter()
            .map(|(k, v)| (k.len() + v.value.len()) as u64)
            .sum();
        Ok(stats)
    }
}

impl Drop for InMemoryClient {
    fn drop(&mut self) {
        self.close();
    }
}
