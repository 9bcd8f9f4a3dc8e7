//! Per-tenant cache sessions.
//!
//! A [`TenantSession`] owns one backend connection and caches the tenant's
//! epoch. Logical keys are turned into full backend keys with that epoch
//! before every operation, so a session only ever sees its own tenant's
//! current generation of data.
//!
//! A session whose backend could not be reached at construction is
//! *degraded*: it holds no connection and every operation fails with
//! `ConnectionUnavailable` without touching the network. It stays that way
//! until it is evicted from its registry and constructed again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nscache_core::{
    CacheError, CacheResult, Endpoint, Epoch, Expiry, Flags, RawValue, TenantId,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::backend::{CacheClient, CacheConnector, CacheItem};
use crate::epoch::EpochManager;

/// One tenant's view of the shared cache.
#[derive(Debug)]
pub struct TenantSession<C: CacheClient> {
    tenant: TenantId,
    endpoint: Endpoint,
    epochs: Arc<EpochManager>,
    state: SessionState<C>,
}

#[derive(Debug)]
enum SessionState<C> {
    Connected { client: C, epoch: AtomicU64 },
    Degraded { reason: String },
}

impl<C: CacheClient> TenantSession<C> {
    /// Connect to `endpoint` and establish the tenant's epoch.
    ///
    /// Never fails: if the backend is unreachable or the epoch cannot be
    /// established, the session comes back degraded. A connection opened
    /// before a failed epoch lookup is closed before returning.
    pub fn open<K>(
        connector: &K,
        endpoint: &Endpoint,
        epochs: Arc<EpochManager>,
        tenant: TenantId,
    ) -> Self
    where
        K: CacheConnector<Client = C>,
    {
        let client = match connector.connect(endpoint) {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(
                    tenant = %tenant,
                    endpoint = %endpoint,
                    error = %e,
                    "Cache backend unreachable, session degraded"
                );
                return Self::degraded(tenant, endpoint.clone(), epochs, e.to_string());
            }
        };

        match epochs.get_or_init(&client, &tenant) {
            Ok(epoch) => {
                tracing::info!(tenant = %tenant, endpoint = %endpoint, epoch = %epoch, "Session opened");
                Self {
                    tenant,
                    endpoint: endpoint.clone(),
                    epochs,
                    state: SessionState::Connected {
                        client,
                        epoch: AtomicU64::new(epoch.get()),
                    },
                }
            }
            Err(e) => {
                tracing::error!(
                    tenant = %tenant,
                    endpoint = %endpoint,
                    error = %e,
                    "Failed to establish namespace epoch, session degraded"
                );
                client.close();
                Self::degraded(tenant, endpoint.clone(), epochs, e.to_string())
            }
        }
    }

    fn degraded(tenant: TenantId, endpoint: Endpoint, epochs: Arc<EpochManager>, reason: String) -> Self {
        Self {
            tenant,
            endpoint,
            epochs,
            state: SessionState::Degraded { reason },
        }
    }

    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Whether the session holds a connection. False for degraded sessions.
    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected { .. })
    }

    /// The epoch this session composes keys with. `None` when degraded.
    pub fn epoch(&self) -> Option<Epoch> {
        match &self.state {
            SessionState::Connected { epoch, .. } => Some(Epoch::new(epoch.load(Ordering::SeqCst))),
            SessionState::Degraded { .. } => None,
        }
    }

    fn connected(&self) -> CacheResult<(&C, &AtomicU64)> {
        match &self.state {
            SessionState::Connected { client, epoch } => Ok((client, epoch)),
            SessionState::Degraded { reason } => Err(CacheError::ConnectionUnavailable {
                endpoint: self.endpoint.to_string(),
                reason: reason.clone(),
            }),
        }
    }

    /// Resolve a logical key against the current epoch.
    fn resolve(&self, key: &str) -> CacheResult<(&C, String)> {
        let (client, epoch) = self.connected()?;
        let epoch = Epoch::new(epoch.load(Ordering::SeqCst));
        let full_key = self.epochs.keys().full_key(&self.tenant, epoch, key)?;
        Ok((client, full_key))
    }

    /// Read a value. `Ok(None)` when the key is absent or expired.
    pub fn get(&self, key: &str) -> CacheResult<Option<RawValue>> {
        Ok(self.get_with_flags(key)?.map(|item| item.value))
    }

    /// Read a value together with the flags it was stored with.
    pub fn get_with_flags(&self, key: &str) -> CacheResult<Option<CacheItem>> {
        let (client, full_key) = self.resolve(key)?;
        let item = client.get(&full_key)?;
        tracing::trace!(tenant = %self.tenant, key, hit = item.is_some(), "get");
        Ok(item)
    }

    /// Store a value unconditionally.
    pub fn set(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<()> {
        let (client, full_key) = self.resolve(key)?;
        client.set(&full_key, value, flags, expiry)?;
        tracing::trace!(tenant = %self.tenant, key, "set");
        Ok(())
    }

    /// Store a value only if the key is absent. Returns false if it exists.
    pub fn add(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<bool> {
        let (client, full_key) = self.resolve(key)?;
        client.add(&full_key, value, flags, expiry)
    }

    /// Store a value only if the key exists. Returns false if it is absent.
    pub fn replace(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<bool> {
        let (client, full_key) = self.resolve(key)?;
        let replaced = client.replace(&full_key, value, flags, expiry)?;
        tracing::trace!(tenant = %self.tenant, key, replaced, "replace");
        Ok(replaced)
    }

    /// Remove a key. Returns false if it was absent.
    pub fn delete(&self, key: &str) -> CacheResult<bool> {
        let (client, full_key) = self.resolve(key)?;
        let deleted = client.delete(&full_key)?;
        tracing::trace!(tenant = %self.tenant, key, deleted, "delete");
        Ok(deleted)
    }

    /// Invalidate everything this tenant has stored.
    ///
    /// Bumps the tenant's epoch in the backend and switches this session to
    /// the new value. Nothing is deleted; old keys become unreachable and
    /// age out through the backend's own expiry and eviction.
    ///
    /// Concurrent clears on one session leave it on the highest epoch any
    /// of them produced, which is the one stored in the backend.
    pub fn clear_namespace(&self) -> CacheResult<Epoch> {
        let (client, cached) = self.connected()?;
        let epoch = self.epochs.bump(client, &self.tenant)?;
        cached.fetch_max(epoch.get(), Ordering::SeqCst);
        Ok(epoch)
    }

    /// Re-read the tenant's epoch from the backend.
    ///
    /// Picks up a `clear_namespace` done through another session or process.
    /// If the epoch entry is gone (evicted), a new epoch is allocated, which
    /// may be lower than the one cached.
    pub fn refresh_epoch(&self) -> CacheResult<Epoch> {
        let (client, cached) = self.connected()?;
        loop {
            let previous = cached.load(Ordering::SeqCst);
            let epoch = self.epochs.get_or_init(client, &self.tenant)?;
            // A clear that landed while we were reading moved the cache
            // forward; read again rather than overwrite it with an older value.
            if cached
                .compare_exchange(previous, epoch.get(), Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                if epoch.get() != previous {
                    tracing::debug!(tenant = %self.tenant, previous, epoch = %epoch, "Epoch refreshed");
                }
                return Ok(epoch);
            }
        }
    }

    /// Read and deserialize a JSON value.
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Serialize a value as JSON and store it.
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, expiry: Expiry) -> CacheResult<()> {
        let bytes = serde_json::to_vec(value)?;
        self.set(key, &bytes, 0, expiry)
    }

    /// Release the backend connection now instead of on drop.
    ///
    /// Later operations fail with a backend `Closed` error.
    pub fn close(&self) {
        if let SessionState::Connected { client, .. } = &self.state {
            client.close();
            tracing::debug!(tenant = %self.tenant, "Session closed");
        }
    }
}
