//! Session registry: one [`TenantSession`] per tenant.
//!
//! The registry is an ordinary value. Build one per process (or per test),
//! pass it to the code that needs sessions, and drop it to release every
//! connection it opened.
//!
//! # Concurrency
//!
//! The map lock is held only to look up or insert, never while talking to
//! the backend. Two threads asking for the same new tenant may both build a
//! session; the first insert wins and the loser's session is dropped, which
//! closes its connection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use nscache_core::{CacheConfig, CacheError, CacheResult, Endpoint, TenantId};

use crate::backend::CacheConnector;
use crate::epoch::EpochManager;
use crate::session::TenantSession;

/// Shared handle to a session.
pub type SessionHandle<K> = Arc<TenantSession<<K as CacheConnector>::Client>>;

/// Maps tenant ids to their sessions.
pub struct SessionRegistry<K: CacheConnector> {
    connector: K,
    endpoint: Endpoint,
    epochs: Arc<EpochManager>,
    sessions: RwLock<HashMap<TenantId, SessionHandle<K>>>,
}

impl<K: CacheConnector> SessionRegistry<K> {
    /// Create a registry connecting through `connector` to the configured endpoint.
    pub fn new(connector: K, config: &CacheConfig) -> CacheResult<Self> {
        let epochs = Arc::new(EpochManager::new(config)?);
        Ok(Self {
            connector,
            endpoint: config.endpoint(),
            epochs,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn epochs(&self) -> &EpochManager {
        &self.epochs
    }

    pub fn connector(&self) -> &K {
        &self.connector
    }

    /// The session for `tenant`, constructing and connecting it on first use.
    ///
    /// Repeated calls with the same tenant return the same session. A
    /// session that could not connect is returned degraded and stays cached;
    /// [`evict`](Self::evict) it to try again.
    pub fn session(&self, tenant: &TenantId) -> CacheResult<SessionHandle<K>> {
        if let Some(existing) = self
            .sessions
            .read()
            .map_err(|_| CacheError::LockPoisoned)?
            .get(tenant)
        {
            return Ok(Arc::clone(existing));
        }

        let candidate = Arc::new(TenantSession::open(
            &self.connector,
            &self.endpoint,
            Arc::clone(&self.epochs),
            tenant.clone(),
        ));

        let mut sessions = self.sessions.write().map_err(|_| CacheError::LockPoisoned)?;
        let session = sessions
            .entry(tenant.clone())
            .or_insert_with(|| Arc::clone(&candidate));

        if !Arc::ptr_eq(session, &candidate) {
            tracing::debug!(tenant = %tenant, "Lost session creation race, discarding duplicate");
        }
        Ok(Arc::clone(session))
    }

    /// [`session`](Self::session) for a tenant given as a string.
    pub fn session_for(&self, tenant: &str) -> CacheResult<SessionHandle<K>> {
        let tenant = TenantId::new(tenant)?;
        self.session(&tenant)
    }

    /// The session for the default tenant.
    pub fn default_session(&self) -> CacheResult<SessionHandle<K>> {
        self.session(&TenantId::default_tenant())
    }

    /// Remove a tenant's session. Its connection is released once the last
    /// outstanding handle is dropped.
    pub fn evict(&self, tenant: &TenantId) -> CacheResult<Option<SessionHandle<K>>> {
        let removed = self
            .sessions
            .write()
            .map_err(|_| CacheError::LockPoisoned)?
            .remove(tenant);
        if removed.is_some() {
            tracing::debug!(tenant = %tenant, "Session evicted");
        }
        Ok(removed)
    }

    pub fn contains(&self, tenant: &TenantId) -> CacheResult<bool> {
        Ok(self
            .sessions
            .read()
            .map_err(|_| CacheError::LockPoisoned)?
            .contains_key(tenant))
    }

    pub fn len(&self) -> CacheResult<usize> {
        Ok(self.sessions.read().map_err(|_| CacheError::LockPoisoned)?.len())
    }

    pub fn is_empty(&self) -> CacheResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Tenants with a session, in no particular order.
    pub fn tenants(&self) -> CacheResult<Vec<TenantId>> {
        Ok(self
            .sessions
            .read()
            .map_err(|_| CacheError::LockPoisoned)?
            .keys()
            .cloned()
            .collect())
    }

    /// Drop every session. Returns how many were removed.
    pub fn shutdown(&self) -> CacheResult<usize> {
        let drained: Vec<_> = self
            .sessions
            .write()
            .map_err(|_| CacheError::LockPoisoned)?
            .drain()
            .collect();
        tracing::info!(sessions = drained.len(), endpoint = %self.endpoint, "Session registry shut down");
        Ok(drained.len())
    }
}

impl<K: CacheConnector> std::fmt::Debug for SessionRegistry<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("endpoint", &self.endpoint)
            .field("sessions", &self.len().ok())
            .finish_non_exhaustive()
    }
}
