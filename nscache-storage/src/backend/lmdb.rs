//! LMDB-backed cache backend.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store that several processes on one host can share.
//!
//! # Endpoints
//!
//! Each endpoint maps to its own LMDB environment under the connector's root
//! directory (`<root>/<host>_<port>`). Connecting opens the environment once
//! per connector; further connections share it.
//!
//! # Atomicity
//!
//! Every operation runs in its own transaction. LMDB serializes write
//! transactions across threads and processes, so `add`, `replace` and
//! `increment` (read and write inside one write transaction) are atomic.
//!
//! # Expiry
//!
//! Expired records are dropped when their key is written again, and a
//! write that runs after the earliest known deadline sweeps the whole
//! database. A write that hits `MDB_MAP_FULL` purges expired records and
//! retries once before failing.
//!
//! # Record Format
//!
//! ```text
//! [expires_at: i64 LE millis, 0 = never][flags: u32 LE][payload]
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions, MdbError, RoTxn, RwTxn};
use nscache_core::{
    is_expired, BackendError, CacheError, CacheResult, Endpoint, Expiry, Flags,
};

use super::{parse_counter, CacheClient, CacheConnector, CacheItem, CacheStats};

const HEADER_LEN: usize = 12;

/// `next_deadline` value when nothing stored can expire.
const NO_DEADLINE: i64 = i64::MAX;

/// Shared handle to one opened environment.
#[derive(Clone)]
struct LmdbHandle {
    env: Env,
    db: Database<Bytes, Bytes>,
    stats: Arc<RwLock<CacheStats>>,
    /// Earliest expiry (unix millis) this process knows of. Starts at 0 so
    /// the first write learns what an earlier run left behind.
    next_deadline: Arc<AtomicI64>,
}

/// Opens LMDB environments for endpoints under a root directory.
///
/// Clones share opened environments. LMDB allows an environment to be
/// opened once per process, so use one connector (or clones of it) per
/// root directory.
#[derive(Clone)]
pub struct LmdbConnector {
    root: PathBuf,
    max_size_mb: usize,
    envs: Arc<Mutex<HashMap<Endpoint, LmdbHandle>>>,
}

impl fmt::Debug for LmdbConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmdbConnector")
            .field("root", &self.root)
            .field("max_size_mb", &self.max_size_mb)
            .finish_non_exhaustive()
    }
}

impl LmdbConnector {
    /// # Arguments
    ///
    /// * `root` - Directory holding one LMDB environment per endpoint
    /// * `max_size_mb` - Maximum size of each environment in megabytes
    pub fn new(root: impl Into<PathBuf>, max_size_mb: usize) -> Self {
        Self {
            root: root.into(),
            max_size_mb,
            envs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the environment serving `endpoint`.
    pub fn env_dir(&self, endpoint: &Endpoint) -> PathBuf {
        let host: String = endpoint
            .host
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(format!("{}_{}", host, endpoint.port))
    }

    fn open(&self, endpoint: &Endpoint) -> Result<LmdbHandle, String> {
        let path = self.env_dir(endpoint);
        std::fs::create_dir_all(&path).map_err(|e| e.to_string())?;

        // SAFETY: the environment is only opened through this connector, which
        // caches it, so the same path is never mapped twice by this process.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(self.max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(&path)
        }
        .map_err(|e| e.to_string())?;

        let mut wtxn = env.write_txn().map_err(|e| e.to_string())?;
        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| e.to_string())?;
        wtxn.commit().map_err(|e| e.to_string())?;

        tracing::debug!(path = %path.display(), "Opened LMDB environment");

        Ok(LmdbHandle {
            env,
            db,
            stats: Arc::new(RwLock::new(CacheStats::default())),
            next_deadline: Arc::new(AtomicI64::new(0)),
        })
    }
}

impl CacheConnector for LmdbConnector {
    type Client = LmdbClient;

    fn connect(&self, endpoint: &Endpoint) -> CacheResult<LmdbClient> {
        let mut envs = self.envs.lock().map_err(|_| CacheError::LockPoisoned)?;
        let handle = match envs.get(endpoint) {
            Some(handle) => handle.clone(),
            None => {
                let handle = self
                    .open(endpoint)
                    .map_err(|reason| CacheError::ConnectionUnavailable {
                        endpoint: endpoint.to_string(),
                        reason,
                    })?;
                envs.insert(endpoint.clone(), handle.clone());
                handle
            }
        };

        Ok(LmdbClient {
            handle,
            closed: AtomicBool::new(false),
        })
    }
}

/// A connection to one LMDB environment. Closed on drop.
pub struct LmdbClient {
    handle: LmdbHandle,
    closed: AtomicBool,
}

impl fmt::Debug for LmdbClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LmdbClient")
            .field("path", &self.handle.env.path())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

struct Record<'a> {
    expires_at: Option<DateTime<Utc>>,
    flags: Flags,
    payload: &'a [u8],
}

fn encode_record(value: &[u8], flags: Flags, expiry: Expiry, now: DateTime<Utc>) -> Vec<u8> {
    let expires_millis = expiry
        .deadline(now)
        .map(|d| d.timestamp_millis())
        .unwrap_or(0);

    let mut bytes = Vec::with_capacity(HEADER_LEN + value.len());
    bytes.extend_from_slice(&expires_millis.to_le_bytes());
    bytes.extend_from_slice(&flags.to_le_bytes());
    bytes.extend_from_slice(value);
    bytes
}

fn decode_record(bytes: &[u8]) -> Option<Record<'_>> {
    if bytes.len() < HEADER_LEN {
        return None;
    }
    let expires_millis = i64::from_le_bytes(bytes[0..8].try_into().ok()?);
    let flags = u32::from_le_bytes(bytes[8..12].try_into().ok()?);
    let expires_at = match expires_millis {
        0 => None,
        millis => Some(DateTime::from_timestamp_millis(millis)?),
    };
    Some(Record {
        expires_at,
        flags,
        payload: &bytes[HEADER_LEN..],
    })
}

fn op_error(operation: &'static str, key: &str, reason: impl fmt::Display) -> CacheError {
    BackendError::Operation {
        operation,
        key: key.to_string(),
        reason: reason.to_string(),
    }
    .into()
}

impl LmdbClient {
    fn check_open(&self) -> CacheResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BackendError::Closed.into());
        }
        Ok(())
    }

    fn record_read(&self, hit: bool) {
        if let Ok(mut stats) = self.handle.stats.write() {
            if hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }
    }

    fn record_evictions(&self, count: usize) {
        if count == 0 {
            return;
        }
        if let Ok(mut stats) = self.handle.stats.write() {
            stats.evictions += count as u64;
        }
    }

    /// Read the live (unexpired) record at `key` as owned bytes.
    ///
    /// Returns the raw record and whether an expired one was found instead.
    fn read_live(
        &self,
        txn: &RoTxn,
        operation: &'static str,
        key: &str,
        now: DateTime<Utc>,
    ) -> CacheResult<(Option<Vec<u8>>, bool)> {
        let raw = self
            .handle
            .db
            .get(txn, key.as_bytes())
            .map_err(|e| op_error(operation, key, e))?;

        let Some(raw) = raw else {
            return Ok((None, false));
        };
        let record =
            decode_record(raw).ok_or_else(|| op_error(operation, key, "corrupt record"))?;
        if is_expired(record.expires_at, now) {
            return Ok((None, true));
        }
        Ok((Some(raw.to_vec()), false))
    }

    /// Delete every expired record and recompute the earliest deadline.
    fn sweep_expired(&self, wtxn: &mut RwTxn, now: DateTime<Utc>) -> heed::Result<usize> {
        let mut expired = Vec::new();
        let mut next = NO_DEADLINE;
        for entry in self.handle.db.iter(wtxn)? {
            let (key, raw) = entry?;
            let Some(deadline) = decode_record(raw).and_then(|record| record.expires_at) else {
                continue;
            };
            if is_expired(Some(deadline), now) {
                expired.push(key.to_vec());
            } else {
                next = next.min(deadline.timestamp_millis());
            }
        }
        for key in &expired {
            self.handle.db.delete(wtxn, key)?;
        }
        self.handle.next_deadline.store(next, Ordering::SeqCst);
        Ok(expired.len())
    }

    /// Reclaim every expired record now. Returns how many were removed.
    pub fn purge_expired(&self) -> CacheResult<usize> {
        self.check_open()?;
        let mut wtxn = self
            .handle
            .env
            .write_txn()
            .map_err(|e| op_error("purge", "", e))?;
        let reclaimed = self
            .sweep_expired(&mut wtxn, Utc::now())
            .map_err(|e| op_error("purge", "", e))?;
        wtxn.commit().map_err(|e| op_error("purge", "", e))?;
        self.record_evictions(reclaimed);
        Ok(reclaimed)
    }

    /// Run a read-modify-write step inside one write transaction.
    ///
    /// `f` sees the live record (if any) and decides what to store. If the
    /// map is full, expired records are purged and the step runs once more.
    fn write_with<T>(
        &self,
        operation: &'static str,
        key: &str,
        f: impl Fn(Option<&[u8]>, DateTime<Utc>) -> CacheResult<(WriteAction, T)>,
    ) -> CacheResult<T> {
        self.check_open()?;
        match self.try_write(operation, key, &f) {
            Err(TxnError::Store(heed::Error::Mdb(MdbError::MapFull))) => {
                let reclaimed = self.purge_expired()?;
                tracing::warn!(
                    path = %self.handle.env.path().display(),
                    reclaimed,
                    "LMDB map full, purged expired records"
                );
                self.try_write(operation, key, &f)
                    .map_err(|e| e.into_cache_error(operation, key))
            }
            result => result.map_err(|e| e.into_cache_error(operation, key)),
        }
    }

    fn try_write<T>(
        &self,
        operation: &'static str,
        key: &str,
        f: &impl Fn(Option<&[u8]>, DateTime<Utc>) -> CacheResult<(WriteAction, T)>,
    ) -> Result<T, TxnError> {
        let now = Utc::now();
        let mut wtxn = self.handle.env.write_txn()?;

        let mut reclaimed = 0;
        if now.timestamp_millis() >= self.handle.next_deadline.load(Ordering::SeqCst) {
            reclaimed = self.sweep_expired(&mut wtxn, now)?;
        }

        let (current, expired) = self.read_live(&wtxn, operation, key, now)?;
        if expired {
            self.handle.db.delete(&mut wtxn, key.as_bytes())?;
            reclaimed += 1;
        }

        let (action, result) = f(current.as_deref(), now)?;
        let mut deadline = None;
        match action {
            WriteAction::Put(bytes) => {
                deadline = decode_record(&bytes).and_then(|record| record.expires_at);
                self.handle.db.put(&mut wtxn, key.as_bytes(), &bytes)?;
            }
            WriteAction::Delete => {
                self.handle.db.delete(&mut wtxn, key.as_bytes())?;
            }
            WriteAction::Keep => {}
        }

        wtxn.commit()?;
        self.record_evictions(reclaimed);
        if let Some(deadline) = deadline {
            self.handle
                .next_deadline
                .fetch_min(deadline.timestamp_millis(), Ordering::SeqCst);
        }
        Ok(result)
    }
}

enum WriteAction {
    Put(Vec<u8>),
    Delete,
    Keep,
}

/// Failure inside a write transaction, keeping LMDB errors inspectable.
enum TxnError {
    Store(heed::Error),
    Cache(CacheError),
}

impl TxnError {
    fn into_cache_error(self, operation: &'static str, key: &str) -> CacheError {
        match self {
            TxnError::Store(e) => op_error(operation, key, e),
            TxnError::Cache(e) => e,
        }
    }
}

impl From<heed::Error> for TxnError {
    fn from(e: heed::Error) -> Self {
        TxnError::Store(e)
    }
}

impl From<CacheError> for TxnError {
    fn from(e: CacheError) -> Self {
        TxnError::Cache(e)
    }
}

impl CacheClient for LmdbClient {
    fn get(&self, key: &str) -> CacheResult<Option<CacheItem>> {
        self.check_open()?;
        let rtxn = self
            .handle
            .env
            .read_txn()
            .map_err(|e| op_error("get", key, e))?;

        let (raw, _) = self.read_live(&rtxn, "get", key, Utc::now())?;
        let item = raw
            .as_deref()
            .and_then(decode_record)
            .map(|record| CacheItem::new(record.payload.to_vec(), record.flags));
        self.record_read(item.is_some());
        Ok(item)
    }

    fn set(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<()> {
        self.write_with("set", key, |_, now| {
            Ok((WriteAction::Put(encode_record(value, flags, expiry, now)), ()))
        })
    }

    fn add(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<bool> {
        self.write_with("add", key, |current, now| match current {
            Some(_) => Ok((WriteAction::Keep, false)),
            None => Ok((
                WriteAction::Put(encode_record(value, flags, expiry, now)),
                true,
            )),
        })
    }

    fn replace(&self, key: &str, value: &[u8], flags: Flags, expiry: Expiry) -> CacheResult<bool> {
        self.write_with("replace", key, |current, now| match current {
            Some(_) => Ok((
                WriteAction::Put(encode_record(value, flags, expiry, now)),
                true,
            )),
            None => Ok((WriteAction::Keep, false)),
        })
    }

    fn delete(&self, key: &str) -> CacheResult<bool> {
        self.write_with("delete", key, |current, _| match current {
            Some(_) => Ok((WriteAction::Delete, true)),
            None => Ok((WriteAction::Keep, false)),
        })
    }

    fn increment(&self, key: &str, delta: u64) -> CacheResult<Option<u64>> {
        self.write_with("incr", key, |current, _| {
            let Some(raw) = current else {
                return Ok((WriteAction::Keep, None));
            };
            let record = decode_record(raw).ok_or_else(|| op_error("incr", key, "corrupt record"))?;
            let value = parse_counter(record.payload).ok_or_else(|| BackendError::NotNumeric {
                key: key.to_string(),
            })?;
            let next = value.wrapping_add(delta);

            // Keep the header (expiry and flags) and swap only the payload.
            let mut bytes = raw[..HEADER_LEN].to_vec();
            bytes.extend_from_slice(next.to_string().as_bytes());
            Ok((WriteAction::Put(bytes), Some(next)))
        })
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::trace!(path = %self.handle.env.path().display(), "LMDB connection closed");
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn stats(&self) -> CacheResult<CacheStats> {
        let mut stats = self
            .handle
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();

        let rtxn = self
            .handle
            .env
            .read_txn()
            .map_err(|e| op_error("stats", "", e))?;
        stats.entry_count = self
            .handle
            .db
            .len(&rtxn)
            .map_err(|e| op_error("stats", "", e))?;
        Ok(stats)
    }
}

impl Drop for LmdbClient {
    fn drop(&mut self) {
        self.close();
    }
}
