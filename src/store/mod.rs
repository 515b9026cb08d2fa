//! Purpose: Define the cache-store contract and select a backend from configuration.
//! Exports: `CacheStore`, `DiskStore`, `MemcachedStore`, `RedisStore`, `QueryCache`, `open_store`.
//! Role: Strategy boundary between the executor and the three storage transports.
//! Invariants: Store failures never escape as errors; `get` yields `None`, writes yield `false`.
//! Invariants: A store never returns an expired entry; expired or corrupt records are removed on read.
//! Invariants: Each backend is independently authoritative; no cross-node coherence.

mod disk;
mod memcached;
mod query_cache;
mod redis_store;

use std::borrow::Cow;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::core::clock::Clock;
use crate::core::config::{BackendKind, Config};
use crate::core::error::Error;
use crate::core::snapshot::CacheEntry;

pub use disk::DiskStore;
pub use memcached::MemcachedStore;
pub use query_cache::QueryCache;
pub use redis_store::RedisStore;

pub trait CacheStore: Send {
    fn kind(&self) -> BackendKind;

    /// Live entry for `key`, or `None` when missing, expired, corrupt or unreachable.
    fn get(&mut self, key: &str) -> Option<CacheEntry>;

    /// Persist `entry` for `ttl` seconds; `ttl == 0` uses the backend default.
    fn set(&mut self, key: &str, entry: &CacheEntry, ttl: u64) -> bool;

    /// Remove `key` now, or after `timeout` seconds when non-zero.
    fn delete(&mut self, key: &str, timeout: u64) -> bool;

    fn flush(&mut self) -> bool;
}

pub fn open_store(config: &Config, clock: Arc<dyn Clock>) -> Box<dyn CacheStore> {
    match config.backend {
        BackendKind::Disk => Box::new(
            DiskStore::open(&config.disk.dir, clock).with_show_errors(config.show_errors),
        ),
        BackendKind::Memcached => Box::new(
            MemcachedStore::new(config.remote.clone(), clock).with_show_errors(config.show_errors),
        ),
        BackendKind::Redis => Box::new(
            RedisStore::new(config.remote.clone(), clock).with_show_errors(config.show_errors),
        ),
    }
}

/// `entry` expiring `ttl` seconds after `now`; `ttl == 0` keeps the embedded expiry.
pub(crate) fn stamp_expiry(entry: &CacheEntry, ttl: u64, now: f64) -> Cow<'_, CacheEntry> {
    if ttl == 0 {
        return Cow::Borrowed(entry);
    }
    let mut stamped = entry.clone();
    stamped.expires_at = now + ttl as f64;
    Cow::Owned(stamped)
}

/// Soft failures are warnings only in error-reporting mode.
pub(crate) fn report_soft_failure(show_errors: bool, backend: BackendKind, op: &str, err: &Error) {
    if show_errors {
        warn!(backend = %backend, op, error = %err, "cache operation failed; continuing without cache");
    } else {
        debug!(backend = %backend, op, error = %err, "cache operation failed");
    }
}
