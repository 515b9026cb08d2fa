//! Purpose: Redis-backed cache store built on the synchronous `redis` client.
//! Exports: `RedisStore`.
//! Role: Second remote key-value backend; same soft-failure contract as memcached.
//! Invariants: One connection per store, created on first use and re-created after a transport failure.
//! Invariants: Server error replies leave the connection in place.
//! Invariants: Values carry a one-byte codec tag because redis has no item flags.

use std::sync::Arc;

use redis::{Client, Connection, RedisError};
use tracing::debug;

use super::{CacheStore, report_soft_failure, stamp_expiry};
use crate::core::clock::Clock;
use crate::core::codec;
use crate::core::config::{BackendKind, RemoteConfig};
use crate::core::error::{Error, ErrorKind};
use crate::core::snapshot::CacheEntry;

pub struct RedisStore {
    settings: RemoteConfig,
    clock: Arc<dyn Clock>,
    show_errors: bool,
    conn: Option<Connection>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("url", &self.url())
            .field("connected", &self.conn.is_some())
            .finish()
    }
}

impl RedisStore {
    pub fn new(settings: RemoteConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            show_errors: false,
            conn: None,
        }
    }

    pub fn with_show_errors(mut self, show_errors: bool) -> Self {
        self.show_errors = show_errors;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// `host` may already be a full `redis://` URL; otherwise one is built from host and port.
    pub fn url(&self) -> String {
        if self.settings.host.contains("://") {
            return self.settings.host.clone();
        }
        format!(
            "redis://{}:{}/",
            self.settings.host,
            self.settings.port_for(BackendKind::Redis)
        )
    }

    fn connect(&mut self) -> Result<&mut Connection, Error> {
        if self.conn.is_none() {
            let url = self.url();
            let timeout = self.settings.connect_timeout();
            let client = Client::open(url.as_str()).map_err(|err| {
                Error::new(ErrorKind::Usage)
                    .with_message(format!("invalid redis url {url}"))
                    .with_source(err)
            })?;
            let conn = client
                .get_connection_with_timeout(timeout)
                .map_err(redis_error)?;
            conn.set_read_timeout(Some(timeout)).map_err(redis_error)?;
            conn.set_write_timeout(Some(timeout)).map_err(redis_error)?;
            debug!(url = %url, "redis connected");
            self.conn = Some(conn);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("connection missing"))
    }

    fn with_connection<T>(
        &mut self,
        op: impl FnOnce(&mut Connection) -> Result<T, RedisError>,
    ) -> Result<T, Error> {
        let result = self
            .connect()
            .and_then(|conn| op(conn).map_err(redis_error));
        if let Err(err) = &result {
            if err.kind() == ErrorKind::Unavailable {
                self.conn = None;
            }
        }
        result
    }

    fn try_get(&mut self, key: &str) -> Result<Option<CacheEntry>, Error> {
        if key.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("cache key is empty"));
        }
        let value: Option<Vec<u8>> =
            self.with_connection(|conn| redis::cmd("GET").arg(key).query(conn))?;
        match value {
            Some(bytes) => codec::decode_tagged(&bytes)
                .map(Some)
                .map_err(|err| err.with_key(key)),
            None => Ok(None),
        }
    }

    fn try_set(&mut self, key: &str, entry: &CacheEntry, ttl: u64) -> Result<(), Error> {
        if key.is_empty() {
            return Err(Error::new(ErrorKind::Usage).with_message("cache key is empty"));
        }
        let entry = stamp_expiry(entry, ttl, self.clock.now());
        let payload = codec::encode_tagged(&entry, self.settings.compress)?;
        let expiry = self.settings.resolve_expiry(ttl);
        self.with_connection(|conn| {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(payload.as_slice());
            // Redis rejects `EX 0`; no server-side expiry then, the embedded one still applies.
            if expiry > 0 {
                cmd.arg("EX").arg(expiry);
            }
            cmd.query::<()>(conn)
        })
    }
}

impl CacheStore for RedisStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    fn get(&mut self, key: &str) -> Option<CacheEntry> {
        match self.try_get(key) {
            Ok(Some(entry)) if entry.is_expired(self.clock.now()) => {
                self.delete(key, 0);
                None
            }
            Ok(entry) => entry,
            Err(err) => {
                report_soft_failure(self.show_errors, BackendKind::Redis, "get", &err);
                if err.kind() == ErrorKind::Corrupt {
                    self.delete(key, 0);
                }
                None
            }
        }
    }

    fn set(&mut self, key: &str, entry: &CacheEntry, ttl: u64) -> bool {
        match self.try_set(key, entry, ttl) {
            Ok(()) => true,
            Err(err) => {
                report_soft_failure(self.show_errors, BackendKind::Redis, "set", &err);
                false
            }
        }
    }

    fn delete(&mut self, key: &str, timeout: u64) -> bool {
        if key.is_empty() {
            return false;
        }
        let result = self.with_connection(|conn| {
            if timeout == 0 {
                redis::cmd("DEL").arg(key).query::<i64>(conn)
            } else {
                redis::cmd("EXPIRE").arg(key).arg(timeout).query::<i64>(conn)
            }
        });
        match result {
            Ok(count) => count > 0,
            Err(err) => {
                report_soft_failure(self.show_errors, BackendKind::Redis, "delete", &err);
                false
            }
        }
    }

    fn flush(&mut self) -> bool {
        match self.with_connection(|conn| redis::cmd("FLUSHDB").query::<()>(conn)) {
            Ok(()) => true,
            Err(err) => {
                report_soft_failure(self.show_errors, BackendKind::Redis, "flush", &err);
                false
            }
        }
    }
}

fn redis_error(err: RedisError) -> Error {
    let kind = if err.is_io_error()
        || err.is_connection_refusal()
        || err.is_connection_dropped()
        || err.is_timeout()
    {
        ErrorKind::Unavailable
    } else {
        ErrorKind::Io
    };
    Error::new(kind)
        .with_message("redis command failed")
        .with_source(err)
}
