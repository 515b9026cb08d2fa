//! Purpose: Memcached-backed cache store speaking the ASCII protocol over TCP.
//! Exports: `MemcachedStore`.
//! Role: Remote key-value backend; thin pass-through with lazily established connection.
//! Invariants: The connection is opened on first use, held by the store, and dropped on any I/O error.
//! Invariants: An unreachable server degrades to cache-disabled for that call, never an error.
//! Invariants: Item flag bit 1 marks a deflated payload.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;

use tracing::debug;

use super::{CacheStore, report_soft_failure, stamp_expiry};
use crate::core::clock::Clock;
use crate::core::codec;
use crate::core::config::{BackendKind, RemoteConfig};
use crate::core::error::{Error, ErrorKind, io_error_kind};
use crate::core::snapshot::CacheEntry;

const FLAG_COMPRESSED: u32 = 1;
const MAX_KEY_LEN: usize = 250;
// Well above the server's default 1 MiB item limit; anything larger is a broken reply.
const MAX_VALUE_LEN: usize = 64 * 1024 * 1024;
// Larger exptimes are read by the server as absolute unix timestamps.
const MAX_RELATIVE_EXPTIME: u64 = 60 * 60 * 24 * 30;

#[derive(Debug)]
pub struct MemcachedStore {
    settings: RemoteConfig,
    clock: Arc<dyn Clock>,
    show_errors: bool,
    conn: Option<Connection>,
}

#[derive(Debug)]
struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl MemcachedStore {
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

    fn connect(&mut self) -> Result<&mut Connection, Error> {
        if self.conn.is_none() {
            let conn = open_connection(&self.settings)?;
            debug!(
                host = %self.settings.host,
                port = self.settings.port_for(BackendKind::Memcached),
                "memcached connected"
            );
            self.conn = Some(conn);
        }
        self.conn
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::Internal).with_message("connection missing"))
    }

    /// Runs `op` on a live connection; any failure drops it so the next call reconnects.
    fn with_connection<T>(
        &mut self,
        op: impl FnOnce(&mut Connection) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let result = self.connect().and_then(op);
        if let Err(err) = &result {
            if matches!(err.kind(), ErrorKind::Io | ErrorKind::Unavailable) {
                self.conn = None;
            }
        }
        result
    }

    fn exptime(&self, ttl: u64) -> u64 {
        if ttl > MAX_RELATIVE_EXPTIME {
            self.clock.now() as u64 + ttl
        } else {
            ttl
        }
    }

    fn try_get(&mut self, key: &str) -> Result<Option<CacheEntry>, Error> {
        validate_key(key)?;
        let Some((flags, data)) = self.with_connection(|conn| conn.get(key))? else {
            return Ok(None);
        };
        let entry = if flags & FLAG_COMPRESSED != 0 {
            codec::decode_compressed(&data)
        } else {
            codec::deserialize(&data)
        };
        entry.map(Some).map_err(|err| err.with_key(key))
    }

    fn try_set(&mut self, key: &str, entry: &CacheEntry, ttl: u64) -> Result<(), Error> {
        validate_key(key)?;
        let entry = stamp_expiry(entry, ttl, self.clock.now());
        let (flags, payload) = if self.settings.compress {
            (FLAG_COMPRESSED, codec::encode_compressed(&entry)?)
        } else {
            (0, codec::serialize(&entry)?)
        };
        if payload.is_empty() {
            return Err(Error::new(ErrorKind::Internal).with_message("empty cache payload"));
        }
        let exptime = self.exptime(self.settings.resolve_expiry(ttl));
        self.with_connection(|conn| conn.set(key, flags, exptime, &payload))
    }
}

impl CacheStore for MemcachedStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Memcached
    }

    fn get(&mut self, key: &str) -> Option<CacheEntry> {
        match self.try_get(key) {
            Ok(Some(entry)) if entry.is_expired(self.clock.now()) => {
                self.delete(key, 0);
                None
            }
            Ok(entry) => entry,
            Err(err) => {
                report_soft_failure(self.show_errors, BackendKind::Memcached, "get", &err);
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
                report_soft_failure(self.show_errors, BackendKind::Memcached, "set", &err);
                false
            }
        }
    }

    fn delete(&mut self, key: &str, timeout: u64) -> bool {
        if validate_key(key).is_err() {
            return false;
        }
        let exptime = self.exptime(timeout);
        let result = self.with_connection(|conn| {
            if timeout == 0 {
                conn.delete(key)
            } else {
                conn.touch(key, exptime)
            }
        });
        match result {
            Ok(found) => found,
            Err(err) => {
                report_soft_failure(self.show_errors, BackendKind::Memcached, "delete", &err);
                false
            }
        }
    }

    fn flush(&mut self) -> bool {
        match self.with_connection(|conn| conn.flush_all()) {
            Ok(()) => true,
            Err(err) => {
                report_soft_failure(self.show_errors, BackendKind::Memcached, "flush", &err);
                false
            }
        }
    }
}

fn open_connection(settings: &RemoteConfig) -> Result<Connection, Error> {
    let port = settings.port_for(BackendKind::Memcached);
    let timeout = settings.connect_timeout();
    let addrs = (settings.host.as_str(), port).to_socket_addrs().map_err(|err| {
        Error::new(ErrorKind::Unavailable)
            .with_message(format!("could not resolve {}:{port}", settings.host))
            .with_source(err)
    })?;
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_read_timeout(Some(timeout)).map_err(net_error)?;
                stream.set_write_timeout(Some(timeout)).map_err(net_error)?;
                stream.set_nodelay(true).map_err(net_error)?;
                let writer = stream.try_clone().map_err(net_error)?;
                return Ok(Connection {
                    reader: BufReader::new(stream),
                    writer,
                });
            }
            Err(err) => last_err = Some(err),
        }
    }
    let err = Error::new(ErrorKind::Unavailable)
        .with_message(format!("could not connect to memcached at {}:{port}", settings.host));
    Err(match last_err {
        Some(source) => err.with_source(source),
        None => err,
    })
}

impl Connection {
    fn get(&mut self, key: &str) -> Result<Option<(u32, Vec<u8>)>, Error> {
        self.send(format!("get {key}\r\n").as_bytes())?;
        let line = self.read_line()?;
        if line == "END" {
            return Ok(None);
        }
        let mut parts = line.split_ascii_whitespace();
        let (Some("VALUE"), Some(_key), Some(flags), Some(len)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(protocol_error(&line));
        };
        let flags: u32 = flags.parse().map_err(|_| protocol_error(&line))?;
        let len: usize = len.parse().map_err(|_| protocol_error(&line))?;
        if len > MAX_VALUE_LEN {
            return Err(protocol_error(&line));
        }
        let mut data = vec![0u8; len + 2];
        self.reader.read_exact(&mut data).map_err(net_error)?;
        if !data.ends_with(b"\r\n") {
            return Err(protocol_error("value block not terminated"));
        }
        data.truncate(len);
        let end = self.read_line()?;
        if end != "END" {
            return Err(protocol_error(&end));
        }
        Ok(Some((flags, data)))
    }

    fn set(&mut self, key: &str, flags: u32, exptime: u64, data: &[u8]) -> Result<(), Error> {
        let mut request = format!("set {key} {flags} {exptime} {}\r\n", data.len()).into_bytes();
        request.extend_from_slice(data);
        request.extend_from_slice(b"\r\n");
        self.send(&request)?;
        let line = self.read_line()?;
        match line.as_str() {
            "STORED" => Ok(()),
            _ => Err(protocol_error(&line)),
        }
    }

    fn delete(&mut self, key: &str) -> Result<bool, Error> {
        self.send(format!("delete {key}\r\n").as_bytes())?;
        let line = self.read_line()?;
        match line.as_str() {
            "DELETED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            _ => Err(protocol_error(&line)),
        }
    }

    fn touch(&mut self, key: &str, exptime: u64) -> Result<bool, Error> {
        self.send(format!("touch {key} {exptime}\r\n").as_bytes())?;
        let line = self.read_line()?;
        match line.as_str() {
            "TOUCHED" => Ok(true),
            "NOT_FOUND" => Ok(false),
            _ => Err(protocol_error(&line)),
        }
    }

    fn flush_all(&mut self) -> Result<(), Error> {
        self.send(b"flush_all\r\n")?;
        let line = self.read_line()?;
        match line.as_str() {
            "OK" => Ok(()),
            _ => Err(protocol_error(&line)),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.writer.write_all(bytes).map_err(net_error)?;
        self.writer.flush().map_err(net_error)
    }

    fn read_line(&mut self) -> Result<String, Error> {
        let mut line = Vec::new();
        let read = self.reader.read_until(b'\n', &mut line).map_err(net_error)?;
        if read == 0 {
            return Err(Error::new(ErrorKind::Unavailable)
                .with_message("memcached closed the connection"));
        }
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        Ok(String::from_utf8_lossy(&line).into_owned())
    }
}

fn validate_key(key: &str) -> Result<(), Error> {
    if key.is_empty() || key.len() > MAX_KEY_LEN {
        return Err(Error::new(ErrorKind::Usage)
            .with_message(format!("memcached keys must be 1..={MAX_KEY_LEN} bytes")));
    }
    if key.bytes().any(|byte| byte <= b' ' || byte == 0x7f) {
        return Err(Error::new(ErrorKind::Usage)
            .with_message("memcached keys must not contain whitespace or control bytes")
            .with_key(key));
    }
    Ok(())
}

fn net_error(err: std::io::Error) -> Error {
    let kind = match io_error_kind(&err) {
        ErrorKind::NotFound => ErrorKind::Io,
        kind => kind,
    };
    Error::new(kind)
        .with_message("memcached i/o failed")
        .with_source(err)
}

fn protocol_error(line: &str) -> Error {
    Error::new(ErrorKind::Io).with_message(format!("unexpected memcached reply: {line}"))
}

#[cfg(test)]
mod tests {
    use super::{MAX_RELATIVE_EXPTIME, MemcachedStore, validate_key};
    use crate::core::clock::ManualClock;
    use crate::core::config::RemoteConfig;
    use crate::store::CacheStore;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn keys_follow_protocol_limits() {
        assert!(validate_key("abc123").is_ok());
        assert!(validate_key("").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key("line\nbreak").is_err());
        assert!(validate_key(&"k".repeat(251)).is_err());
    }

    #[test]
    fn oversized_value_header_drops_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().expect("accept");
            let mut writer = stream.try_clone().expect("clone");
            let mut request = String::new();
            BufReader::new(stream).read_line(&mut request).expect("request");
            let reply = format!("VALUE k 0 {}\r\n", usize::MAX);
            writer.write_all(reply.as_bytes()).expect("reply");
            request
        });

        let settings = RemoteConfig {
            host: addr.ip().to_string(),
            port: Some(addr.port()),
            connect_timeout_ms: 500,
            ..RemoteConfig::default()
        };
        let mut store = MemcachedStore::new(settings, Arc::new(ManualClock::new(0)));
        assert!(store.get("k").is_none());
        assert!(!store.is_connected());
        assert_eq!(server.join().expect("server"), "get k\r\n");
    }

    #[test]
    fn long_ttls_become_absolute_timestamps() {
        let clock = Arc::new(ManualClock::new(1_700_000_000));
        let store = MemcachedStore::new(RemoteConfig::default(), clock);
        assert_eq!(store.exptime(60), 60);
        assert_eq!(store.exptime(MAX_RELATIVE_EXPTIME), MAX_RELATIVE_EXPTIME);
        assert_eq!(
            store.exptime(MAX_RELATIVE_EXPTIME + 1),
            1_700_000_000 + MAX_RELATIVE_EXPTIME + 1
        );
    }
}
