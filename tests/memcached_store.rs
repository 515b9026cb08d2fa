// Memcached backend against an in-process server speaking the ASCII protocol subset the store uses.
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use querycache::api::{
    CacheEntry, CacheStore, Cell, Clock, ColumnMeta, ManualClock, MemcachedStore, RemoteConfig,
    fingerprint,
};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Clone, Debug, Default)]
struct Item {
    flags: u32,
    exptime: u64,
    data: Vec<u8>,
}

#[derive(Clone, Default)]
struct FakeMemcached {
    items: Arc<Mutex<HashMap<String, Item>>>,
}

impl FakeMemcached {
    fn start() -> TestResult<(Self, SocketAddr)> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        Ok((Self::serve(listener), addr))
    }

    fn start_on(addr: SocketAddr) -> TestResult<Self> {
        Ok(Self::serve(TcpListener::bind(addr)?))
    }

    fn serve(listener: TcpListener) -> Self {
        let server = Self::default();
        let shared = server.clone();
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let conn = shared.clone();
                thread::spawn(move || {
                    let _ = conn.handle(stream);
                });
            }
        });
        server
    }

    fn item(&self, key: &str) -> Option<Item> {
        self.items.lock().expect("lock").get(key).cloned()
    }

    fn handle(&self, stream: TcpStream) -> std::io::Result<()> {
        let mut writer = stream.try_clone()?;
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? == 0 {
                return Ok(());
            }
            let parts: Vec<&str> = line.split_whitespace().collect();
            let reply = match parts.as_slice() {
                ["get", key] => match self.item(key) {
                    Some(item) => {
                        let mut out =
                            format!("VALUE {key} {} {}\r\n", item.flags, item.data.len())
                                .into_bytes();
                        out.extend_from_slice(&item.data);
                        out.extend_from_slice(b"\r\nEND\r\n");
                        out
                    }
                    None => b"END\r\n".to_vec(),
                },
                ["set", key, flags, exptime, len] => {
                    let len: usize = len.parse().unwrap_or(0);
                    let mut data = vec![0u8; len + 2];
                    reader.read_exact(&mut data)?;
                    data.truncate(len);
                    let item = Item {
                        flags: flags.parse().unwrap_or(0),
                        exptime: exptime.parse().unwrap_or(0),
                        data,
                    };
                    self.items.lock().expect("lock").insert(key.to_string(), item);
                    b"STORED\r\n".to_vec()
                }
                ["delete", key] => match self.items.lock().expect("lock").remove(*key) {
                    Some(_) => b"DELETED\r\n".to_vec(),
                    None => b"NOT_FOUND\r\n".to_vec(),
                },
                ["touch", key, exptime] => match self.items.lock().expect("lock").get_mut(*key) {
                    Some(item) => {
                        item.exptime = exptime.parse().unwrap_or(0);
                        b"TOUCHED\r\n".to_vec()
                    }
                    None => b"NOT_FOUND\r\n".to_vec(),
                },
                ["flush_all"] => {
                    self.items.lock().expect("lock").clear();
                    b"OK\r\n".to_vec()
                }
                _ => b"ERROR\r\n".to_vec(),
            };
            writer.write_all(&reply)?;
            writer.flush()?;
        }
    }
}

fn settings(addr: SocketAddr, compress: bool) -> RemoteConfig {
    RemoteConfig {
        host: addr.ip().to_string(),
        port: Some(addr.port()),
        compress,
        connect_timeout_ms: 500,
        ..RemoteConfig::default()
    }
}

fn entry(clock: &ManualClock, ttl: u64) -> CacheEntry {
    CacheEntry::new(
        vec![ColumnMeta::new("n", "int")],
        vec![vec![Cell::Int(1)], vec![Cell::Int(2)], vec![Cell::Int(3)]],
        3,
        3,
        clock.now(),
        ttl,
    )
}

#[test]
fn round_trip_plain_and_compressed() -> TestResult<()> {
    let (server, addr) = FakeMemcached::start()?;
    let clock = Arc::new(ManualClock::new(1_700_000_000));
    for compress in [false, true] {
        let mut store = MemcachedStore::new(settings(addr, compress), clock.clone());
        let key = fingerprint("mc_", &format!("SELECT n FROM t -- {compress}")).into_string();
        let stored = entry(&clock, 60);
        assert!(store.set(&key, &stored, 60));
        assert_eq!(store.get(&key), Some(stored));

        let item = server.item(&key).ok_or("item stored")?;
        assert_eq!(item.flags, u32::from(compress));
        assert_eq!(item.exptime, 60);
    }
    Ok(())
}

#[test]
fn zero_ttl_uses_backend_default_expiry() -> TestResult<()> {
    let (server, addr) = FakeMemcached::start()?;
    let clock = Arc::new(ManualClock::new(1_000));
    let mut store = MemcachedStore::new(settings(addr, false), clock.clone());
    assert!(store.set("k1", &entry(&clock, 3_600), 0));
    assert_eq!(server.item("k1").ok_or("item")?.exptime, 3_600);
    Ok(())
}

#[test]
fn expired_payload_is_evicted_on_read() -> TestResult<()> {
    let (server, addr) = FakeMemcached::start()?;
    let clock = Arc::new(ManualClock::new(1_000));
    let mut store = MemcachedStore::new(settings(addr, false), clock.clone());
    assert!(store.set("short", &entry(&clock, 5), 5));
    clock.advance_secs(6);
    assert!(store.get("short").is_none());
    assert!(server.item("short").is_none());
    Ok(())
}

#[test]
fn corrupt_payload_is_evicted_on_read() -> TestResult<()> {
    let (server, addr) = FakeMemcached::start()?;
    let clock = Arc::new(ManualClock::new(1_000));
    server.items.lock().expect("lock").insert(
        "bad".to_string(),
        Item {
            flags: 1,
            exptime: 0,
            data: b"garbage".to_vec(),
        },
    );
    let mut store = MemcachedStore::new(settings(addr, false), clock);
    assert!(store.get("bad").is_none());
    assert!(server.item("bad").is_none());
    Ok(())
}

#[test]
fn delete_touch_and_flush() -> TestResult<()> {
    let (server, addr) = FakeMemcached::start()?;
    let clock = Arc::new(ManualClock::new(1_000));
    let mut store = MemcachedStore::new(settings(addr, false), clock.clone());
    assert!(store.set("a", &entry(&clock, 60), 60));
    assert!(store.set("b", &entry(&clock, 60), 60));

    assert!(store.delete("a", 30));
    assert_eq!(server.item("a").ok_or("a")?.exptime, 30);
    assert!(store.delete("a", 0));
    assert!(!store.delete("a", 0));

    assert!(store.flush());
    assert!(server.item("b").is_none());
    Ok(())
}

#[test]
fn unreachable_server_degrades_then_recovers() -> TestResult<()> {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?
    };
    let clock = Arc::new(ManualClock::new(1_000));
    let mut store = MemcachedStore::new(settings(addr, false), clock.clone());

    assert!(!store.set("k", &entry(&clock, 60), 60));
    assert!(store.get("k").is_none());
    assert!(!store.is_connected());

    let server = FakeMemcached::start_on(addr)?;
    assert!(store.set("k", &entry(&clock, 60), 60));
    assert!(store.is_connected());
    assert!(store.get("k").is_some());
    assert!(server.item("k").is_some());
    Ok(())
}

#[test]
fn invalid_keys_are_soft_failures() -> TestResult<()> {
    let (_server, addr) = FakeMemcached::start()?;
    let clock = Arc::new(ManualClock::new(1_000));
    let mut store = MemcachedStore::new(settings(addr, false), clock.clone());
    assert!(!store.set("", &entry(&clock, 60), 60));
    assert!(!store.set("has space", &entry(&clock, 60), 60));
    assert!(store.get("has space").is_none());
    Ok(())
}
