//! Purpose: Hold the recognized configuration surface for the cache and executor.
//! Exports: `Config`, `BackendKind`, `DiskConfig`, `RemoteConfig`, `ReconnectConfig`.
//! Role: Deserialized once (JSON or defaults), then read-only for the executor's lifetime.
//! Invariants: Every field has a default so partial config files are valid.
//! Invariants: A TTL of zero or none always resolves to `cache_timeout`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::query::prepare::{FieldFormat, FieldTypes};

pub const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_REMOTE_EXPIRY_SECS: u64 = 3600;
pub const DEFAULT_MEMCACHED_PORT: u16 = 11211;
pub const DEFAULT_REDIS_PORT: u16 = 6379;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    #[default]
    Disk,
    #[serde(alias = "remote-kv-a")]
    Memcached,
    #[serde(alias = "remote-kv-b")]
    Redis,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "disk" => Some(BackendKind::Disk),
            "memcached" | "memcache" | "remote-kv-a" => Some(BackendKind::Memcached),
            "redis" | "remote-kv-b" => Some(BackendKind::Redis),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Disk => "disk",
            BackendKind::Memcached => "memcached",
            BackendKind::Redis => "redis",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskConfig {
    pub dir: PathBuf,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("querycache"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub host: String,
    pub port: Option<u16>,
    pub expiry: u64,
    pub compress: bool,
    pub connect_timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: None,
            expiry: DEFAULT_REMOTE_EXPIRY_SECS,
            compress: false,
            connect_timeout_ms: 1000,
        }
    }
}

impl RemoteConfig {
    pub fn port_for(&self, backend: BackendKind) -> u16 {
        self.port.unwrap_or(match backend {
            BackendKind::Redis => DEFAULT_REDIS_PORT,
            _ => DEFAULT_MEMCACHED_PORT,
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    /// `explicit` when non-zero, otherwise the backend default expiry.
    pub fn resolve_expiry(&self, explicit: u64) -> u64 {
        if explicit == 0 { self.expiry } else { explicit }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub retries: u32,
    pub backoff_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retries: 5,
            backoff_ms: 1000,
        }
    }
}

impl ReconnectConfig {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache_enabled: bool,
    pub backend: BackendKind,
    pub cache_timeout: u64,
    pub cache_inserts: bool,
    pub cache_prefix: String,
    pub show_errors: bool,
    pub disk: DiskConfig,
    pub remote: RemoteConfig,
    pub reconnect: ReconnectConfig,
    pub field_types: BTreeMap<String, FieldFormat>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_enabled: false,
            backend: BackendKind::Disk,
            cache_timeout: DEFAULT_CACHE_TIMEOUT_SECS,
            cache_inserts: false,
            cache_prefix: String::new(),
            show_errors: false,
            disk: DiskConfig::default(),
            remote: RemoteConfig::default(),
            reconnect: ReconnectConfig::default(),
            field_types: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_json_str(text: &str) -> Result<Self, Error> {
        serde_json::from_str(text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid config: {err}"))
                .with_source(err)
        })
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message("failed to read config file")
                .with_path(path)
                .with_source(err)
        })?;
        Self::from_json_str(&text).map_err(|err| err.with_path(path))
    }

    pub fn resolve_ttl(&self, explicit: Option<u64>) -> u64 {
        match explicit {
            Some(ttl) if ttl > 0 => ttl,
            _ => self.cache_timeout,
        }
    }

    pub fn field_types(&self) -> FieldTypes {
        FieldTypes::from_map(&self.field_types)
    }
}

#[cfg(test)]
mod tests {
    use super::{BackendKind, Config, DEFAULT_CACHE_TIMEOUT_SECS};
    use crate::core::error::ErrorKind;
    use crate::query::prepare::FieldFormat;

    #[test]
    fn partial_config_keeps_defaults() {
        let config = Config::from_json_str(
            r#"{"cache_enabled": true, "backend": "remote-kv-a", "remote": {"port": 22122}}"#,
        )
        .expect("config");
        assert!(config.cache_enabled);
        assert_eq!(config.backend, BackendKind::Memcached);
        assert_eq!(config.cache_timeout, DEFAULT_CACHE_TIMEOUT_SECS);
        assert_eq!(config.remote.host, "localhost");
        assert_eq!(config.remote.port_for(config.backend), 22122);
        assert_eq!(config.reconnect.retries, 5);
    }

    #[test]
    fn remote_port_defaults_follow_backend() {
        let config = Config::default();
        assert_eq!(config.remote.port_for(BackendKind::Memcached), 11211);
        assert_eq!(config.remote.port_for(BackendKind::Redis), 6379);
    }

    #[test]
    fn ttl_resolution_prefers_explicit_non_zero() {
        let config = Config {
            cache_timeout: 90,
            ..Config::default()
        };
        assert_eq!(config.resolve_ttl(Some(5)), 5);
        assert_eq!(config.resolve_ttl(Some(0)), 90);
        assert_eq!(config.resolve_ttl(None), 90);
    }

    #[test]
    fn field_types_table_is_built_from_config() {
        let config = Config::from_json_str(
            r#"{"field_types": {"id": "integer", "score": "float", "name": "string"}}"#,
        )
        .expect("config");
        let types = config.field_types();
        assert_eq!(types.get("id"), Some(FieldFormat::Integer));
        assert_eq!(types.get("score"), Some(FieldFormat::Float));
        assert_eq!(types.get("missing"), None);
    }

    #[test]
    fn backend_names_parse_with_aliases() {
        assert_eq!(BackendKind::parse("Disk"), Some(BackendKind::Disk));
        assert_eq!(BackendKind::parse("remote-kv-b"), Some(BackendKind::Redis));
        assert_eq!(BackendKind::parse("memcache"), Some(BackendKind::Memcached));
        assert_eq!(BackendKind::parse("apc"), None);
    }

    #[test]
    fn malformed_config_is_usage_error() {
        let err = Config::from_json_str(r#"{"backend": "apc"}"#).expect_err("bad backend");
        assert_eq!(err.kind(), ErrorKind::Usage);
    }
}
