//! Purpose: Define the stable public Rust API boundary for querycache.
//! Exports: Executor, cache stores, configuration, and the text/query helpers callers need.
//! Role: Public, additive-only surface; internal module paths may move.
//! Invariants: Everything a consumer needs is reachable from this module alone.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::clock::{Clock, ManualClock, SystemClock, system_clock};
pub use crate::core::config::{BackendKind, Config, DiskConfig, ReconnectConfig, RemoteConfig};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::fingerprint::{Fingerprint, fingerprint};
pub use crate::core::snapshot::{CacheEntry, Cell, ColumnInfo, ColumnMeta, Row};
pub use crate::driver::{ColumnDefinition, Driver, Outcome};
pub use crate::executor::CachingExecutor;
pub use crate::query::prepare::{Arg, BasicEscaper, Escape, FieldFormat, FieldTypes, prepare};
pub use crate::query::statement::{StatementClass, classify};
pub use crate::store::{
    CacheStore, DiskStore, MemcachedStore, QueryCache, RedisStore, open_store,
};
pub use crate::text::charset::{Charset, CharsetResolver};
pub use crate::text::sanitize::{SanitizedField, TextSanitizer, sanitize_local};
