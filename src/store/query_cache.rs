// Query-level cache: fingerprints query text and reads/writes result snapshots.
use std::sync::Arc;

use tracing::debug;

use super::CacheStore;
use crate::core::clock::Clock;
use crate::core::config::Config;
use crate::core::fingerprint::{Fingerprint, fingerprint};
use crate::core::snapshot::{CacheEntry, ColumnMeta, Row};
use crate::query::statement::StatementClass;

pub struct QueryCache {
    store: Box<dyn CacheStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    default_ttl: u64,
    cache_inserts: bool,
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("backend", &self.store.kind())
            .field("prefix", &self.prefix)
            .field("default_ttl", &self.default_ttl)
            .field("cache_inserts", &self.cache_inserts)
            .finish()
    }
}

impl QueryCache {
    pub fn new(config: &Config, store: Box<dyn CacheStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            prefix: config.cache_prefix.clone(),
            default_ttl: config.resolve_ttl(None),
            cache_inserts: config.cache_inserts,
        }
    }

    pub fn key_for(&self, query: &str) -> Fingerprint {
        fingerprint(&self.prefix, query)
    }

    pub fn store(&mut self) -> &mut dyn CacheStore {
        self.store.as_mut()
    }

    pub fn is_cacheable(&self, class: StatementClass) -> bool {
        if class == StatementClass::Ddl {
            return false;
        }
        !class.is_mutating() || self.cache_inserts
    }

    pub fn lookup(&mut self, query: &str) -> Option<CacheEntry> {
        let key = self.key_for(query);
        let entry = self.store.get(key.as_str());
        debug!(key = %key, hit = entry.is_some(), "query cache lookup");
        entry
    }

    /// Writes a snapshot unless the statement class is not cacheable. Returns whether it was stored.
    pub fn remember(
        &mut self,
        query: &str,
        class: StatementClass,
        columns: Vec<ColumnMeta>,
        rows: Vec<Row>,
        return_value: u64,
        ttl: Option<u64>,
    ) -> bool {
        if !self.is_cacheable(class) {
            return false;
        }
        let ttl = match ttl {
            Some(ttl) if ttl > 0 => ttl,
            _ => self.default_ttl,
        };
        let row_count = rows.len() as u64;
        let entry = CacheEntry::new(columns, rows, row_count, return_value, self.clock.now(), ttl);
        let key = self.key_for(query);
        let stored = self.store.set(key.as_str(), &entry, ttl);
        debug!(key = %key, ttl, stored, "query cache store");
        stored
    }
}

#[cfg(test)]
mod tests {
    use super::QueryCache;
    use crate::core::clock::ManualClock;
    use crate::core::config::Config;
    use crate::core::snapshot::{Cell, ColumnMeta};
    use crate::query::statement::StatementClass;
    use crate::store::DiskStore;
    use std::sync::Arc;

    fn disk_cache(
        dir: &std::path::Path,
        clock: Arc<ManualClock>,
        cache_inserts: bool,
    ) -> QueryCache {
        let config = Config {
            cache_prefix: "t_".to_string(),
            cache_timeout: 30,
            cache_inserts,
            ..Config::default()
        };
        let store = DiskStore::new(dir, clock.clone());
        QueryCache::new(&config, Box::new(store), clock)
    }

    #[test]
    fn read_results_round_trip_with_default_ttl() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(1_000));
        let mut cache = disk_cache(dir.path(), clock.clone(), false);
        assert!(cache.lookup("SELECT 1").is_none());

        let stored = cache.remember(
            "SELECT 1",
            StatementClass::Read,
            vec![ColumnMeta::new("1", "bigint")],
            vec![vec![Cell::Int(1)]],
            1,
            None,
        );
        assert!(stored);
        let entry = cache.lookup("SELECT 1").expect("hit");
        assert_eq!(entry.row_count, 1);
        assert_eq!(entry.expires_at, 1_030.0);

        clock.advance_secs(31);
        assert!(cache.lookup("SELECT 1").is_none());
    }

    #[test]
    fn mutations_are_only_cached_when_enabled() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(1_000));
        let mut cache = disk_cache(dir.path(), clock.clone(), false);
        for class in [StatementClass::Insert, StatementClass::Mutation, StatementClass::Ddl] {
            assert!(!cache.remember("UPDATE t SET a = 1", class, vec![], vec![], 1, None));
        }
        assert!(cache.lookup("UPDATE t SET a = 1").is_none());

        let mut cache = disk_cache(dir.path(), clock, true);
        let insert = "INSERT INTO t VALUES (1)";
        assert!(cache.remember(insert, StatementClass::Insert, vec![], vec![], 1, None));
        assert!(cache.lookup(insert).is_some());
        assert!(!cache.remember("DROP TABLE t", StatementClass::Ddl, vec![], vec![], 0, None));
    }

    #[test]
    fn keys_use_the_configured_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let clock = Arc::new(ManualClock::new(0));
        let cache = disk_cache(dir.path(), clock, false);
        assert_eq!(
            cache.key_for("SELECT 1"),
            crate::core::fingerprint::fingerprint("", "t_SELECT 1")
        );
    }
}
