//! Purpose: Run queries through a driver with a read-through result cache.
//! Exports: `CachingExecutor`.
//! Role: Consumer-facing data-access core: cache check, execute on miss, populate, bookkeeping.
//! Invariants: A cache hit never reaches the driver; results are restored exactly as stored.
//! Invariants: Cache failures degrade to uncached execution; driver and sanitize failures surface.
//! Invariants: A rejected insert or replace resets `insert_id` to zero.
//! Invariants: Column metadata is fetched from the driver at most once per result.

use std::sync::Arc;
use std::thread;

use tracing::{debug, warn};

use crate::core::clock::{Clock, system_clock};
use crate::core::config::{Config, ReconnectConfig};
use crate::core::error::{Error, ErrorKind};
use crate::core::snapshot::{ColumnInfo, ColumnMeta, Row};
use crate::driver::{Driver, Outcome};
use crate::query::prepare::{Arg, FieldFormat, FieldTypes, prepare};
use crate::query::statement::classify;
use crate::store::{CacheStore, QueryCache, open_store};
use crate::text::charset::{Charset, CharsetResolver};
use crate::text::sanitize::{SanitizedField, TextSanitizer};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum WriteKind {
    Insert,
    Replace,
}

impl WriteKind {
    fn verb(self) -> &'static str {
        match self {
            WriteKind::Insert => "INSERT",
            WriteKind::Replace => "REPLACE",
        }
    }
}

pub struct CachingExecutor<D: Driver> {
    driver: D,
    cache: Option<QueryCache>,
    sanitizer: TextSanitizer,
    field_types: FieldTypes,
    reconnect: ReconnectConfig,
    last_query: Option<String>,
    last_error: Option<String>,
    last_rows: Vec<Row>,
    last_row_count: u64,
    last_columns: Option<Vec<ColumnMeta>>,
    last_from_cache: bool,
    rows_affected: u64,
    insert_id: u64,
    num_queries: u64,
    cache_hits: u64,
}

impl<D: Driver + std::fmt::Debug> std::fmt::Debug for CachingExecutor<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachingExecutor")
            .field("driver", &self.driver)
            .field("cache", &self.cache)
            .field("last_query", &self.last_query)
            .field("num_queries", &self.num_queries)
            .field("cache_hits", &self.cache_hits)
            .finish()
    }
}

impl<D: Driver> CachingExecutor<D> {
    /// Opens the configured cache backend when caching is enabled.
    pub fn new(driver: D, config: &Config) -> Self {
        Self::with_clock(driver, config, system_clock())
    }

    pub fn with_clock(driver: D, config: &Config, clock: Arc<dyn Clock>) -> Self {
        let cache = config.cache_enabled.then(|| {
            let store = open_store(config, clock.clone());
            QueryCache::new(config, store, clock)
        });
        Self::build(driver, config, cache)
    }

    /// Uses `store` regardless of `config.cache_enabled`.
    pub fn with_store(
        driver: D,
        config: &Config,
        store: Box<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache = QueryCache::new(config, store, clock);
        Self::build(driver, config, Some(cache))
    }

    fn build(driver: D, config: &Config, cache: Option<QueryCache>) -> Self {
        Self {
            driver,
            cache,
            sanitizer: TextSanitizer::new(),
            field_types: config.field_types(),
            reconnect: config.reconnect.clone(),
            last_query: None,
            last_error: None,
            last_rows: Vec::new(),
            last_row_count: 0,
            last_columns: None,
            last_from_cache: false,
            rows_affected: 0,
            insert_id: 0,
            num_queries: 0,
            cache_hits: 0,
        }
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn cache_mut(&mut self) -> Option<&mut QueryCache> {
        self.cache.as_mut()
    }

    /// Memoized schema charsets; call `invalidate` after a schema change.
    pub fn charsets(&mut self) -> &mut CharsetResolver {
        self.sanitizer.resolver()
    }

    pub fn resolve_column_charset(
        &mut self,
        table: &str,
        column: &str,
    ) -> Result<Option<Charset>, Error> {
        self.sanitizer
            .resolver()
            .resolve_column_charset(&mut self.driver, table, column)
    }

    /// Templated query text using this driver's escaping.
    pub fn prepare(&self, query: Option<&str>, args: &[Arg]) -> Option<String> {
        prepare(query, args, &self.driver)
    }

    pub fn execute(&mut self, query: &str) -> Result<u64, Error> {
        self.execute_with_ttl(query, None)
    }

    /// Runs `query`, serving it from cache when possible. Returns the row count for reads
    /// and the affected-row count for mutations.
    pub fn execute_with_ttl(&mut self, query: &str, ttl: Option<u64>) -> Result<u64, Error> {
        self.flush();
        self.last_query = Some(query.to_string());
        let class = classify(query);

        if let Some(entry) = self.cache.as_mut().and_then(|cache| cache.lookup(query)) {
            debug!(rows = entry.row_count, "served from cache");
            self.num_queries += 1;
            self.cache_hits += 1;
            self.last_columns = Some(entry.columns);
            self.last_rows = entry.rows;
            self.last_row_count = entry.row_count;
            self.last_from_cache = true;
            return Ok(entry.return_value);
        }

        let outcome = match self.run_with_recovery(query) {
            Ok(outcome) => outcome,
            Err(err) => {
                self.last_error = Some(err.to_string());
                if class.tracks_insert_id() {
                    self.insert_id = 0;
                }
                return Err(err);
            }
        };
        self.num_queries += 1;

        let return_value = match outcome {
            Outcome::Rows(rows) => {
                self.last_row_count = rows.len() as u64;
                self.last_rows = rows;
                self.last_row_count
            }
            Outcome::Affected { rows, insert_id } => {
                self.rows_affected = rows;
                if class.tracks_insert_id() {
                    self.insert_id = insert_id;
                }
                rows
            }
            Outcome::Done => 0,
        };

        let cacheable = self
            .cache
            .as_ref()
            .is_some_and(|cache| cache.is_cacheable(class));
        if cacheable {
            let columns = self.last_columns().to_vec();
            let rows = self.last_rows.clone();
            if let Some(cache) = self.cache.as_mut() {
                cache.remember(query, class, columns, rows, return_value, ttl);
            }
        }
        Ok(return_value)
    }

    /// Retries `reconnect` with a fixed backoff, then reruns the query once.
    fn run_with_recovery(&mut self, query: &str) -> Result<Outcome, Error> {
        match self.driver.query(query) {
            Err(err) if err.kind() == ErrorKind::ConnectionLost => {
                warn!(error = %err, "database connection lost; reconnecting");
                self.recover(err)?;
                self.driver.query(query)
            }
            result => result,
        }
    }

    fn recover(&mut self, cause: Error) -> Result<(), Error> {
        let retries = self.reconnect.retries;
        for attempt in 1..=retries {
            match self.driver.reconnect() {
                Ok(()) => {
                    debug!(attempt, "database reconnected");
                    return Ok(());
                }
                Err(err) => {
                    warn!(attempt, retries, error = %err, "reconnect failed");
                    if attempt < retries {
                        thread::sleep(self.reconnect.backoff());
                    }
                }
            }
        }
        Err(Error::new(ErrorKind::ConnectionLost)
            .with_message(format!("database unreachable after {retries} reconnect attempts"))
            .with_source(cause))
    }

    /// Clears the previous result; cumulative counters survive.
    pub fn flush(&mut self) {
        self.last_query = None;
        self.last_error = None;
        self.last_rows.clear();
        self.last_row_count = 0;
        self.last_columns = None;
        self.last_from_cache = false;
        self.rows_affected = 0;
    }

    /// Column metadata for the last result, loaded from the driver on first access.
    pub fn last_columns(&mut self) -> &[ColumnMeta] {
        if self.last_columns.is_none() {
            self.last_columns = Some(self.driver.columns());
        }
        self.last_columns.as_deref().unwrap_or(&[])
    }

    pub fn column(&mut self, offset: usize) -> Option<&ColumnMeta> {
        self.last_columns().get(offset)
    }

    /// One property of the last result's columns: all of them, or only the one at `offset`.
    pub fn col_info(&mut self, kind: ColumnInfo, offset: Option<usize>) -> Vec<String> {
        let columns = self.last_columns();
        match offset {
            Some(offset) => columns
                .get(offset)
                .map(|column| vec![column.info(kind)])
                .unwrap_or_default(),
            None => columns.iter().map(|column| column.info(kind)).collect(),
        }
    }

    pub fn last_rows(&self) -> &[Row] {
        &self.last_rows
    }

    pub fn last_row_count(&self) -> u64 {
        self.last_row_count
    }

    pub fn last_query(&self) -> Option<&str> {
        self.last_query.as_deref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_from_cache(&self) -> bool {
        self.last_from_cache
    }

    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn insert_id(&self) -> u64 {
        self.insert_id
    }

    /// Successful queries, whether served by the driver or from cache.
    pub fn num_queries(&self) -> u64 {
        self.num_queries
    }

    pub fn cache_hits(&self) -> u64 {
        self.cache_hits
    }

    /// Cell `x` of row `y`, running `query` first when given. Empty text reads as `None`.
    pub fn get_var(
        &mut self,
        query: Option<&str>,
        x: usize,
        y: usize,
    ) -> Result<Option<String>, Error> {
        if let Some(query) = query {
            self.execute(query)?;
        }
        Ok(self
            .last_rows
            .get(y)
            .and_then(|row| row.get(x))
            .and_then(|cell| cell.to_text()))
    }

    pub fn get_row(&mut self, query: Option<&str>, y: usize) -> Result<Option<Row>, Error> {
        if let Some(query) = query {
            self.execute(query)?;
        }
        Ok(self.last_rows.get(y).cloned())
    }

    pub fn get_col(&mut self, query: Option<&str>, x: usize) -> Result<Vec<Option<String>>, Error> {
        if let Some(query) = query {
            self.execute(query)?;
        }
        Ok(self
            .last_rows
            .iter()
            .map(|row| row.get(x).and_then(|cell| cell.to_text()))
            .collect())
    }

    pub fn insert(
        &mut self,
        table: &str,
        data: Vec<(String, Arg)>,
        formats: &[FieldFormat],
    ) -> Result<u64, Error> {
        self.insert_or_replace(WriteKind::Insert, table, data, formats)
    }

    pub fn replace(
        &mut self,
        table: &str,
        data: Vec<(String, Arg)>,
        formats: &[FieldFormat],
    ) -> Result<u64, Error> {
        self.insert_or_replace(WriteKind::Replace, table, data, formats)
    }

    fn insert_or_replace(
        &mut self,
        kind: WriteKind,
        table: &str,
        data: Vec<(String, Arg)>,
        formats: &[FieldFormat],
    ) -> Result<u64, Error> {
        let result = self
            .sanitized(table, data, formats)
            .and_then(|fields| {
                if fields.is_empty() {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message(format!("{} needs at least one column", kind.verb())));
                }
                let columns = join(&fields, ",", |field| quote_ident(&field.column));
                let placeholders = join(&fields, ",", |field| {
                    field.target_format.placeholder().to_string()
                });
                let template = format!(
                    "{} INTO {} ({columns}) VALUES ({placeholders})",
                    kind.verb(),
                    quote_ident(table)
                );
                self.render(&template, &fields, &[])
            });
        match result {
            Ok(query) => self.execute(&query),
            Err(err) => {
                self.insert_id = 0;
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn update(
        &mut self,
        table: &str,
        data: Vec<(String, Arg)>,
        conditions: Vec<(String, Arg)>,
        formats: &[FieldFormat],
        condition_formats: &[FieldFormat],
    ) -> Result<u64, Error> {
        let query = self.sanitized(table, data, formats).and_then(|fields| {
            let conds = self.sanitized(table, conditions, condition_formats)?;
            if fields.is_empty() || conds.is_empty() {
                return Err(Error::new(ErrorKind::Usage)
                    .with_message("UPDATE needs at least one column and one condition"));
            }
            let sets = join(&fields, ", ", |field| {
                format!("{} = {}", quote_ident(&field.column), field.target_format.placeholder())
            });
            let wheres = where_clause(&conds);
            let template = format!("UPDATE {} SET {sets} WHERE {wheres}", quote_ident(table));
            self.render(&template, &fields, &conds)
        });
        self.run_write(query)
    }

    pub fn delete(
        &mut self,
        table: &str,
        conditions: Vec<(String, Arg)>,
        condition_formats: &[FieldFormat],
    ) -> Result<u64, Error> {
        let query = self
            .sanitized(table, conditions, condition_formats)
            .and_then(|conds| {
                if conds.is_empty() {
                    return Err(Error::new(ErrorKind::Usage)
                        .with_message("DELETE needs at least one condition"));
                }
                let template = format!(
                    "DELETE FROM {} WHERE {}",
                    quote_ident(table),
                    where_clause(&conds)
                );
                self.render(&template, &conds, &[])
            });
        self.run_write(query)
    }

    fn run_write(&mut self, query: Result<String, Error>) -> Result<u64, Error> {
        match query {
            Ok(query) => self.execute(&query),
            Err(err) => {
                self.last_error = Some(err.to_string());
                Err(err)
            }
        }
    }

    fn sanitized(
        &mut self,
        table: &str,
        values: Vec<(String, Arg)>,
        formats: &[FieldFormat],
    ) -> Result<Vec<SanitizedField>, Error> {
        let mut fields = self.sanitizer.prepare_fields(
            &mut self.driver,
            table,
            values,
            formats,
            &self.field_types,
        )?;
        self.sanitizer
            .sanitize_fields(&mut self.driver, &mut fields)?;
        Ok(fields)
    }

    fn render(
        &self,
        template: &str,
        first: &[SanitizedField],
        second: &[SanitizedField],
    ) -> Result<String, Error> {
        let args: Vec<Arg> = first
            .iter()
            .chain(second)
            .map(|field| field.raw_value.clone())
            .collect();
        self.prepare(Some(template), &args).ok_or_else(|| {
            Error::new(ErrorKind::Usage).with_message(format!("could not prepare {template}"))
        })
    }
}

fn join(
    fields: &[SanitizedField],
    sep: &str,
    render: impl Fn(&SanitizedField) -> String,
) -> String {
    fields.iter().map(render).collect::<Vec<_>>().join(sep)
}

fn where_clause(conds: &[SanitizedField]) -> String {
    join(conds, " AND ", |field| {
        if field.raw_value == Arg::Null {
            format!("{} IS %s", quote_ident(&field.column))
        } else {
            format!("{} = {}", quote_ident(&field.column), field.target_format.placeholder())
        }
    })
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}
