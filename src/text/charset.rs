//! Purpose: Resolve the effective character set of tables and columns from schema metadata.
//! Exports: `Charset`, `CharsetResolver`, `table_charset_of`.
//! Role: Feeds the sanitizer; one metadata query per table, memoized for the resolver's lifetime.
//! Invariants: Any binary or blob column makes the whole table `binary`.
//! Invariants: Mixed charsets resolve by dropping `latin1`, preferring `utf8` over `utf8mb4`, else `ascii`.
//! Invariants: Memoized schema is only refreshed through `invalidate` / `invalidate_all`.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::debug;

use crate::core::error::Error;
use crate::driver::{ColumnDefinition, Driver};

const BINARY_TYPES: [&str; 6] = [
    "binary",
    "varbinary",
    "tinyblob",
    "mediumblob",
    "blob",
    "longblob",
];

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Charset {
    Binary,
    Ascii,
    Latin1,
    /// Three-byte UTF-8; also covers the `utf8mb3` spelling.
    Utf8,
    Utf8mb4,
    Other(String),
}

impl Charset {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "binary" => Charset::Binary,
            "ascii" => Charset::Ascii,
            "latin1" => Charset::Latin1,
            "utf8" | "utf8mb3" => Charset::Utf8,
            "utf8mb4" => Charset::Utf8mb4,
            other => Charset::Other(other.to_string()),
        }
    }

    /// Charset named by a collation's prefix, e.g. `utf8mb4_unicode_ci`.
    pub fn from_collation(collation: &str) -> Self {
        let name = collation.split('_').next().unwrap_or(collation);
        Self::parse(name)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Charset::Binary => "binary",
            Charset::Ascii => "ascii",
            Charset::Latin1 => "latin1",
            Charset::Utf8 => "utf8",
            Charset::Utf8mb4 => "utf8mb4",
            Charset::Other(name) => name,
        }
    }

    /// Whether values can be validated without a database round trip.
    pub fn has_local_validator(&self) -> bool {
        matches!(
            self,
            Charset::Binary | Charset::Latin1 | Charset::Utf8 | Charset::Utf8mb4
        )
    }
}

impl fmt::Display for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Default)]
struct TableMeta {
    charset: Option<Charset>,
    // Lowercased column name to its own charset; `None` for non-string columns.
    columns: BTreeMap<String, Option<Charset>>,
}

#[derive(Debug, Default)]
pub struct CharsetResolver {
    tables: BTreeMap<String, TableMeta>,
}

impl CharsetResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cached(&self, table: &str) -> bool {
        self.tables.contains_key(&table.to_ascii_lowercase())
    }

    /// Effective table charset; `None` when the table has no string columns.
    pub fn table_charset(
        &mut self,
        driver: &mut dyn Driver,
        table: &str,
    ) -> Result<Option<Charset>, Error> {
        Ok(self.load(driver, table)?.charset.clone())
    }

    /// A binary table wins over any column; an unknown column falls back to the table.
    pub fn resolve_column_charset(
        &mut self,
        driver: &mut dyn Driver,
        table: &str,
        column: &str,
    ) -> Result<Option<Charset>, Error> {
        let meta = self.load(driver, table)?;
        if meta.charset == Some(Charset::Binary) {
            return Ok(Some(Charset::Binary));
        }
        match meta.columns.get(&column.to_ascii_lowercase()) {
            Some(charset) => Ok(charset.clone()),
            None => Ok(meta.charset.clone()),
        }
    }

    /// Drops memoized metadata for `table` so the next lookup re-reads the schema.
    pub fn invalidate(&mut self, table: &str) -> bool {
        self.tables.remove(&table.to_ascii_lowercase()).is_some()
    }

    pub fn invalidate_all(&mut self) {
        self.tables.clear();
    }

    fn load(&mut self, driver: &mut dyn Driver, table: &str) -> Result<&TableMeta, Error> {
        match self.tables.entry(table.to_ascii_lowercase()) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let definitions = driver.table_columns(table)?;
                let meta = TableMeta {
                    charset: table_charset_of(&definitions),
                    columns: definitions
                        .iter()
                        .map(|def| {
                            let charset = def.collation.as_deref().map(Charset::from_collation);
                            (def.field.to_ascii_lowercase(), charset)
                        })
                        .collect(),
                };
                debug!(table, charset = ?meta.charset, "table charset resolved");
                Ok(entry.insert(meta))
            }
        }
    }
}

/// Derives one effective charset from a table's column definitions.
pub fn table_charset_of(columns: &[ColumnDefinition]) -> Option<Charset> {
    let mut charsets = BTreeSet::new();
    for column in columns {
        if is_binary_type(&column.sql_type) {
            return Some(Charset::Binary);
        }
        if let Some(collation) = column.collation.as_deref() {
            charsets.insert(Charset::from_collation(collation));
        }
    }
    if charsets.len() > 1 {
        charsets.remove(&Charset::Latin1);
    }
    match charsets.len() {
        0 => None,
        1 => charsets.into_iter().next(),
        2 if charsets.contains(&Charset::Utf8) && charsets.contains(&Charset::Utf8mb4) => {
            Some(Charset::Utf8)
        }
        _ => Some(Charset::Ascii),
    }
}

fn is_binary_type(sql_type: &str) -> bool {
    let lowered = sql_type.trim().to_ascii_lowercase();
    let base = lowered.split(['(', ' ']).next().unwrap_or("");
    BINARY_TYPES.contains(&base)
}
