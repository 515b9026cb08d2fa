//! Purpose: Define the serializable result snapshot the cache stores and returns.
//! Exports: `CacheEntry`, `ColumnMeta`, `Cell`, `Row`.
//! Role: Shared value type between the executor and every cache backend.
//! Invariants: `expires_at` is `write_time + ttl` in unix seconds; entries are never mutated in place.
//! Invariants: Serialized field names are `columns`, `rows`, `rowCount`, `returnValue`, `expiresAt`.

use bstr::BString;
use serde::{Deserialize, Serialize};

/// Column metadata captured once per query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMeta {
    pub name: String,
    #[serde(default)]
    pub table: String,
    pub sql_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub max_length: u64,
}

impl ColumnMeta {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: String::new(),
            sql_type: sql_type.into(),
            nullable: true,
            max_length: 0,
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn with_max_length(mut self, max_length: u64) -> Self {
        self.max_length = max_length;
        self
    }

    pub fn info(&self, kind: ColumnInfo) -> String {
        match kind {
            ColumnInfo::Name => self.name.clone(),
            ColumnInfo::Table => self.table.clone(),
            ColumnInfo::SqlType => self.sql_type.clone(),
            ColumnInfo::Nullable => self.nullable.to_string(),
            ColumnInfo::MaxLength => self.max_length.to_string(),
        }
    }
}

/// Selects one `ColumnMeta` property for column-info lookups.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ColumnInfo {
    #[default]
    Name,
    Table,
    SqlType,
    Nullable,
    MaxLength,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(BString),
}

impl Cell {
    pub fn is_null(&self) -> bool {
        matches!(self, Cell::Null)
    }

    /// Textual rendering; `None` for SQL NULL and for empty text.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Cell::Null => None,
            Cell::Int(value) => Some(value.to_string()),
            Cell::Float(value) => Some(value.to_string()),
            Cell::Text(value) if value.is_empty() => None,
            Cell::Text(value) => Some(value.clone()),
            Cell::Bytes(value) if value.is_empty() => None,
            Cell::Bytes(value) => Some(value.to_string()),
        }
    }
}

impl From<&str> for Cell {
    fn from(value: &str) -> Self {
        Cell::Text(value.to_string())
    }
}

impl From<String> for Cell {
    fn from(value: String) -> Self {
        Cell::Text(value)
    }
}

impl From<i64> for Cell {
    fn from(value: i64) -> Self {
        Cell::Int(value)
    }
}

impl From<f64> for Cell {
    fn from(value: f64) -> Self {
        Cell::Float(value)
    }
}

pub type Row = Vec<Cell>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Row>,
    pub row_count: u64,
    pub return_value: u64,
    pub expires_at: f64,
}

impl CacheEntry {
    pub fn new(
        columns: Vec<ColumnMeta>,
        rows: Vec<Row>,
        row_count: u64,
        return_value: u64,
        written_at: f64,
        ttl_secs: u64,
    ) -> Self {
        Self {
            columns,
            rows,
            row_count,
            return_value,
            expires_at: written_at + ttl_secs as f64,
        }
    }

    pub fn is_expired(&self, now: f64) -> bool {
        now > self.expires_at
    }

    /// Whole seconds left before expiry, at least 1 for a live entry.
    pub fn remaining_ttl(&self, now: f64) -> u64 {
        let remaining = (self.expires_at - now).ceil();
        if remaining < 1.0 { 1 } else { remaining as u64 }
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheEntry, Cell, ColumnMeta};
    use serde_json::json;

    fn sample() -> CacheEntry {
        CacheEntry::new(
            vec![ColumnMeta::new("id", "int").with_table("users").with_nullable(false)],
            vec![vec![Cell::Int(1)], vec![Cell::Int(2)]],
            2,
            2,
            1_000.0,
            60,
        )
    }

    #[test]
    fn expires_at_is_write_time_plus_ttl() {
        let entry = sample();
        assert_eq!(entry.expires_at, 1_060.0);
        assert!(!entry.is_expired(1_060.0));
        assert!(entry.is_expired(1_060.5));
        assert_eq!(entry.remaining_ttl(1_000.0), 60);
        assert_eq!(entry.remaining_ttl(1_059.9), 1);
    }

    #[test]
    fn serialized_field_names_are_stable() {
        let value = serde_json::to_value(sample()).expect("serialize");
        assert_eq!(value["rowCount"], json!(2));
        assert_eq!(value["returnValue"], json!(2));
        assert_eq!(value["expiresAt"], json!(1_060.0));
        assert_eq!(value["columns"][0]["sqlType"], json!("int"));
        assert_eq!(value["rows"][1][0], json!(2));
    }

    #[test]
    fn cells_keep_their_shape_through_json() {
        let row = vec![
            Cell::Null,
            Cell::Int(-4),
            Cell::Float(2.5),
            Cell::from("caf\u{e9}"),
            Cell::Bytes(vec![0xff, 0x00].into()),
        ];
        let text = serde_json::to_string(&row).expect("serialize");
        let back: Vec<Cell> = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back, row);
    }

    #[test]
    fn empty_text_renders_as_none() {
        assert_eq!(Cell::from("").to_text(), None);
        assert_eq!(Cell::Null.to_text(), None);
        assert_eq!(Cell::Int(7).to_text().as_deref(), Some("7"));
    }
}
