//! Purpose: Describe the relational-database primitives the cache layer consumes.
//! Exports: `Driver`, `Outcome`, `ColumnDefinition`.
//! Role: Seam to an external driver; this crate never speaks a database wire protocol.
//! Invariants: `query` reports a dropped connection as `ErrorKind::ConnectionLost` and nothing else.
//! Invariants: `columns` describes the most recent result set and may be empty after a write.

use crate::core::error::Error;
use crate::core::snapshot::{ColumnMeta, Row};
use crate::query::prepare::Escape;

/// Result of running one statement.
#[derive(Clone, Debug, PartialEq)]
pub enum Outcome {
    /// Result set from a read.
    Rows(Vec<Row>),
    /// Data mutation; `insert_id` is zero when the statement generated none.
    Affected { rows: u64, insert_id: u64 },
    /// DDL or any statement without rows or an affected count.
    Done,
}

/// One row of `SHOW FULL COLUMNS`; `collation` is absent for non-string columns.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub field: String,
    pub sql_type: String,
    pub collation: Option<String>,
}

impl ColumnDefinition {
    pub fn new(field: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            sql_type: sql_type.into(),
            collation: None,
        }
    }

    pub fn with_collation(mut self, collation: impl Into<String>) -> Self {
        self.collation = Some(collation.into());
        self
    }
}

pub trait Driver: Escape {
    fn query(&mut self, sql: &str) -> Result<Outcome, Error>;

    /// Column metadata for the last result set.
    fn columns(&mut self) -> Vec<ColumnMeta>;

    fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnDefinition>, Error>;

    /// Connection character set currently in effect.
    fn charset(&self) -> Option<String>;

    /// Switches the connection charset; `None` restores the connection's default.
    fn set_charset(&mut self, charset: Option<&str>) -> Result<(), Error>;

    fn reconnect(&mut self) -> Result<(), Error>;
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory driver for unit tests: scripted outcomes keyed by exact SQL.

    use std::collections::{BTreeMap, VecDeque};

    use super::{ColumnDefinition, Driver, Outcome};
    use crate::core::error::{Error, ErrorKind};
    use crate::core::snapshot::{Cell, ColumnMeta};
    use crate::query::prepare::{BasicEscaper, Escape};

    #[derive(Debug, Default)]
    pub(crate) struct FakeDriver {
        pub tables: BTreeMap<String, Vec<ColumnDefinition>>,
        pub outcomes: BTreeMap<String, (Outcome, Vec<ColumnMeta>)>,
        pub failures: VecDeque<Error>,
        pub reconnect_failures: u32,
        pub executed: Vec<String>,
        pub charset_changes: Vec<String>,
        pub charset: Option<String>,
        pub metadata_queries: usize,
        pub reconnects: usize,
        last_columns: Vec<ColumnMeta>,
    }

    impl FakeDriver {
        pub fn add_table(&mut self, table: &str, columns: Vec<ColumnDefinition>) {
            self.tables.insert(table.to_string(), columns);
        }

        pub fn respond(&mut self, sql: &str, outcome: Outcome, columns: Vec<ColumnMeta>) {
            self.outcomes.insert(sql.to_string(), (outcome, columns));
        }

        pub fn fail_next(&mut self, kind: ErrorKind) {
            self.failures
                .push_back(Error::new(kind).with_message("scripted failure"));
        }

        // Emulates `CONVERT(X'..' USING ascii)`: non-ASCII bytes become `?`.
        fn convert(sql: &str) -> Outcome {
            let row = sql
                .split("X'")
                .skip(1)
                .map(|chunk| {
                    let hex = chunk.split('\'').next().unwrap_or("");
                    let bytes: Vec<u8> = (0..hex.len())
                        .step_by(2)
                        .map(|idx| u8::from_str_radix(&hex[idx..idx + 2], 16).unwrap_or(b'?'))
                        .map(|byte| if byte.is_ascii() { byte } else { b'?' })
                        .collect();
                    Cell::Bytes(bytes.into())
                })
                .collect();
            Outcome::Rows(vec![row])
        }
    }

    impl Escape for FakeDriver {
        fn escape(&self, text: &str) -> String {
            BasicEscaper.escape(text)
        }
    }

    impl Driver for FakeDriver {
        fn query(&mut self, sql: &str) -> Result<Outcome, Error> {
            self.executed.push(sql.to_string());
            if let Some(err) = self.failures.pop_front() {
                return Err(err);
            }
            if sql.starts_with("SELECT CONVERT(") {
                self.last_columns = Vec::new();
                return Ok(Self::convert(sql));
            }
            match self.outcomes.get(sql) {
                Some((outcome, columns)) => {
                    self.last_columns = columns.clone();
                    Ok(outcome.clone())
                }
                None => {
                    self.last_columns = Vec::new();
                    Ok(Outcome::Done)
                }
            }
        }

        fn columns(&mut self) -> Vec<ColumnMeta> {
            self.last_columns.clone()
        }

        fn table_columns(&mut self, table: &str) -> Result<Vec<ColumnDefinition>, Error> {
            self.metadata_queries += 1;
            self.tables.get(table).cloned().ok_or_else(|| {
                Error::new(ErrorKind::Driver).with_message(format!("table {table} doesn't exist"))
            })
        }

        fn charset(&self) -> Option<String> {
            self.charset.clone()
        }

        fn set_charset(&mut self, charset: Option<&str>) -> Result<(), Error> {
            self.charset_changes
                .push(charset.unwrap_or("default").to_string());
            self.charset = charset.map(str::to_string);
            Ok(())
        }

        fn reconnect(&mut self) -> Result<(), Error> {
            self.reconnects += 1;
            if self.reconnect_failures > 0 {
                self.reconnect_failures -= 1;
                return Err(Error::new(ErrorKind::ConnectionLost).with_message("server gone away"));
            }
            Ok(())
        }
    }
}
