//! Storage adapter abstraction over the replicated relational store.
//!
//! The replication layer only ever talks to a store through the
//! [`StorageAdapter`] trait: executing statements, running queries, and
//! introspecting schema. [`sqlite::SqliteStorage`] is the bundled adapter;
//! other engines plug in behind the same trait.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Result, StorageError};

/// SQL statement helpers (table-name extraction)
pub mod sql;
/// SQLite adapter
pub mod sqlite;

pub use sqlite::SqliteStorage;

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Signed integer
    Int(i64),
    /// Double-precision float
    Float(f64),
    /// Text
    Text(String),
    /// Raw bytes, rendered as text when it crosses the wire
    Bytes(Vec<u8>),
}

impl Value {
    /// Renders this value as a SQL literal for a rebuilt INSERT statement.
    ///
    /// Text and byte values are single-quoted with embedded quotes doubled;
    /// NULL stays the bare keyword so it survives the round trip as NULL
    /// rather than the string `'NULL'`.
    pub fn sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Bytes(b) => {
                let text = String::from_utf8_lossy(b);
                format!("'{}'", text.replace('\'', "''"))
            }
        }
    }

    /// Renders this value for a query-result data line (no quoting).
    pub fn render_raw(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Text(s) => s.clone(),
            Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render_raw())
    }
}

/// The closed set of column types the wire schema understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnType {
    /// Integer column
    Int,
    /// Bounded varchar with its length
    Varchar(u32),
    /// Floating-point column
    Float,
    /// Unbounded text column
    Text,
}

impl ColumnType {
    /// Parses a declared SQL type into the closed set.
    ///
    /// Anything outside the set is an error rather than a silent fallback,
    /// so a schema that cannot replicate faithfully is rejected up front.
    pub fn parse(declared: &str) -> Result<ColumnType> {
        let upper = declared.trim().to_ascii_uppercase();
        if upper == "INT" || upper == "INTEGER" {
            return Ok(ColumnType::Int);
        }
        if upper == "FLOAT" || upper == "REAL" || upper == "DOUBLE" {
            return Ok(ColumnType::Float);
        }
        if upper == "TEXT" {
            return Ok(ColumnType::Text);
        }
        if let Some(rest) = upper.strip_prefix("VARCHAR") {
            let inner = rest.trim();
            if inner.is_empty() {
                return Ok(ColumnType::Varchar(255));
            }
            if let Some(len) = inner
                .strip_prefix('(')
                .and_then(|s| s.strip_suffix(')'))
                .and_then(|s| s.trim().parse().ok())
            {
                return Ok(ColumnType::Varchar(len));
            }
        }
        Err(StorageError::UnsupportedType(declared.to_string()).into())
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnType::Int => write!(f, "INT"),
            ColumnType::Varchar(len) => write!(f, "VARCHAR({})", len),
            ColumnType::Float => write!(f, "FLOAT"),
            ColumnType::Text => write!(f, "TEXT"),
        }
    }
}

/// One column of a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Declared type
    pub column_type: ColumnType,
}

/// The result of a read query: column names plus zero or more rows.
///
/// Column names are carried even when there are no rows, so the reply
/// sub-block can always emit its header line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// Column names, in select order
    pub columns: Vec<String>,
    /// Row data, one `Vec<Value>` per row
    pub rows: Vec<Vec<Value>>,
}

/// Abstraction over the replicated relational store.
///
/// All methods take `&self`; adapters manage their own interior locking so a
/// shared `Arc<dyn StorageAdapter>` can serve concurrent connection tasks.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Executes a mutating statement, returning the affected row count.
    async fn execute(&self, statement: &str) -> Result<u64>;

    /// Runs a read query and collects the full result set.
    async fn query(&self, statement: &str) -> Result<QueryResult>;

    /// Lists user tables, excluding engine-internal ones.
    async fn list_tables(&self) -> Result<Vec<String>>;

    /// Returns the column schema of a table.
    async fn describe_table(&self, table: &str) -> Result<Vec<Column>>;

    /// Returns a single-line CREATE TABLE statement for a table.
    async fn show_create_table(&self, table: &str) -> Result<String>;

    /// Counts the rows in a table.
    async fn row_count(&self, table: &str) -> Result<u64>;

    /// Whether a table exists.
    async fn table_exists(&self, table: &str) -> Result<bool>;

    /// Ensures a database of the given name exists and selects it.
    async fn create_database(&self, name: &str) -> Result<()>;

    /// Drops the named database and all of its tables.
    async fn drop_database(&self, name: &str) -> Result<()>;
}

/// Shared handle to a storage adapter.
pub type SharedStorage = Arc<dyn StorageAdapter>;
