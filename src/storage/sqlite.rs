use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::{Error, Result, StorageError};
use super::{Column, ColumnType, QueryResult, StorageAdapter, Value};

/// SQLite storage adapter.
///
/// SQLite has no server-side database catalog, so `create_database` records
/// the active database name and `drop_database` clears every user table.
#[derive(Debug)]
pub struct SqliteStorage {
    conn: Arc<Mutex<Connection>>,
    database: parking_lot::Mutex<Option<String>>,
}

impl SqliteStorage {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    /// Opens an in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            database: parking_lot::Mutex::new(None),
        }
    }

    /// The active database name, if one was selected.
    pub fn database(&self) -> Option<String> {
        self.database.lock().clone()
    }
}

/// Maps a rusqlite error, classifying unknown-table failures so the
/// schema-recovery path can react to them.
fn map_sqlite_err(e: rusqlite::Error) -> Error {
    let text = e.to_string();
    if let Some(rest) = text.strip_prefix("no such table: ") {
        return StorageError::MissingTable {
            table: Some(rest.trim().to_string()),
        }
        .into();
    }
    StorageError::Statement(text).into()
}

fn value_from_ref(v: rusqlite::types::ValueRef<'_>) -> Value {
    match v {
        rusqlite::types::ValueRef::Null => Value::Null,
        rusqlite::types::ValueRef::Integer(i) => Value::Int(i),
        rusqlite::types::ValueRef::Real(f) => Value::Float(f),
        rusqlite::types::ValueRef::Text(s) => Value::Text(String::from_utf8_lossy(s).into_owned()),
        rusqlite::types::ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

#[async_trait]
impl StorageAdapter for SqliteStorage {
    async fn execute(&self, statement: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        conn.execute(statement, [])
            .map(|rows| rows as u64)
            .map_err(map_sqlite_err)
    }

    async fn query(&self, statement: &str) -> Result<QueryResult> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(statement).map_err(map_sqlite_err)?;

        let columns: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|&name| name.to_string())
            .collect();

        let mut rows = Vec::new();
        let mut raw = stmt.query([]).map_err(map_sqlite_err)?;
        while let Some(row) = raw.next().map_err(map_sqlite_err)? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                let v = row
                    .get_ref(i)
                    .map_err(|e| StorageError::Statement(e.to_string()))?;
                values.push(value_from_ref(v));
            }
            rows.push(values);
        }

        Ok(QueryResult { columns, rows })
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let result = self
            .query(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            )
            .await?;
        Ok(result
            .rows
            .into_iter()
            .filter_map(|mut row| match row.pop() {
                Some(Value::Text(name)) => Some(name),
                _ => None,
            })
            .collect())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<Column>> {
        let conn = self.conn.lock().await;
        let pragma = format!("PRAGMA table_info(\"{}\")", table.replace('"', "\"\""));
        let mut stmt = conn
            .prepare(&pragma)
            .map_err(|e| StorageError::Introspection(e.to_string()))?;

        let mut columns = Vec::new();
        let mut raw = stmt
            .query([])
            .map_err(|e| StorageError::Introspection(e.to_string()))?;
        while let Some(row) = raw
            .next()
            .map_err(|e| StorageError::Introspection(e.to_string()))?
        {
            let name: String = row
                .get(1)
                .map_err(|e| StorageError::Introspection(e.to_string()))?;
            let declared: String = row
                .get(2)
                .map_err(|e| StorageError::Introspection(e.to_string()))?;
            columns.push(Column {
                name,
                column_type: ColumnType::parse(&declared)?,
            });
        }

        if columns.is_empty() {
            return Err(StorageError::MissingTable {
                table: Some(table.to_string()),
            }
            .into());
        }
        Ok(columns)
    }

    async fn show_create_table(&self, table: &str) -> Result<String> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .map_err(|e| StorageError::Introspection(e.to_string()))?;
        let ddl: Option<String> = stmt
            .query_row([table], |row| row.get(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(StorageError::Introspection(other.to_string())),
            })?;
        ddl.ok_or_else(|| {
            StorageError::MissingTable {
                table: Some(table.to_string()),
            }
            .into()
        })
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT COUNT(*) FROM \"{}\"", table.replace('"', "\"\""));
        conn.query_row(&sql, [], |row| row.get::<_, i64>(0))
            .map(|n| n as u64)
            .map_err(map_sqlite_err)
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .map_err(|e| StorageError::Introspection(e.to_string()))?;
        Ok(count > 0)
    }

    async fn create_database(&self, name: &str) -> Result<()> {
        // A single SQLite file is the whole database; selecting is a rename.
        *self.database.lock() = Some(name.to_string());
        Ok(())
    }

    async fn drop_database(&self, _name: &str) -> Result<()> {
        let tables = self.list_tables().await?;
        {
            let conn = self.conn.lock().await;
            for table in tables {
                let sql = format!("DROP TABLE IF EXISTS \"{}\"", table.replace('"', "\"\""));
                conn.execute(&sql, []).map_err(map_sqlite_err)?;
            }
        }
        *self.database.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded() -> SqliteStorage {
        let store = SqliteStorage::open_in_memory().unwrap();
        store
            .execute("CREATE TABLE users (id INT, name VARCHAR(50), score FLOAT, bio TEXT)")
            .await
            .unwrap();
        store
            .execute("INSERT INTO users VALUES (1, 'alice', 9.5, NULL)")
            .await
            .unwrap();
        store
            .execute("INSERT INTO users VALUES (2, 'bob', 7.0, 'it''s bob')")
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_execute_and_query() {
        let store = seeded().await;
        let result = store.query("SELECT id, name FROM users ORDER BY id").await.unwrap();
        assert_eq!(result.columns, vec!["id", "name"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0][0], Value::Int(1));
        assert_eq!(result.rows[1][1], Value::Text("bob".to_string()));
    }

    #[tokio::test]
    async fn test_query_empty_result_keeps_columns() {
        let store = seeded().await;
        let result = store
            .query("SELECT id, name FROM users WHERE id > 100")
            .await
            .unwrap();
        assert_eq!(result.columns, vec!["id", "name"]);
        assert!(result.rows.is_empty());
    }

    #[tokio::test]
    async fn test_missing_table_classified() {
        let store = SqliteStorage::open_in_memory().unwrap();
        let err = store
            .execute("INSERT INTO ghosts VALUES (1)")
            .await
            .unwrap_err();
        assert_eq!(err.missing_table(), Some(Some("ghosts")));
    }

    #[tokio::test]
    async fn test_introspection() {
        let store = seeded().await;
        assert_eq!(store.list_tables().await.unwrap(), vec!["users"]);
        assert!(store.table_exists("users").await.unwrap());
        assert!(!store.table_exists("ghosts").await.unwrap());
        assert_eq!(store.row_count("users").await.unwrap(), 2);

        let columns = store.describe_table("users").await.unwrap();
        assert_eq!(columns.len(), 4);
        assert_eq!(columns[0].name, "id");
        assert_eq!(columns[0].column_type, ColumnType::Int);
        assert_eq!(columns[1].column_type, ColumnType::Varchar(50));

        let ddl = store.show_create_table("users").await.unwrap();
        assert!(ddl.to_uppercase().starts_with("CREATE TABLE"));
    }

    #[tokio::test]
    async fn test_describe_missing_table() {
        let store = SqliteStorage::open_in_memory().unwrap();
        assert!(store.describe_table("ghosts").await.unwrap_err().missing_table().is_some());
        assert!(store.show_create_table("ghosts").await.unwrap_err().missing_table().is_some());
    }

    #[tokio::test]
    async fn test_create_and_drop_database() {
        let store = seeded().await;
        store.create_database("shop").await.unwrap();
        assert_eq!(store.database(), Some("shop".to_string()));

        store.drop_database("shop").await.unwrap();
        assert!(store.list_tables().await.unwrap().is_empty());
        assert_eq!(store.database(), None);
    }

    #[tokio::test]
    async fn test_open_file_backed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repl.db");
        let store = SqliteStorage::open(&path).unwrap();
        store
            .execute("CREATE TABLE t (id INT)")
            .await
            .unwrap();
        assert!(store.table_exists("t").await.unwrap());
    }
}
