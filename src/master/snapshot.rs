//! Bootstrap snapshot streaming.
//!
//! A newly registered slave receives the full schema and data of the master's
//! store before entering the steady-state loop. The same per-table path also
//! serves `get_table_schema` recovery requests.

use tracing::debug;

use super::Outbound;
use crate::error::Result;
use crate::protocol::Message;
use crate::storage::{StorageAdapter, Value};

/// Rows per sync_data batch during bootstrap and per-table resync.
pub(crate) const SYNC_BATCH_SIZE: u64 = 100;

/// Rebuilds one row as a literal INSERT statement.
pub(crate) fn insert_statement(table: &str, columns: &[String], row: &[Value]) -> String {
    let values: Vec<String> = row.iter().map(Value::sql_literal).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        table,
        columns.join(", "),
        values.join(", ")
    )
}

/// Streams the full bootstrap sequence to one slave's outbound queue.
///
/// Runs on the connection's own task without the registry lock held, and
/// only enqueues lines, so a slow bootstrap never stalls broadcasts to other
/// slaves.
pub(crate) async fn send_bootstrap(
    storage: &dyn StorageAdapter,
    out: &Outbound,
    database: &str,
) -> Result<()> {
    out.send(
        Message::InitReplication {
            database: database.to_string(),
        }
        .encode(),
    )?;
    out.send(
        Message::CreateDb {
            database: database.to_string(),
        }
        .encode(),
    )?;

    for table in storage.list_tables().await? {
        send_table_schema(storage, out, &table).await?;
        send_table_data(storage, out, &table).await?;
    }

    out.send(Message::ReplicationComplete.encode())?;
    Ok(())
}

/// Sends one table's DDL.
pub(crate) async fn send_table_schema(
    storage: &dyn StorageAdapter,
    out: &Outbound,
    table: &str,
) -> Result<()> {
    let ddl = storage.show_create_table(table).await?;
    out.send(Message::CreateTable { ddl }.encode())?;
    Ok(())
}

/// Sends one table's full contents as literal INSERTs, paginated.
///
/// Empty tables send nothing beyond their DDL.
pub(crate) async fn send_table_data(
    storage: &dyn StorageAdapter,
    out: &Outbound,
    table: &str,
) -> Result<()> {
    let total = storage.row_count(table).await?;
    if total == 0 {
        return Ok(());
    }
    debug!(table, rows = total, "streaming table data");

    let mut offset = 0u64;
    while offset < total {
        let statement = format!(
            "SELECT * FROM {} LIMIT {} OFFSET {}",
            table, SYNC_BATCH_SIZE, offset
        );
        let batch = storage.query(&statement).await?;
        if batch.rows.is_empty() {
            break;
        }
        let fetched = batch.rows.len() as u64;
        for row in &batch.rows {
            let insert = insert_statement(table, &batch.columns, row);
            out.send(Message::SyncData { statement: insert }.encode())?;
        }
        offset += fetched;
    }
    Ok(())
}
