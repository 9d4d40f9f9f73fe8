use std::fmt;

use crate::error::{Error, Result};
use super::sanitize_payload;

/// Sentinel line terminating a query-result sub-block.
pub const RESULT_END: &str = "END";

/// A decoded protocol message.
///
/// Decoding happens once at the protocol boundary; consumers match
/// exhaustively so an unhandled message type is caught at compile time
/// rather than falling through a string dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// M→S: begin bootstrap, select/create the target database
    InitReplication {
        /// Database being replicated
        database: String,
    },
    /// M→S: ensure the database exists locally
    CreateDb {
        /// Database name
        database: String,
    },
    /// M→S: run DDL locally (newlines collapsed on encode)
    CreateTable {
        /// CREATE TABLE statement
        ddl: String,
    },
    /// M→S: apply a literal INSERT (bootstrap or per-table resync)
    SyncData {
        /// INSERT statement
        statement: String,
    },
    /// M→S: bootstrap finished, clear the in-progress flag
    ReplicationComplete,
    /// M→S: apply a live mutation
    ReplicateQuery {
        /// Statement to apply
        statement: String,
    },
    /// M→S: drop the local database and clear the local handle
    DropDatabase {
        /// Database name
        database: String,
    },
    /// M→S: informational free text, no state change
    Notification {
        /// Notification text
        text: String,
    },
    /// M→S: error report
    ErrorReply {
        /// Error detail
        detail: String,
    },
    /// M→S: ack (`query executed`) or a column count opening a result sub-block
    Success {
        /// Raw payload
        detail: String,
    },
    /// M→S: opens the verification report sub-block
    VerificationBegin,
    /// M→S: closes the verification report sub-block
    VerificationEnd,
    /// S→M: execute an INSERT and broadcast it on success
    Insert {
        /// Statement
        statement: String,
    },
    /// S→M: execute an UPDATE and broadcast it on success
    Update {
        /// Statement
        statement: String,
    },
    /// S→M: execute a DELETE and broadcast it on success
    Delete {
        /// Statement
        statement: String,
    },
    /// S→M: execute a SELECT, reply with a result sub-block; never replicated
    Select {
        /// Statement
        statement: String,
    },
    /// S→M: request a verification report
    VerifyReplication,
    /// S→M: resend DDL and full data for one table
    GetTableSchema {
        /// Table name
        table: String,
    },
}

impl Message {
    /// Parses one protocol line.
    ///
    /// The line is split on the first colon only; the payload may itself
    /// contain colons. Lines without a colon or with an unknown type yield a
    /// protocol error; the caller logs and skips them without closing the
    /// connection.
    pub fn parse(line: &str) -> Result<Message> {
        let (kind, payload) = line
            .split_once(':')
            .ok_or_else(|| Error::protocol(format!("line has no type separator: {line:?}")))?;

        let msg = match kind {
            "init_replication" => Message::InitReplication {
                database: payload.to_string(),
            },
            "create_db" => Message::CreateDb {
                database: payload.to_string(),
            },
            "create_table" => Message::CreateTable {
                ddl: payload.to_string(),
            },
            "sync_data" => Message::SyncData {
                statement: payload.to_string(),
            },
            "replication_complete" => Message::ReplicationComplete,
            "replicate_query" => Message::ReplicateQuery {
                statement: payload.to_string(),
            },
            "drop_database" => Message::DropDatabase {
                database: payload.to_string(),
            },
            "notification" => Message::Notification {
                text: payload.to_string(),
            },
            "error" => Message::ErrorReply {
                detail: payload.to_string(),
            },
            "success" => Message::Success {
                detail: payload.to_string(),
            },
            "verification_data" => match payload {
                "begin" => Message::VerificationBegin,
                "end" => Message::VerificationEnd,
                other => {
                    return Err(Error::protocol(format!(
                        "invalid verification_data payload: {other:?}"
                    )))
                }
            },
            "insert" => Message::Insert {
                statement: payload.to_string(),
            },
            "update" => Message::Update {
                statement: payload.to_string(),
            },
            "delete" => Message::Delete {
                statement: payload.to_string(),
            },
            "select" => Message::Select {
                statement: payload.to_string(),
            },
            "verify_replication" => Message::VerifyReplication,
            "get_table_schema" => Message::GetTableSchema {
                table: payload.to_string(),
            },
            other => return Err(Error::protocol(format!("unknown message type: {other:?}"))),
        };
        Ok(msg)
    }

    /// The wire tag for this message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::InitReplication { .. } => "init_replication",
            Message::CreateDb { .. } => "create_db",
            Message::CreateTable { .. } => "create_table",
            Message::SyncData { .. } => "sync_data",
            Message::ReplicationComplete => "replication_complete",
            Message::ReplicateQuery { .. } => "replicate_query",
            Message::DropDatabase { .. } => "drop_database",
            Message::Notification { .. } => "notification",
            Message::ErrorReply { .. } => "error",
            Message::Success { .. } => "success",
            Message::VerificationBegin | Message::VerificationEnd => "verification_data",
            Message::Insert { .. } => "insert",
            Message::Update { .. } => "update",
            Message::Delete { .. } => "delete",
            Message::Select { .. } => "select",
            Message::VerifyReplication => "verify_replication",
            Message::GetTableSchema { .. } => "get_table_schema",
        }
    }

    fn payload(&self) -> &str {
        match self {
            Message::InitReplication { database }
            | Message::CreateDb { database }
            | Message::DropDatabase { database } => database,
            Message::CreateTable { ddl } => ddl,
            Message::SyncData { statement }
            | Message::ReplicateQuery { statement }
            | Message::Insert { statement }
            | Message::Update { statement }
            | Message::Delete { statement }
            | Message::Select { statement } => statement,
            Message::ReplicationComplete => "done",
            Message::Notification { text } => text,
            Message::ErrorReply { detail } | Message::Success { detail } => detail,
            Message::VerificationBegin => "begin",
            Message::VerificationEnd => "end",
            Message::VerifyReplication => "request",
            Message::GetTableSchema { table } => table,
        }
    }

    /// Encodes this message as one protocol line, without the trailing
    /// newline. The payload is sanitized so it cannot break framing.
    pub fn encode(&self) -> String {
        format!("{}:{}", self.kind(), sanitize_payload(self.payload()))
    }

    /// For `success` messages, the column count opening a query-result
    /// sub-block. `None` for the plain `query executed` ack.
    pub fn column_count(&self) -> Option<usize> {
        match self {
            Message::Success { detail } => detail.trim().parse().ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

/// One `table:<name>:<count>` line inside a verification report sub-block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableCount {
    /// Table name
    pub table: String,
    /// Row count reported by the master
    pub rows: u64,
}

impl TableCount {
    /// Parses a report line. Unlike ordinary payloads, these lines carry an
    /// exact field count; anything else is malformed and skipped by the
    /// reader.
    pub fn parse(line: &str) -> Result<TableCount> {
        let parts: Vec<&str> = line.split(':').collect();
        if parts.len() != 3 || parts[0] != "table" {
            return Err(Error::protocol(format!("invalid table info format: {line:?}")));
        }
        let rows = parts[2]
            .trim()
            .parse()
            .map_err(|_| Error::protocol(format!("invalid row count: {:?}", parts[2])))?;
        Ok(TableCount {
            table: parts[1].to_string(),
            rows,
        })
    }

    /// Encodes this entry as a report line.
    pub fn encode(&self) -> String {
        format!("table:{}:{}", sanitize_payload(&self.table), self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_splits_on_first_colon() {
        let msg = Message::parse("replicate_query:UPDATE t SET note = 'a:b:c'").unwrap();
        assert_eq!(
            msg,
            Message::ReplicateQuery {
                statement: "UPDATE t SET note = 'a:b:c'".to_string()
            }
        );
    }

    #[test]
    fn test_parse_all_types() {
        let cases = [
            ("init_replication:shop", "init_replication"),
            ("create_db:shop", "create_db"),
            ("create_table:CREATE TABLE t (id INT)", "create_table"),
            ("sync_data:INSERT INTO t VALUES (1)", "sync_data"),
            ("replication_complete:done", "replication_complete"),
            ("replicate_query:DELETE FROM t", "replicate_query"),
            ("drop_database:shop", "drop_database"),
            ("notification:Table created: t", "notification"),
            ("error:no such table", "error"),
            ("success:query executed", "success"),
            ("verification_data:begin", "verification_data"),
            ("verification_data:end", "verification_data"),
            ("insert:INSERT INTO t VALUES (1)", "insert"),
            ("update:UPDATE t SET a = 1", "update"),
            ("delete:DELETE FROM t", "delete"),
            ("select:SELECT * FROM t", "select"),
            ("verify_replication:request", "verify_replication"),
            ("get_table_schema:t", "get_table_schema"),
        ];
        for (line, kind) in cases {
            let msg = Message::parse(line).unwrap();
            assert_eq!(msg.kind(), kind, "line: {line}");
        }
    }

    #[test]
    fn test_parse_malformed() {
        assert!(Message::parse("no separator here").is_err());
        assert!(Message::parse("bogus_type:payload").is_err());
        assert!(Message::parse("verification_data:middle").is_err());
    }

    #[test]
    fn test_encode_roundtrip() {
        let msg = Message::GetTableSchema {
            table: "users".to_string(),
        };
        assert_eq!(msg.encode(), "get_table_schema:users");
        assert_eq!(Message::parse(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_encode_sanitizes_ddl() {
        let msg = Message::CreateTable {
            ddl: "CREATE TABLE t (\n  id INT,\r\n  name TEXT\n)".to_string(),
        };
        let line = msg.encode();
        assert!(!line.contains('\n'));
        assert!(!line.contains('\r'));
        assert_eq!(line, "create_table:CREATE TABLE t (   id INT,    name TEXT )");
    }

    #[test]
    fn test_column_count() {
        let ack = Message::Success {
            detail: "query executed".to_string(),
        };
        assert_eq!(ack.column_count(), None);

        let header = Message::Success {
            detail: "3".to_string(),
        };
        assert_eq!(header.column_count(), Some(3));
    }

    #[test]
    fn test_table_count_parse() {
        let tc = TableCount::parse("table:users:42").unwrap();
        assert_eq!(tc.table, "users");
        assert_eq!(tc.rows, 42);

        assert!(TableCount::parse("table:users").is_err());
        assert!(TableCount::parse("table:users:42:extra").is_err());
        assert!(TableCount::parse("row:users:42").is_err());
        assert!(TableCount::parse("table:users:many").is_err());
    }

    #[test]
    fn test_table_count_roundtrip() {
        let tc = TableCount {
            table: "orders".to_string(),
            rows: 100,
        };
        assert_eq!(TableCount::parse(&tc.encode()).unwrap(), tc);
    }
}
