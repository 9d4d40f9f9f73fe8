//! Replication consistency checking.
//!
//! The master answers a verification request with per-table row counts; the
//! slave compares them against its own store and produces a
//! [`VerificationReport`]. The comparison is count-based only, a cheap
//! liveness check rather than a content audit.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::Result;
use crate::protocol::TableCount;
use crate::storage::StorageAdapter;

/// Comparison outcome for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TableStatus {
    /// Present on both sides with equal row counts
    Match {
        /// Shared row count
        rows: u64,
    },
    /// Present on both sides with differing row counts
    Mismatch {
        /// Rows on the master
        master_rows: u64,
        /// Rows on the slave
        slave_rows: u64,
    },
    /// Reported by the master but absent locally
    Missing {
        /// Rows on the master
        master_rows: u64,
    },
    /// Present locally but not reported by the master
    Extra {
        /// Rows on the slave
        slave_rows: u64,
    },
}

/// Per-table comparison of master-reported and local row counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationReport {
    /// Status per table, ordered by table name
    pub tables: BTreeMap<String, TableStatus>,
}

impl VerificationReport {
    /// Compares the master's reported counts against local counts.
    pub fn compare(
        master: &[TableCount],
        slave: &BTreeMap<String, u64>,
    ) -> VerificationReport {
        let mut tables = BTreeMap::new();

        for entry in master {
            let status = match slave.get(&entry.table) {
                Some(&local) if local == entry.rows => TableStatus::Match { rows: local },
                Some(&local) => TableStatus::Mismatch {
                    master_rows: entry.rows,
                    slave_rows: local,
                },
                None => TableStatus::Missing {
                    master_rows: entry.rows,
                },
            };
            tables.insert(entry.table.clone(), status);
        }

        for (table, &local) in slave {
            tables
                .entry(table.clone())
                .or_insert(TableStatus::Extra { slave_rows: local });
        }

        VerificationReport { tables }
    }

    /// True when every table matches on both sides.
    pub fn synchronized(&self) -> bool {
        self.tables
            .values()
            .all(|status| matches!(status, TableStatus::Match { .. }))
    }
}

/// Collects per-table row counts from a local store.
pub async fn local_counts(storage: &dyn StorageAdapter) -> Result<BTreeMap<String, u64>> {
    let mut counts = BTreeMap::new();
    for table in storage.list_tables().await? {
        let rows = storage.row_count(&table).await?;
        counts.insert(table, rows);
    }
    Ok(counts)
}
