//! Repline is an application-level master/slave replication library for
//! relational stores.
//!
//! A master coordinator bootstraps each connecting slave with a full
//! schema-and-data snapshot over a line-oriented TCP protocol, then broadcasts
//! every successful mutation to all other slaves. Slaves apply everything to
//! a local store, recover missing schema on demand, and can request a
//! count-based consistency check at any time.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod error;
/// Master coordinator: listener, slave registry, bootstrap and broadcast
pub mod master;
/// Wire protocol: message types and line framing
pub mod protocol;
/// Slave agent: dial supervisor, receive loop, schema recovery
pub mod slave;
/// Storage adapter trait and the bundled SQLite implementation
pub mod storage;
/// Replication consistency checking
pub mod verify;

// Re-export common types
pub use error::{Error, Result};
pub use master::{MasterConfig, MasterCoordinator};
pub use protocol::{LineCodec, Message};
pub use slave::{ConnectionState, SlaveAgent, SlaveConfig, SlaveEvent};
pub use storage::{SqliteStorage, StorageAdapter};
pub use verify::{TableStatus, VerificationReport};

/// Version of the Repline library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
