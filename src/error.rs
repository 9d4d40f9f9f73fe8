//! Error types for the Repline library.
//!
//! This module provides a comprehensive error handling system for protocol,
//! network, and storage operations.

use std::io;
use thiserror::Error;

/// Primary error type encompassing all possible errors in the library.
#[derive(Error, Debug)]
pub enum Error {
    /// Protocol-related errors such as malformed lines or unknown message types
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Network operation errors including connection and transmission failures
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Relational store errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Input/output operation errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration validation and parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal library errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Network-specific error types.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Failed to establish or maintain a connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The peer closed the connection
    #[error("Connection closed by peer: {0}")]
    ConnectionClosed(String),

    /// Failed to send a message on an established link
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Network address parsing or binding errors
    #[error("Address error: {0}")]
    AddressError(String),
}

/// Storage adapter error types.
#[derive(Error, Debug)]
pub enum StorageError {
    /// A statement referenced a table the store does not know.
    ///
    /// This is the error class that drives the slave's schema-recovery path;
    /// adapters that can name the table should do so.
    #[error("missing table{}", .table.as_deref().map(|t| format!(" '{t}'")).unwrap_or_default())]
    MissingTable {
        /// Table named by the failing statement, when the store reports it
        table: Option<String>,
    },

    /// Statement execution failure (syntax, constraint, etc.)
    #[error("statement failed: {0}")]
    Statement(String),

    /// A column type the closed type set cannot represent
    #[error("unsupported column type: {0}")]
    UnsupportedType(String),

    /// Connection-level storage errors
    #[error("connection error: {0}")]
    Connection(String),

    /// Schema introspection failures
    #[error("introspection error: {0}")]
    Introspection(String),
}

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error with the given message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new network error with the given message.
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(NetworkError::ConnectionFailed(msg.into()))
    }

    /// Creates a new storage error with the given message.
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(StorageError::Statement(msg.into()))
    }

    /// Creates a new internal error with the given message.
    pub fn internal(msg: impl Into<String>) -> Self {
        Error::Internal(msg.into())
    }

    /// Returns the missing table name if this is the missing-table error class.
    pub fn missing_table(&self) -> Option<Option<&str>> {
        match self {
            Error::Storage(StorageError::MissingTable { table }) => Some(table.as_deref()),
            _ => None,
        }
    }
}
