//! Wire protocol for the replication link.
//!
//! Every protocol unit is one newline-terminated text line of the form
//! `type:payload`, split on the first colon only. Three message types open
//! multi-line sub-blocks (verification reports and query results); those
//! sub-block lines are framed by [`codec::LineCodec`] like any other line and
//! interpreted by the reader that opened the block.

/// Message types and line parsing
mod message;
/// Line encoding and decoding
pub mod codec;

pub use codec::LineCodec;
pub use message::{Message, TableCount, RESULT_END};

/// Maximum accepted line length in bytes.
///
/// DDL and wide-row INSERT statements can be large; the reader must accept
/// lines of at least 1 MiB.
pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024; // 16MB

/// Collapses newlines and carriage returns in a payload to spaces.
///
/// Lossy but schema-semantics-preserving; applied to every outgoing payload
/// so a naturally multi-line DDL statement cannot break line framing.
pub fn sanitize_payload(payload: &str) -> String {
    payload.replace(['\n', '\r'], " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_payload() {
        assert_eq!(sanitize_payload("plain"), "plain");
        assert_eq!(
            sanitize_payload("CREATE TABLE t (\n  id INT\r\n)"),
            "CREATE TABLE t (   id INT  )"
        );
    }
}
