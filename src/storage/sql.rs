//! Table-name extraction from SQL statements.
//!
//! The recovery and notification paths need the table a statement touches.
//! Statements are parsed with the SQLite dialect; when the parser rejects a
//! statement the store itself would accept, a token scan over the raw text
//! recovers the name so recovery still works.

use sqlparser::ast::Statement;
use sqlparser::dialect::SQLiteDialect;
use sqlparser::parser::Parser;

/// Strips backticks and double quotes from an identifier.
pub fn clean_identifier(name: &str) -> String {
    name.trim_matches(|c| c == '`' || c == '"').to_string()
}

/// Extracts the target table of an INSERT statement.
pub fn insert_target_table(statement: &str) -> Option<String> {
    if let Ok(ast) = Parser::parse_sql(&SQLiteDialect {}, statement) {
        for stmt in ast {
            if let Statement::Insert { table_name, .. } = stmt {
                return Some(clean_identifier(&table_name.to_string()));
            }
        }
    }
    scan_after_keywords(statement, &["INSERT", "INTO"])
}

/// Extracts the table name from a CREATE TABLE statement.
pub fn create_table_name(statement: &str) -> Option<String> {
    if let Ok(ast) = Parser::parse_sql(&SQLiteDialect {}, statement) {
        for stmt in ast {
            if let Statement::CreateTable { name, .. } = stmt {
                return Some(clean_identifier(&name.to_string()));
            }
        }
    }
    scan_after_keywords(statement, &["CREATE", "TABLE"])
}

/// Token-scan fallback: the identifier following the given keyword sequence.
fn scan_after_keywords(statement: &str, keywords: &[&str]) -> Option<String> {
    let mut tokens = statement.split_whitespace();
    for kw in keywords {
        loop {
            let tok = tokens.next()?;
            if tok.eq_ignore_ascii_case(kw) {
                break;
            }
        }
    }
    let raw = tokens.next()?;
    // The name may run straight into the column list.
    let name = raw.split('(').next().unwrap_or(raw);
    let name = clean_identifier(name);
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}
