//! Database layer for Kickoff

mod connection;
pub mod migrations;

pub use connection::{Database, SharedDatabase};
pub use migrations::Migration;

use crate::error::Error;
use libsql::Value;

/// Bind an optional string, mapping `None` to SQL NULL
pub(crate) fn text_or_null(value: Option<&str>) -> Value {
    value.map_or(Value::Null, |text| Value::Text(text.to_string()))
}

/// Bind an optional integer, mapping `None` to SQL NULL
pub(crate) fn int_or_null(value: Option<i64>) -> Value {
    value.map_or(Value::Null, Value::Integer)
}

/// SQLite reports an exhausted disk or page budget with this message.
pub(crate) fn is_disk_full_error(error: &Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("database or disk is full") || message.contains("sqlite_full")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_disk_full_errors() {
        assert!(is_disk_full_error(&Error::Storage(
            "SQLite failure: database or disk is full".to_string()
        )));
        assert!(!is_disk_full_error(&Error::InvalidInput(
            "title cannot be empty".to_string()
        )));
    }
}
