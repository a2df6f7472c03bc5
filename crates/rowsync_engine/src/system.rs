//! Server-managed system columns and row helpers.

use chrono::{DateTime, SecondsFormat, Utc};
use rowsync_store::Row;
use serde_json::Value;

/// Row id column.
pub const ID: &str = "id";
/// Server-managed creation timestamp.
pub const CREATED_AT: &str = "__createdAt";
/// Server-managed last-modified timestamp.
pub const UPDATED_AT: &str = "__updatedAt";
/// Opaque optimistic-concurrency token.
pub const VERSION: &str = "__version";
/// Soft-delete marker on pulled rows.
pub const DELETED: &str = "__deleted";

/// Returns the row's string id, if present.
pub fn item_id(row: &Row) -> Option<&str> {
    row.get(ID).and_then(Value::as_str)
}

/// Returns true if the row carries the soft-delete marker.
pub fn is_deleted(row: &Row) -> bool {
    row.get(DELETED).and_then(Value::as_bool).unwrap_or(false)
}

/// Returns a copy of the row without server-managed columns.
///
/// System columns all share the `__` prefix; the id stays.
pub fn strip_system_columns(row: &Row) -> Row {
    row.iter()
        .filter(|(name, _)| !name.starts_with("__"))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Formats a timestamp the way the remote service does: RFC 3339 UTC
/// with millisecond precision. The fixed width makes the text sort in
/// timestamp order.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parses a timestamp in the remote service's wire format.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strip_removes_only_system_columns() {
        let mut row = Row::new();
        row.insert(ID.into(), json!("a"));
        row.insert("text".into(), json!("hello"));
        row.insert(CREATED_AT.into(), json!("2024-01-01T00:00:00.000Z"));
        row.insert(UPDATED_AT.into(), json!("2024-01-02T00:00:00.000Z"));
        row.insert(VERSION.into(), json!("3"));

        let stripped = strip_system_columns(&row);
        assert_eq!(stripped.len(), 2);
        assert!(stripped.contains_key(ID));
        assert!(stripped.contains_key("text"));
    }

    #[test]
    fn deleted_marker() {
        let mut row = Row::new();
        row.insert(ID.into(), json!("a"));
        assert!(!is_deleted(&row));

        row.insert(DELETED.into(), json!(true));
        assert!(is_deleted(&row));

        row.insert(DELETED.into(), json!(false));
        assert!(!is_deleted(&row));
    }

    #[test]
    fn timestamp_roundtrip() {
        let text = "2024-03-05T12:30:45.123Z";
        let parsed = parse_timestamp(text).unwrap();
        assert_eq!(format_timestamp(parsed), text);
    }

    #[test]
    fn timestamp_text_sorts_chronologically() {
        let a = format_timestamp(parse_timestamp("2024-01-01T00:00:00.999Z").unwrap());
        let b = format_timestamp(parse_timestamp("2024-01-01T00:00:01.000Z").unwrap());
        assert!(a < b);
    }
}
