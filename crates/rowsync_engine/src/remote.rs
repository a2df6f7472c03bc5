//! Remote data service contract.

use crate::system;
use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rowsync_store::{Query, Row};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;

/// Result type for remote service calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors returned by the remote data service.
#[derive(Debug, Clone, Error)]
pub enum RemoteError {
    /// The request never completed: connection refused, timeout, DNS
    /// failure. Aborts the current push cycle.
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with a non-success status.
    #[error("remote service returned status {code}")]
    Status {
        /// HTTP status code.
        code: u16,
        /// Raw response body, when available.
        response: Option<String>,
        /// The server's copy of the row, when the response carried one
        /// (conflict responses do).
        server_item: Option<Row>,
    },
}

impl RemoteError {
    /// Creates a status error without a body.
    pub fn status(code: u16) -> Self {
        Self::Status {
            code,
            response: None,
            server_item: None,
        }
    }

    /// Returns the status code, if this is a status error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            RemoteError::Status { code, .. } => Some(*code),
            RemoteError::Network(_) => None,
        }
    }
}

/// A query-capable JSON table endpoint.
///
/// The service manages the system columns: it assigns `__createdAt`,
/// `__updatedAt` and `__version` on writes, and rejects an update whose
/// `__version` no longer matches its copy.
pub trait RemoteService: Send + Sync {
    /// Inserts a row; returns the stored row including system columns.
    fn insert(&self, table: &str, row: &Row) -> RemoteResult<Row>;

    /// Updates a row; returns the stored row including system columns.
    fn update(&self, table: &str, row: &Row) -> RemoteResult<Row>;

    /// Deletes a row by id.
    fn delete(&self, table: &str, item_id: &str) -> RemoteResult<()>;

    /// Reads rows matching a query.
    fn read(&self, table: &str, query: &Query) -> RemoteResult<Vec<Row>>;
}

/// An in-memory remote service for testing.
///
/// Behaves like the real endpoint: it assigns system columns on writes,
/// answers 409 for conflicting inserts and stale-version updates (with
/// the server row attached), and 404 for updates or deletes of missing
/// rows. Errors can also be injected for the next call, and call overlap
/// is tracked so tests can assert single-flight pushes.
pub struct MockRemoteService {
    tables: Mutex<HashMap<String, BTreeMap<String, Row>>>,
    injected_errors: Mutex<VecDeque<RemoteError>>,
    calls: Mutex<Vec<String>>,
    clock_ms: AtomicU64,
    active_calls: AtomicUsize,
    overlapped: AtomicBool,
    latency_ms: AtomicU64,
}

impl Default for MockRemoteService {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRemoteService {
    /// Creates an empty mock service.
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            injected_errors: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            clock_ms: AtomicU64::new(1),
            active_calls: AtomicUsize::new(0),
            overlapped: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Queues an error to be returned by the next call.
    pub fn fail_next_with(&self, error: RemoteError) {
        self.injected_errors.lock().push_back(error);
    }

    /// Adds artificial latency to every call, to widen race windows in
    /// concurrency tests.
    pub fn set_latency_ms(&self, latency: u64) {
        self.latency_ms.store(latency, Ordering::SeqCst);
    }

    /// Seeds a server row directly, bypassing system-column assignment.
    /// The row must already carry `id`, `__updatedAt` and `__version`.
    pub fn seed_row(&self, table: &str, row: Row) {
        let id = system::item_id(&row).unwrap_or_default().to_string();
        self.tables
            .lock()
            .entry(table.to_string())
            .or_default()
            .insert(id, row);
    }

    /// Returns the server's copy of a row.
    pub fn server_row(&self, table: &str, item_id: &str) -> Option<Row> {
        self.tables
            .lock()
            .get(table)
            .and_then(|t| t.get(item_id))
            .cloned()
    }

    /// Returns the calls made so far, as `"<op> <table>/<id>"` strings.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Returns true if two calls ever executed concurrently.
    pub fn saw_overlapping_calls(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    fn next_timestamp(&self) -> String {
        let tick = self.clock_ms.fetch_add(1, Ordering::SeqCst);
        let base = Utc
            .with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        system::format_timestamp(base + Duration::milliseconds(tick as i64))
    }

    fn enter_call(&self, description: String) -> CallGuard<'_> {
        if self.active_calls.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlapped.store(true, Ordering::SeqCst);
        }
        self.calls.lock().push(description);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            std::thread::sleep(std::time::Duration::from_millis(latency));
        }
        CallGuard { service: self }
    }

    fn take_injected_error(&self) -> Option<RemoteError> {
        self.injected_errors.lock().pop_front()
    }

    fn conflict(server_item: &Row) -> RemoteError {
        RemoteError::Status {
            code: 409,
            response: serde_json::to_string(&Value::Object(server_item.clone())).ok(),
            server_item: Some(server_item.clone()),
        }
    }
}

struct CallGuard<'a> {
    service: &'a MockRemoteService,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.service.active_calls.fetch_sub(1, Ordering::SeqCst);
    }
}

impl RemoteService for MockRemoteService {
    fn insert(&self, table: &str, row: &Row) -> RemoteResult<Row> {
        let id = system::item_id(row)
            .ok_or_else(|| RemoteError::status(400))?
            .to_string();
        let _call = self.enter_call(format!("insert {table}/{id}"));
        if let Some(error) = self.take_injected_error() {
            return Err(error);
        }

        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        if let Some(existing) = rows.get(&id) {
            return Err(Self::conflict(existing));
        }

        let timestamp = self.next_timestamp();
        let mut stored = row.clone();
        stored.insert(system::CREATED_AT.into(), Value::String(timestamp.clone()));
        stored.insert(system::UPDATED_AT.into(), Value::String(timestamp));
        stored.insert(system::VERSION.into(), Value::String("1".into()));
        rows.insert(id, stored.clone());
        Ok(stored)
    }

    fn update(&self, table: &str, row: &Row) -> RemoteResult<Row> {
        let id = system::item_id(row)
            .ok_or_else(|| RemoteError::status(400))?
            .to_string();
        let _call = self.enter_call(format!("update {table}/{id}"));
        if let Some(error) = self.take_injected_error() {
            return Err(error);
        }

        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        let existing = match rows.get(&id) {
            Some(existing) => existing.clone(),
            None => return Err(RemoteError::status(404)),
        };

        // Optimistic concurrency: a stale version token is a conflict.
        if let Some(sent) = row.get(system::VERSION) {
            if existing.get(system::VERSION) != Some(sent) {
                return Err(Self::conflict(&existing));
            }
        }

        let version = existing
            .get(system::VERSION)
            .and_then(Value::as_str)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let mut stored = existing;
        for (name, value) in row {
            if !name.starts_with("__") {
                stored.insert(name.clone(), value.clone());
            }
        }
        stored.insert(
            system::UPDATED_AT.into(),
            Value::String(self.next_timestamp()),
        );
        stored.insert(
            system::VERSION.into(),
            Value::String((version + 1).to_string()),
        );
        rows.insert(id, stored.clone());
        Ok(stored)
    }

    fn delete(&self, table: &str, item_id: &str) -> RemoteResult<()> {
        let _call = self.enter_call(format!("delete {table}/{item_id}"));
        if let Some(error) = self.take_injected_error() {
            return Err(error);
        }

        let mut tables = self.tables.lock();
        let rows = tables.entry(table.to_string()).or_default();
        if rows.remove(item_id).is_none() {
            return Err(RemoteError::status(404));
        }
        Ok(())
    }

    fn read(&self, table: &str, query: &Query) -> RemoteResult<Vec<Row>> {
        let _call = self.enter_call(format!("read {table}"));
        if let Some(error) = self.take_injected_error() {
            return Err(error);
        }

        let tables = self.tables.lock();
        let rows: Vec<Row> = tables
            .get(table)
            .map(|t| t.values().cloned().collect())
            .unwrap_or_default();
        let rows = if query.include_deleted {
            rows
        } else {
            rows.into_iter().filter(|r| !system::is_deleted(r)).collect()
        };
        Ok(query.apply(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: &str, text: &str) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("text".into(), json!(text));
        row
    }

    #[test]
    fn insert_assigns_system_columns() {
        let remote = MockRemoteService::new();
        let stored = remote.insert("todo", &row("a", "first")).unwrap();

        assert!(stored.contains_key(system::CREATED_AT));
        assert!(stored.contains_key(system::UPDATED_AT));
        assert_eq!(stored.get(system::VERSION), Some(&json!("1")));
    }

    #[test]
    fn duplicate_insert_is_conflict_with_server_item() {
        let remote = MockRemoteService::new();
        remote.insert("todo", &row("a", "first")).unwrap();

        let err = remote.insert("todo", &row("a", "again")).unwrap_err();
        match err {
            RemoteError::Status {
                code, server_item, ..
            } => {
                assert_eq!(code, 409);
                let server_item = server_item.unwrap();
                assert_eq!(server_item.get("text"), Some(&json!("first")));
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[test]
    fn update_bumps_version_and_timestamp() {
        let remote = MockRemoteService::new();
        let stored = remote.insert("todo", &row("a", "first")).unwrap();
        let first_updated = stored.get(system::UPDATED_AT).cloned();

        let mut change = row("a", "second");
        change.insert(
            system::VERSION.into(),
            stored.get(system::VERSION).cloned().unwrap(),
        );
        let updated = remote.update("todo", &change).unwrap();

        assert_eq!(updated.get(system::VERSION), Some(&json!("2")));
        assert_ne!(updated.get(system::UPDATED_AT).cloned(), first_updated);
    }

    #[test]
    fn stale_version_update_is_conflict() {
        let remote = MockRemoteService::new();
        remote.insert("todo", &row("a", "first")).unwrap();

        let mut change = row("a", "stale");
        change.insert(system::VERSION.into(), json!("99"));
        let err = remote.update("todo", &change).unwrap_err();
        assert_eq!(err.status_code(), Some(409));
    }

    #[test]
    fn delete_missing_row_is_not_found() {
        let remote = MockRemoteService::new();
        let err = remote.delete("todo", "missing").unwrap_err();
        assert_eq!(err.status_code(), Some(404));
    }

    #[test]
    fn read_excludes_deleted_unless_requested() {
        let remote = MockRemoteService::new();
        remote.insert("todo", &row("a", "live")).unwrap();
        let mut dead = row("b", "gone");
        dead.insert(system::DELETED.into(), json!(true));
        dead.insert(system::UPDATED_AT.into(), json!("2024-01-01T00:00:05.000Z"));
        dead.insert(system::VERSION.into(), json!("1"));
        remote.seed_row("todo", dead);

        let plain = remote.read("todo", &Query::table("todo")).unwrap();
        assert_eq!(plain.len(), 1);

        let all = remote
            .read("todo", &Query::table("todo").include_deleted(true))
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn injected_error_is_consumed_once() {
        let remote = MockRemoteService::new();
        remote.fail_next_with(RemoteError::Network("connection reset".into()));

        let err = remote.insert("todo", &row("a", "first")).unwrap_err();
        assert!(matches!(err, RemoteError::Network(_)));

        remote.insert("todo", &row("a", "first")).unwrap();
    }
}
