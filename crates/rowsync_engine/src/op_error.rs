//! Per-operation push failures, persisted for later inspection.

use crate::error::{SyncError, SyncResult};
use crate::operations::{TableOperation, TableOperationKind};
use crate::remote::RemoteError;
use crate::system;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rowsync_store::{ColumnType, LocalStore, Query, Row, StoreResult, TableSchema};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

/// Table that persists operation errors.
pub(crate) const ERRORS_TABLE: &str = "__errors";

/// A queued operation that failed against the remote service.
///
/// Created during a push cycle for handled rejections (conflict,
/// validation); persisted until the application clears the list.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOperationError {
    /// Unique error record id.
    pub id: String,
    /// Kind of the failed operation.
    pub operation_kind: TableOperationKind,
    /// Table of the failed operation.
    pub table_name: String,
    /// Item the operation targeted.
    pub item_id: String,
    /// The client's copy of the item at failure time.
    pub client_item: Option<Row>,
    /// Human-readable failure description.
    pub error_message: String,
    /// HTTP status code, when the failure was a status response.
    pub status_code: Option<u16>,
    /// Raw response body, when available.
    pub server_response: Option<String>,
    /// The server's copy of the item, when the response carried one.
    pub server_item: Option<Row>,
    /// When the error was recorded.
    pub created_at: DateTime<Utc>,
}

impl TableOperationError {
    /// Builds an error record from a failed remote call.
    pub fn from_remote(
        operation: &TableOperation,
        client_item: Option<Row>,
        error: &RemoteError,
    ) -> Self {
        let (status_code, server_response, server_item) = match error {
            RemoteError::Status {
                code,
                response,
                server_item,
            } => (Some(*code), response.clone(), server_item.clone()),
            RemoteError::Network(_) => (None, None, None),
        };

        Self {
            id: Uuid::new_v4().to_string(),
            operation_kind: operation.kind,
            table_name: operation.table_name.clone(),
            item_id: operation.item_id.clone(),
            client_item,
            error_message: error.to_string(),
            status_code,
            server_response,
            server_item,
            created_at: Utc::now(),
        }
    }

    fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::String(self.id.clone()));
        row.insert(
            "operationkind".into(),
            Value::from(self.operation_kind.to_code()),
        );
        row.insert("tablename".into(), Value::String(self.table_name.clone()));
        row.insert("itemid".into(), Value::String(self.item_id.clone()));
        if let Some(item) = &self.client_item {
            row.insert("clientitem".into(), Value::Object(item.clone()));
        }
        row.insert(
            "errormessage".into(),
            Value::String(self.error_message.clone()),
        );
        if let Some(code) = self.status_code {
            row.insert("statuscode".into(), Value::from(code));
        }
        if let Some(response) = &self.server_response {
            row.insert("serverresponse".into(), Value::String(response.clone()));
        }
        if let Some(item) = &self.server_item {
            row.insert("serveritem".into(), Value::Object(item.clone()));
        }
        row.insert(
            "__createdat".into(),
            Value::String(system::format_timestamp(self.created_at)),
        );
        row
    }

    fn from_row(row: &Row) -> SyncResult<Self> {
        let text = |field: &str| {
            row.get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| {
                    SyncError::invalid_record(format!("operation error missing {field}"))
                })
        };

        let kind_code = row
            .get("operationkind")
            .and_then(Value::as_u64)
            .ok_or_else(|| SyncError::invalid_record("operation error missing operationkind"))?;
        let operation_kind = TableOperationKind::from_code(kind_code as u8).ok_or_else(|| {
            SyncError::invalid_record(format!("unknown operation kind {kind_code}"))
        })?;

        let created_at = system::parse_timestamp(&text("__createdat")?)
            .ok_or_else(|| SyncError::invalid_record("operation error has malformed __createdat"))?;

        let object = |field: &str| {
            row.get(field)
                .and_then(Value::as_object)
                .cloned()
        };

        Ok(Self {
            id: text("id")?,
            operation_kind,
            table_name: text("tablename")?,
            item_id: text("itemid")?,
            client_item: object("clientitem"),
            error_message: text("errormessage")?,
            status_code: row
                .get("statuscode")
                .and_then(Value::as_u64)
                .map(|c| c as u16),
            server_response: row
                .get("serverresponse")
                .and_then(Value::as_str)
                .map(str::to_string),
            server_item: object("serveritem"),
            created_at,
        })
    }
}

/// The durable list of recorded operation errors.
pub struct OperationErrorList {
    store: Arc<dyn LocalStore>,
    list: RwLock<Vec<TableOperationError>>,
}

impl OperationErrorList {
    /// Declares the errors table on the local store.
    pub(crate) fn initialize_store(store: &dyn LocalStore) -> StoreResult<()> {
        store.define_table(
            ERRORS_TABLE,
            &TableSchema::new()
                .column("id", ColumnType::String)
                .column("operationkind", ColumnType::Integer)
                .column("tablename", ColumnType::String)
                .column("itemid", ColumnType::String)
                .column("clientitem", ColumnType::Json)
                .column("errormessage", ColumnType::String)
                .column("statuscode", ColumnType::Integer)
                .column("serverresponse", ColumnType::String)
                .column("serveritem", ColumnType::Json)
                .column("__createdat", ColumnType::DateTime),
        )
    }

    /// Loads persisted error records from the local store.
    pub fn load(store: Arc<dyn LocalStore>) -> SyncResult<Self> {
        let rows = store.read(&Query::table(ERRORS_TABLE))?;
        let mut list = Vec::with_capacity(rows.len());
        for row in &rows {
            list.push(TableOperationError::from_row(row)?);
        }
        Ok(Self {
            store,
            list: RwLock::new(list),
        })
    }

    /// Records a new error, persisting it before it becomes visible.
    pub fn add(&self, error: TableOperationError) -> SyncResult<()> {
        let mut list = self.list.write();
        self.store.upsert(ERRORS_TABLE, &[error.to_row()], false)?;
        list.push(error);
        Ok(())
    }

    /// Number of recorded errors.
    pub fn count(&self) -> usize {
        self.list.read().len()
    }

    /// Returns a copy of all recorded errors.
    pub fn all(&self) -> Vec<TableOperationError> {
        self.list.read().clone()
    }

    /// Clears the list and its persisted rows.
    pub fn clear(&self) -> SyncResult<()> {
        let mut list = self.list.write();
        self.store.delete(&Query::table(ERRORS_TABLE))?;
        list.clear();
        Ok(())
    }
}
