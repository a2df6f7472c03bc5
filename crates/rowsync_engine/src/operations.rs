//! Table operations: the pending-mutation record, its collapsing rules
//! and its local/remote executors.

use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteError, RemoteService};
use crate::system;
use chrono::{DateTime, Utc};
use rowsync_store::{LocalStore, Row};
use serde_json::Value;
use uuid::Uuid;

/// Table that backs up client rows removed by a queued delete, so the
/// push path can still send them.
pub(crate) const BACKUP_TABLE: &str = "__item_backups";

/// Kind of a pending table operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableOperationKind {
    /// The item was created locally and does not exist remotely yet.
    Insert,
    /// The item exists remotely and was changed locally.
    Update,
    /// The item was deleted locally.
    Delete,
}

impl TableOperationKind {
    /// Converts to a numeric code for persistence.
    pub fn to_code(self) -> u8 {
        match self {
            TableOperationKind::Insert => 0,
            TableOperationKind::Update => 1,
            TableOperationKind::Delete => 2,
        }
    }

    /// Converts from a numeric code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(TableOperationKind::Insert),
            1 => Some(TableOperationKind::Update),
            2 => Some(TableOperationKind::Delete),
            _ => None,
        }
    }
}

/// A pending local mutation awaiting synchronization.
///
/// The operation records intent only; the item's data lives in the
/// local store (or, for deletes, in the item backup table). Identity
/// for collapsing purposes is `(table_name, item_id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct TableOperation {
    /// Unique operation id.
    pub id: String,
    /// What the operation does.
    pub kind: TableOperationKind,
    /// The table the item belongs to.
    pub table_name: String,
    /// The item the operation targets.
    pub item_id: String,
    /// When the operation was first queued.
    pub created_at: DateTime<Utc>,
    /// Queue position, assigned at enqueue. Monotonically increasing
    /// across the life of the operation log.
    pub sequence: u64,
}

impl TableOperation {
    /// Creates a new operation with a fresh id. The sequence is
    /// assigned when the operation is enqueued.
    pub fn new(
        kind: TableOperationKind,
        table_name: impl Into<String>,
        item_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            table_name: table_name.into(),
            item_id: item_id.into(),
            created_at: Utc::now(),
            sequence: 0,
        }
    }

    /// The `(table, item)` compound key used for collapsing and item
    /// locks. `/` is reserved in item ids, which makes the compound
    /// unambiguous.
    pub fn item_key(&self) -> String {
        item_key(&self.table_name, &self.item_id)
    }

    /// Serializes the operation to an operations-table row.
    pub(crate) fn to_row(&self) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), Value::String(self.id.clone()));
        row.insert("kind".into(), Value::from(self.kind.to_code()));
        row.insert("tablename".into(), Value::String(self.table_name.clone()));
        row.insert("itemid".into(), Value::String(self.item_id.clone()));
        row.insert(
            "__createdat".into(),
            Value::String(system::format_timestamp(self.created_at)),
        );
        row.insert("sequence".into(), Value::from(self.sequence));
        row
    }

    /// Deserializes an operation from an operations-table row.
    pub(crate) fn from_row(row: &Row) -> SyncResult<Self> {
        let text = |field: &str| {
            row.get(field)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| SyncError::invalid_record(format!("operation missing {field}")))
        };

        let kind_code = row
            .get("kind")
            .and_then(Value::as_u64)
            .ok_or_else(|| SyncError::invalid_record("operation missing kind"))?;
        let kind = TableOperationKind::from_code(kind_code as u8)
            .ok_or_else(|| SyncError::invalid_record(format!("unknown operation kind {kind_code}")))?;

        let created_at = system::parse_timestamp(&text("__createdat")?)
            .ok_or_else(|| SyncError::invalid_record("operation has malformed __createdat"))?;

        let sequence = row
            .get("sequence")
            .and_then(Value::as_u64)
            .ok_or_else(|| SyncError::invalid_record("operation missing sequence"))?;

        Ok(Self {
            id: text("id")?,
            kind,
            table_name: text("tablename")?,
            item_id: text("itemid")?,
            created_at,
            sequence,
        })
    }
}

/// Builds the compound `(table, item)` key.
pub(crate) fn item_key(table_name: &str, item_id: &str) -> String {
    format!("{table_name}/{item_id}")
}

/// Outcome of merging a new operation into an existing queued one for
/// the same item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collapse {
    /// The existing entry stays; the new operation is absorbed. The
    /// item's snapshot in the local store already reflects the new
    /// data.
    KeepExisting,
    /// The existing entry is removed and the new operation is queued
    /// in its place, at the tail.
    ReplaceWithIncoming,
    /// Both cancel out; the entry is removed and the new operation is
    /// dropped (the item never reached the server).
    CancelBoth,
}

/// Applies the collapse table to `(existing, incoming)`.
///
/// Illegal transitions fail: a second insert on a pending item, an
/// insert over a pending update, and anything after a pending delete.
pub fn collapse(existing: TableOperationKind, incoming: &TableOperation) -> SyncResult<Collapse> {
    use TableOperationKind::{Delete, Insert, Update};

    match (existing, incoming.kind) {
        (Insert, Insert) => Err(SyncError::DuplicateInsert {
            table_name: incoming.table_name.clone(),
            item_id: incoming.item_id.clone(),
        }),
        (Insert, Update) => Ok(Collapse::KeepExisting),
        (Insert, Delete) => Ok(Collapse::CancelBoth),
        (Update, Insert) => Err(SyncError::InsertOnPending {
            table_name: incoming.table_name.clone(),
            item_id: incoming.item_id.clone(),
        }),
        (Update, Update) => Ok(Collapse::KeepExisting),
        (Update, Delete) => Ok(Collapse::ReplaceWithIncoming),
        (Delete, _) => Err(SyncError::PendingDelete {
            table_name: incoming.table_name.clone(),
            item_id: incoming.item_id.clone(),
        }),
    }
}

/// Applies an operation to the local store.
///
/// Inserts and updates write the item row; deletes back up the current
/// row (so the push path can still send it) and remove it. Runs under
/// the item's exclusive lock, in the same critical section as the log
/// write.
pub(crate) fn apply_local(
    operation: &TableOperation,
    store: &dyn LocalStore,
    item: Option<&Row>,
) -> SyncResult<()> {
    match operation.kind {
        TableOperationKind::Insert | TableOperationKind::Update => {
            let item = item.ok_or_else(|| {
                SyncError::Internal("insert/update operation applied without an item".into())
            })?;
            store.upsert(&operation.table_name, &[item.clone()], false)?;
        }
        TableOperationKind::Delete => {
            if let Some(existing) = store.lookup(&operation.table_name, &operation.item_id)? {
                let mut backup = Row::new();
                backup.insert("id".into(), Value::String(operation.item_key()));
                backup.insert(
                    "tablename".into(),
                    Value::String(operation.table_name.clone()),
                );
                backup.insert("itemid".into(), Value::String(operation.item_id.clone()));
                backup.insert("clientitem".into(), Value::Object(existing));
                store.upsert(BACKUP_TABLE, &[backup], false)?;
            }
            store.delete_ids(&operation.table_name, &[operation.item_id.clone()])?;
        }
    }
    Ok(())
}

/// Executes an operation against the remote service.
///
/// Inserts strip the server-managed system columns; updates attach the
/// last-known `__version` token so the service can detect conflicting
/// concurrent writes; a "not found" answer to a delete counts as
/// success.
pub(crate) fn execute_remote(
    operation: &TableOperation,
    remote: &dyn RemoteService,
    item: Option<&Row>,
) -> SyncResult<Option<Row>> {
    match operation.kind {
        TableOperationKind::Insert => {
            let item = item.ok_or_else(|| {
                SyncError::Internal(format!(
                    "queued insert for {} has no local item",
                    operation.item_key()
                ))
            })?;
            let payload = system::strip_system_columns(item);
            let stored = remote.insert(&operation.table_name, &payload)?;
            Ok(Some(stored))
        }
        TableOperationKind::Update => {
            let item = item.ok_or_else(|| {
                SyncError::Internal(format!(
                    "queued update for {} has no local item",
                    operation.item_key()
                ))
            })?;
            let mut payload = system::strip_system_columns(item);
            if let Some(version) = item.get(system::VERSION) {
                payload.insert(system::VERSION.into(), version.clone());
            }
            let stored = remote.update(&operation.table_name, &payload)?;
            Ok(Some(stored))
        }
        TableOperationKind::Delete => {
            match remote.delete(&operation.table_name, &operation.item_id) {
                Ok(()) => Ok(None),
                // The row is already gone remotely; the delete is
                // satisfied.
                Err(RemoteError::Status { code: 404, .. }) => Ok(None),
                Err(err) => Err(err.into()),
            }
        }
    }
}
