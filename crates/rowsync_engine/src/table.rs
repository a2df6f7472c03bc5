//! Table-scoped handle over the sync context.

use crate::context::{normalize_table_name, SyncContext};
use crate::error::{SyncError, SyncResult};
use crate::system;
use rowsync_store::{Query, Row};
use serde_json::Value;
use uuid::Uuid;

/// A handle to one synced table.
///
/// Mutations write the local store and queue an operation for the next
/// push; reads serve from the local replica. Obtained from
/// [`SyncContext::table`]. The table name is normalized (trimmed,
/// lowercased) at construction.
pub struct SyncTable {
    name: String,
    context: SyncContext,
}

impl SyncTable {
    pub(crate) fn new(context: SyncContext, name: &str) -> Self {
        Self {
            name: normalize_table_name(name),
            context,
        }
    }

    /// The normalized table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Inserts an item locally and queues a remote insert.
    ///
    /// A missing id is generated; a present id must be a usable
    /// string. Returns the row as stored, id included.
    pub fn insert(&self, mut row: Row) -> SyncResult<Row> {
        let item_id = match row.get(system::ID) {
            None => {
                let id = Uuid::new_v4().to_string();
                row.insert(system::ID.into(), Value::String(id.clone()));
                id
            }
            Some(Value::String(id)) => {
                validate_item_id(id)?;
                id.clone()
            }
            Some(other) => {
                return Err(SyncError::InvalidItemId {
                    message: format!("id must be a string, got {other}"),
                })
            }
        };

        self.context.insert(&self.name, &item_id, row.clone())?;
        Ok(row)
    }

    /// Updates an item locally and queues a remote update.
    pub fn update(&self, row: Row) -> SyncResult<()> {
        let item_id = row
            .get(system::ID)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| SyncError::InvalidItemId {
                message: "update requires a string id".into(),
            })?;
        validate_item_id(&item_id)?;

        self.context.update(&self.name, &item_id, row)
    }

    /// Deletes an item locally and queues a remote delete.
    pub fn delete(&self, item_id: &str) -> SyncResult<()> {
        validate_item_id(item_id)?;
        self.context.delete(&self.name, item_id)
    }

    /// Looks up an item in the local replica.
    pub fn lookup(&self, item_id: &str) -> SyncResult<Option<Row>> {
        self.context.lookup(&self.name, item_id)
    }

    /// Reads rows from the local replica.
    pub fn read(&self, query: Option<Query>) -> SyncResult<Vec<Row>> {
        self.context.read(&self.name, query)
    }

    /// Pulls remote rows into the local replica. See
    /// [`SyncContext::pull`].
    pub fn pull(&self, query: Option<Query>, query_id: Option<&str>) -> SyncResult<()> {
        self.context.pull(&self.name, query, query_id)
    }

    /// Deletes local rows without queueing remote deletes. See
    /// [`SyncContext::purge`].
    pub fn purge(&self, query: Option<Query>) -> SyncResult<()> {
        self.context.purge(&self.name, query)
    }
}

/// Ids key the operation log's compound `(table, item)` identity, so
/// they must be non-empty and `/`-free.
fn validate_item_id(item_id: &str) -> SyncResult<()> {
    if item_id.is_empty() {
        return Err(SyncError::InvalidItemId {
            message: "id must not be empty".into(),
        });
    }
    if item_id.contains('/') {
        return Err(SyncError::InvalidItemId {
            message: format!("id {item_id:?} must not contain '/'"),
        });
    }
    Ok(())
}
