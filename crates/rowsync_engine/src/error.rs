//! Error types for the sync engine.

use crate::push::PushCompletionResult;
use crate::remote::RemoteError;
use rowsync_store::StoreError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur in the sync engine.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The sync context has not been initialized, or initialization
    /// failed.
    #[error("sync context is not initialized")]
    NotInitialized,

    /// The local store failed.
    #[error("local store error: {0}")]
    Store(#[from] StoreError),

    /// The remote service failed outside a push cycle (pulls).
    #[error("remote service error: {0}")]
    Remote(#[from] RemoteError),

    /// An insert was queued for an item that already has a pending
    /// insert.
    #[error("an insert operation is already queued for item {item_id} in table {table_name}")]
    DuplicateInsert {
        /// Table of the conflicting operation.
        table_name: String,
        /// Item of the conflicting operation.
        item_id: String,
    },

    /// An insert was queued for an item that already exists locally
    /// with a pending update.
    #[error(
        "cannot queue an insert for item {item_id} in table {table_name}: \
         the item already has a pending operation"
    )]
    InsertOnPending {
        /// Table of the conflicting operation.
        table_name: String,
        /// Item of the conflicting operation.
        item_id: String,
    },

    /// An operation was queued for an item that has a pending delete.
    #[error("a delete operation is already queued for item {item_id} in table {table_name}")]
    PendingDelete {
        /// Table of the conflicting operation.
        table_name: String,
        /// Item of the conflicting operation.
        item_id: String,
    },

    /// A row carried a missing or unusable item id.
    #[error("invalid item id: {message}")]
    InvalidItemId {
        /// Description of the problem.
        message: String,
    },

    /// A persisted engine record could not be decoded.
    #[error("invalid persisted record: {message}")]
    InvalidRecord {
        /// Description of the corruption.
        message: String,
    },

    /// A push cycle did not complete cleanly.
    #[error("push failed with status {}", .0.status)]
    PushFailed(Box<PushCompletionResult>),

    /// A purge was requested for a table with pending operations.
    #[error("table {table_name} cannot be purged because it has pending operations")]
    PurgePending {
        /// The table that was asked to be purged.
        table_name: String,
    },

    /// An internal invariant failed.
    #[error("internal sync error: {0}")]
    Internal(String),
}

impl SyncError {
    /// Creates an invalid-record error.
    pub(crate) fn invalid_record(message: impl Into<String>) -> Self {
        Self::InvalidRecord {
            message: message.into(),
        }
    }
}
