//! Error types for local store operations.

use thiserror::Error;

/// Result type for local store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in a local store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store has not been initialized.
    #[error("local store is not initialized")]
    NotInitialized,

    /// The referenced table has not been defined.
    #[error("table not defined: {name}")]
    TableNotDefined {
        /// Name of the table.
        name: String,
    },

    /// A row was written with a column the table schema does not define.
    #[error("column {column} is not defined on table {table}")]
    UndefinedColumn {
        /// The table being written.
        table: String,
        /// The offending column.
        column: String,
    },

    /// A row is missing its `id` column or the id is not a string.
    #[error("row in table {table} has a missing or non-string id")]
    InvalidRowId {
        /// The table being written.
        table: String,
    },

    /// The underlying storage failed.
    #[error("storage failure: {message}")]
    Storage {
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Creates a generic storage failure.
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
