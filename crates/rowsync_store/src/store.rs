//! Local store contract.

use crate::error::StoreResult;
use crate::query::Query;
use crate::Row;
use std::collections::BTreeMap;

/// Column data types a table schema can declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    /// UTF-8 text.
    String,
    /// Whole number.
    Integer,
    /// Floating point number.
    Real,
    /// True/false.
    Boolean,
    /// RFC 3339 timestamp text.
    DateTime,
    /// Arbitrary nested JSON.
    Json,
}

/// Schema of one table: column names mapped to their types.
///
/// Every table must declare an `id` column of type [`ColumnType::String`];
/// rows are addressed by it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    columns: BTreeMap<String, ColumnType>,
}

impl TableSchema {
    /// Creates an empty schema.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a column to the schema.
    pub fn column(mut self, name: impl Into<String>, column_type: ColumnType) -> Self {
        self.columns.insert(name.into(), column_type);
        self
    }

    /// Returns true if the schema declares the given column.
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    /// Iterates over the declared columns.
    pub fn columns(&self) -> impl Iterator<Item = (&str, ColumnType)> {
        self.columns.iter().map(|(name, ty)| (name.as_str(), *ty))
    }
}

/// Durable key/row storage per table, addressed by string row id.
///
/// The sync engine shares one store between the application thread
/// (enqueue), the push consumer (drain) and the pull path (write), so
/// implementations must be internally synchronized. Each call is
/// independently atomic; no cross-table transactions are assumed.
pub trait LocalStore: Send + Sync {
    /// Prepares the store for use. Called once, after all tables have
    /// been defined.
    fn initialize(&self) -> StoreResult<()>;

    /// Declares a table and its column schema.
    fn define_table(&self, name: &str, schema: &TableSchema) -> StoreResult<()>;

    /// Reads rows matching a query.
    fn read(&self, query: &Query) -> StoreResult<Vec<Row>>;

    /// Looks up a single row by id.
    fn lookup(&self, table: &str, item_id: &str) -> StoreResult<Option<Row>>;

    /// Inserts or replaces rows.
    ///
    /// When `from_server` is true the rows came from the remote service:
    /// columns the schema does not declare are dropped. When false the
    /// rows are client writes and an undeclared column is an error.
    fn upsert(&self, table: &str, rows: &[Row], from_server: bool) -> StoreResult<()>;

    /// Deletes rows by id. Missing ids are ignored.
    fn delete_ids(&self, table: &str, item_ids: &[String]) -> StoreResult<()>;

    /// Deletes every row matching a query.
    fn delete(&self, query: &Query) -> StoreResult<()>;
}
