//! In-memory local store.

use crate::error::{StoreError, StoreResult};
use crate::query::Query;
use crate::store::{LocalStore, TableSchema};
use crate::Row;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<String, Row>,
}

/// An in-memory [`LocalStore`].
///
/// Suitable for tests and for ephemeral replicas that do not need to
/// survive a process restart. Thread-safe; a single instance can be
/// shared between the sync context and the application.
#[derive(Default)]
pub struct MemoryLocalStore {
    tables: RwLock<HashMap<String, MemoryTable>>,
}

impl MemoryLocalStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of rows in a table, for inspection in tests.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }

    fn row_id(table: &str, row: &Row) -> StoreResult<String> {
        match row.get("id") {
            Some(Value::String(id)) if !id.is_empty() => Ok(id.clone()),
            _ => Err(StoreError::InvalidRowId {
                table: table.to_string(),
            }),
        }
    }
}

impl LocalStore for MemoryLocalStore {
    fn initialize(&self) -> StoreResult<()> {
        Ok(())
    }

    fn define_table(&self, name: &str, schema: &TableSchema) -> StoreResult<()> {
        let mut tables = self.tables.write();
        // Redefinition keeps existing rows; only the schema is replaced.
        match tables.get_mut(name) {
            Some(table) => table.schema = schema.clone(),
            None => {
                tables.insert(
                    name.to_string(),
                    MemoryTable {
                        schema: schema.clone(),
                        rows: BTreeMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    fn read(&self, query: &Query) -> StoreResult<Vec<Row>> {
        let tables = self.tables.read();
        let table = tables
            .get(&query.table_name)
            .ok_or_else(|| StoreError::TableNotDefined {
                name: query.table_name.clone(),
            })?;
        Ok(query.apply(table.rows.values().cloned().collect()))
    }

    fn lookup(&self, table: &str, item_id: &str) -> StoreResult<Option<Row>> {
        let tables = self.tables.read();
        let table = tables
            .get(table)
            .ok_or_else(|| StoreError::TableNotDefined {
                name: table.to_string(),
            })?;
        Ok(table.rows.get(item_id).cloned())
    }

    fn upsert(&self, table_name: &str, rows: &[Row], from_server: bool) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| StoreError::TableNotDefined {
                name: table_name.to_string(),
            })?;

        for row in rows {
            let id = Self::row_id(table_name, row)?;

            let row = if from_server {
                // Server rows may carry columns the replica does not track.
                row.iter()
                    .filter(|(name, _)| table.schema.has_column(name))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect()
            } else {
                for name in row.keys() {
                    if !table.schema.has_column(name) {
                        return Err(StoreError::UndefinedColumn {
                            table: table_name.to_string(),
                            column: name.clone(),
                        });
                    }
                }
                row.clone()
            };

            table.rows.insert(id, row);
        }

        Ok(())
    }

    fn delete_ids(&self, table_name: &str, item_ids: &[String]) -> StoreResult<()> {
        let mut tables = self.tables.write();
        let table = tables
            .get_mut(table_name)
            .ok_or_else(|| StoreError::TableNotDefined {
                name: table_name.to_string(),
            })?;
        for id in item_ids {
            table.rows.remove(id);
        }
        Ok(())
    }

    fn delete(&self, query: &Query) -> StoreResult<()> {
        let matching: Vec<String> = {
            let tables = self.tables.read();
            let table =
                tables
                    .get(&query.table_name)
                    .ok_or_else(|| StoreError::TableNotDefined {
                        name: query.table_name.clone(),
                    })?;
            query
                .apply(table.rows.values().cloned().collect())
                .iter()
                .filter_map(|r| r.get("id").and_then(|v| v.as_str()).map(String::from))
                .collect()
        };

        self.delete_ids(&query.table_name, &matching)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{Filter, QueryOrder};
    use crate::store::ColumnType;
    use serde_json::json;

    fn todo_schema() -> TableSchema {
        TableSchema::new()
            .column("id", ColumnType::String)
            .column("text", ColumnType::String)
            .column("rank", ColumnType::Integer)
    }

    fn todo_row(id: &str, text: &str, rank: i64) -> Row {
        let mut row = Row::new();
        row.insert("id".into(), json!(id));
        row.insert("text".into(), json!(text));
        row.insert("rank".into(), json!(rank));
        row
    }

    fn store_with_table() -> MemoryLocalStore {
        let store = MemoryLocalStore::new();
        store.define_table("todo", &todo_schema()).unwrap();
        store.initialize().unwrap();
        store
    }

    #[test]
    fn upsert_and_lookup() {
        let store = store_with_table();
        store
            .upsert("todo", &[todo_row("a", "first", 1)], false)
            .unwrap();

        let row = store.lookup("todo", "a").unwrap().unwrap();
        assert_eq!(row.get("text"), Some(&json!("first")));

        assert!(store.lookup("todo", "missing").unwrap().is_none());
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let store = store_with_table();
        store
            .upsert("todo", &[todo_row("a", "first", 1)], false)
            .unwrap();
        store
            .upsert("todo", &[todo_row("a", "second", 2)], false)
            .unwrap();

        let row = store.lookup("todo", "a").unwrap().unwrap();
        assert_eq!(row.get("text"), Some(&json!("second")));
        assert_eq!(store.row_count("todo"), 1);
    }

    #[test]
    fn client_write_with_unknown_column_fails() {
        let store = store_with_table();
        let mut row = todo_row("a", "first", 1);
        row.insert("extra".into(), json!("x"));

        let result = store.upsert("todo", &[row], false);
        assert!(matches!(
            result,
            Err(StoreError::UndefinedColumn { .. })
        ));
    }

    #[test]
    fn server_write_drops_unknown_columns() {
        let store = store_with_table();
        let mut row = todo_row("a", "first", 1);
        row.insert("extra".into(), json!("x"));

        store.upsert("todo", &[row], true).unwrap();

        let saved = store.lookup("todo", "a").unwrap().unwrap();
        assert!(saved.get("extra").is_none());
        assert_eq!(saved.get("text"), Some(&json!("first")));
    }

    #[test]
    fn upsert_without_id_fails() {
        let store = store_with_table();
        let mut row = Row::new();
        row.insert("text".into(), json!("no id"));

        let result = store.upsert("todo", &[row], false);
        assert!(matches!(result, Err(StoreError::InvalidRowId { .. })));
    }

    #[test]
    fn read_applies_query() {
        let store = store_with_table();
        store
            .upsert(
                "todo",
                &[
                    todo_row("a", "first", 1),
                    todo_row("b", "second", 2),
                    todo_row("c", "third", 3),
                ],
                false,
            )
            .unwrap();

        let query = Query::table("todo")
            .filter(Filter::gt("rank", 1))
            .order_by("rank", QueryOrder::Descending);
        let rows = store.read(&query).unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("id"), Some(&json!("c")));
    }

    #[test]
    fn read_undefined_table_fails() {
        let store = MemoryLocalStore::new();
        let result = store.read(&Query::table("missing"));
        assert!(matches!(result, Err(StoreError::TableNotDefined { .. })));
    }

    #[test]
    fn delete_by_ids_and_query() {
        let store = store_with_table();
        store
            .upsert(
                "todo",
                &[
                    todo_row("a", "first", 1),
                    todo_row("b", "second", 2),
                    todo_row("c", "third", 3),
                ],
                false,
            )
            .unwrap();

        store.delete_ids("todo", &["a".into()]).unwrap();
        assert_eq!(store.row_count("todo"), 2);

        store
            .delete(&Query::table("todo").filter(Filter::gt("rank", 2)))
            .unwrap();
        assert_eq!(store.row_count("todo"), 1);
        assert!(store.lookup("todo", "b").unwrap().is_some());
    }

    #[test]
    fn redefining_table_keeps_rows() {
        let store = store_with_table();
        store
            .upsert("todo", &[todo_row("a", "first", 1)], false)
            .unwrap();

        store.define_table("todo", &todo_schema()).unwrap();
        assert_eq!(store.row_count("todo"), 1);
    }
}
