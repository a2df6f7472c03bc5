//! # rowsync store
//!
//! Local store contract and query model for the rowsync offline sync
//! engine.
//!
//! This crate provides:
//! - The [`LocalStore`] trait: durable key/row storage per table,
//!   addressed by string row id
//! - [`TableSchema`] / [`ColumnType`] for declaring tables
//! - A [`Query`] model shared by local reads and remote pulls
//! - [`MemoryLocalStore`], a thread-safe in-memory implementation
//!
//! Rows are JSON objects (`serde_json` maps). The sync engine in
//! `rowsync_engine` persists its own bookkeeping (operation log, error
//! records, incremental pull state) through the same [`LocalStore`]
//! contract the application data uses.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod query;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryLocalStore;
pub use query::{Filter, OrderBy, Query, QueryOrder};
pub use store::{ColumnType, LocalStore, TableSchema};

/// A row: a JSON object keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;
