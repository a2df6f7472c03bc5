//! Pull strategies: offset paging and resumable incremental pull.

use crate::error::{SyncError, SyncResult};
use crate::system;
use chrono::{DateTime, Utc};
use rowsync_store::{
    ColumnType, Filter, LocalStore, Query, QueryOrder, Row, StoreResult, TableSchema,
};
use serde_json::Value;
use std::sync::Arc;

/// Table that persists incremental pull state per `(table, query id)`.
pub(crate) const INCREMENTAL_STATE_TABLE: &str = "__incremental_pull_state";

/// Position within one bounded page-scan of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullCursor {
    /// Skip the caller asked for before the scan started.
    pub initial_skip: u32,
    /// Rows consumed so far.
    pub total_read: u32,
    /// Rows still wanted; 0 marks completion.
    pub remaining: u32,
}

impl PullCursor {
    /// Returns true once the row budget is exhausted.
    pub fn complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Pages a remote query into the local store.
///
/// The sync context drives the strategy: execute `query()`, hand the
/// rows to `on_results_processed`, then ask `move_to_next_page` whether
/// to continue.
pub trait PullStrategy {
    /// Prepares the first page's query.
    fn initialize(&mut self) -> SyncResult<()>;

    /// The query for the current page.
    fn query(&self) -> &Query;

    /// Accounts for a processed page of rows.
    fn on_results_processed(&mut self, rows: &[Row]) -> SyncResult<()>;

    /// Advances to the next page. Returns false when the scan is done.
    fn move_to_next_page(&mut self, last_page_count: usize) -> SyncResult<bool>;
}

/// Plain top/skip pagination.
///
/// The page size is clamped to the configured maximum, and a
/// deterministic `id` ascending order is forced when the caller gave
/// none — skip/top paging is only stable under a total order.
pub struct OffsetPullStrategy {
    query: Query,
    cursor: PullCursor,
    page_size: u32,
}

impl OffsetPullStrategy {
    /// Creates a strategy over the caller's query.
    pub fn new(query: Query, max_page_size: u32) -> Self {
        Self {
            query,
            cursor: PullCursor {
                initial_skip: 0,
                total_read: 0,
                remaining: 0,
            },
            page_size: max_page_size,
        }
    }
}

impl PullStrategy for OffsetPullStrategy {
    fn initialize(&mut self) -> SyncResult<()> {
        let requested_total = self.query.top.unwrap_or(u32::MAX);
        self.cursor = PullCursor {
            initial_skip: self.query.skip.unwrap_or(0),
            total_read: 0,
            remaining: requested_total,
        };
        self.page_size = self.page_size.min(requested_total);
        self.query.top = Some(self.page_size);

        if self.query.order.is_empty() {
            self.query = self
                .query
                .clone()
                .order_by(system::ID, QueryOrder::Ascending);
        }
        Ok(())
    }

    fn query(&self) -> &Query {
        &self.query
    }

    fn on_results_processed(&mut self, rows: &[Row]) -> SyncResult<()> {
        let count = rows.len() as u32;
        self.cursor.total_read += count;
        self.cursor.remaining = self.cursor.remaining.saturating_sub(count);
        Ok(())
    }

    fn move_to_next_page(&mut self, last_page_count: usize) -> SyncResult<bool> {
        let requested = self.query.top.unwrap_or(self.page_size);
        if self.cursor.complete() || (last_page_count as u32) < requested {
            return Ok(false);
        }

        self.query.skip = Some(self.cursor.initial_skip + self.cursor.total_read);
        self.query.top = Some(self.page_size.min(self.cursor.remaining));
        Ok(true)
    }
}

/// Resumable pull using keyset pagination on `(updatedAt, id)`.
///
/// Instead of OFFSET continuation, each page filters on
/// `updatedAt > delta OR (updatedAt = delta AND id > lastId)`. The id
/// tie-break matters: several rows can share a timestamp at the
/// granularity the server stores, and a plain `> delta` filter would
/// skip such rows across page boundaries. The high-water mark persists
/// after every page, so a pull interrupted mid-scan resumes from the
/// same logical position after a process restart.
pub struct IncrementalPullStrategy {
    store: Arc<dyn LocalStore>,
    state_key: String,
    original: Query,
    query: Query,
    page_size: u32,
    delta_token: Option<DateTime<Utc>>,
    last_element_id: Option<String>,
    max_updated_at: Option<DateTime<Utc>>,
    max_element_id: Option<String>,
}

impl IncrementalPullStrategy {
    /// Declares the incremental state table on the local store.
    pub(crate) fn initialize_store(store: &dyn LocalStore) -> StoreResult<()> {
        store.define_table(
            INCREMENTAL_STATE_TABLE,
            &TableSchema::new()
                .column("id", ColumnType::String)
                .column("maxupdatedat", ColumnType::DateTime)
                .column("lastelementid", ColumnType::String),
        )
    }

    /// Creates a strategy for the given query id.
    pub fn new(
        query: Query,
        query_id: &str,
        store: Arc<dyn LocalStore>,
        max_page_size: u32,
    ) -> Self {
        let state_key = format!("{}_{}", query.table_name, query_id);
        Self {
            store,
            state_key,
            original: query.clone(),
            query,
            page_size: max_page_size,
            delta_token: None,
            last_element_id: None,
            max_updated_at: None,
            max_element_id: None,
        }
    }

    fn rebuild_query(&mut self) {
        let mut query = Query::table(self.original.table_name.clone())
            .top(self.page_size)
            .include_deleted(true)
            .order_by(system::UPDATED_AT, QueryOrder::Ascending)
            .order_by(system::ID, QueryOrder::Ascending);

        let keyset = self.delta_token.map(|delta| {
            let delta_text = system::format_timestamp(delta);
            let past_delta = Filter::gt(system::UPDATED_AT, delta_text.clone());
            match &self.last_element_id {
                Some(last_id) => past_delta.or(Filter::eq(system::UPDATED_AT, delta_text)
                    .and(Filter::gt(system::ID, last_id.clone()))),
                None => past_delta,
            }
        });

        query.filter = match (self.original.filter.clone(), keyset) {
            (Some(user), Some(keyset)) => Some(user.and(keyset)),
            (Some(user), None) => Some(user),
            (None, keyset) => keyset,
        };

        self.query = query;
    }

    fn persist_state(&self) -> SyncResult<()> {
        let (Some(max_updated_at), Some(max_element_id)) =
            (self.max_updated_at, &self.max_element_id)
        else {
            return Ok(());
        };

        let mut row = Row::new();
        row.insert("id".into(), Value::String(self.state_key.clone()));
        row.insert(
            "maxupdatedat".into(),
            Value::String(system::format_timestamp(max_updated_at)),
        );
        row.insert(
            "lastelementid".into(),
            Value::String(max_element_id.clone()),
        );
        self.store
            .upsert(INCREMENTAL_STATE_TABLE, &[row], false)?;
        Ok(())
    }
}

impl PullStrategy for IncrementalPullStrategy {
    fn initialize(&mut self) -> SyncResult<()> {
        if let Some(state) = self.store.lookup(INCREMENTAL_STATE_TABLE, &self.state_key)? {
            let max_updated_at = state
                .get("maxupdatedat")
                .and_then(Value::as_str)
                .and_then(system::parse_timestamp)
                .ok_or_else(|| {
                    SyncError::invalid_record("incremental pull state has malformed maxupdatedat")
                })?;
            self.delta_token = Some(max_updated_at);
            self.max_updated_at = Some(max_updated_at);
            self.last_element_id = state
                .get("lastelementid")
                .and_then(Value::as_str)
                .map(str::to_string);
            self.max_element_id = self.last_element_id.clone();
        }

        self.rebuild_query();
        Ok(())
    }

    fn query(&self) -> &Query {
        &self.query
    }

    fn on_results_processed(&mut self, rows: &[Row]) -> SyncResult<()> {
        let Some(last) = rows.last() else {
            return Ok(());
        };

        let updated_at = last
            .get(system::UPDATED_AT)
            .and_then(Value::as_str)
            .and_then(system::parse_timestamp)
            .ok_or_else(|| {
                SyncError::invalid_record("pulled row is missing a parsable __updatedAt")
            })?;
        let element_id = system::item_id(last)
            .ok_or_else(|| SyncError::invalid_record("pulled row is missing its id"))?
            .to_string();

        self.max_updated_at = Some(updated_at);
        self.max_element_id = Some(element_id);
        self.persist_state()
    }

    fn move_to_next_page(&mut self, last_page_count: usize) -> SyncResult<bool> {
        // A short page means the keyset window is drained.
        if (last_page_count as u32) < self.page_size {
            return Ok(false);
        }

        // The boundary must advance, or the same page would repeat
        // forever.
        if self.max_updated_at == self.delta_token && self.max_element_id == self.last_element_id {
            return Ok(false);
        }

        self.delta_token = self.max_updated_at;
        self.last_element_id = self.max_element_id.clone();
        self.rebuild_query();
        Ok(true)
    }
}
