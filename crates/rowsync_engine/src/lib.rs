//! # rowsync engine
//!
//! Offline synchronization core for tabular data.
//!
//! This crate provides:
//! - A durable, per-item-collapsed operation log of pending mutations
//! - A single-flight push pipeline with per-item locking
//! - Resumable incremental pull with keyset pagination on
//!   `(updatedAt, id)`
//! - Reference-counted keyed lock registries
//! - A pluggable sync handler for conflict resolution
//!
//! ## Architecture
//!
//! Application mutations go through [`SyncTable`] handles: each write
//! updates the local store and merges an operation into the log,
//! atomically per item. [`SyncContext::push`] drains the log through a
//! single background consumer against the [`RemoteService`];
//! [`SyncContext::pull`] pages remote queries straight into the local
//! store, independent of the log.
//!
//! ## Key invariants
//!
//! - At most one pending operation per `(table, item)` at any time
//! - At most one push executes remote operations at a time
//! - A push cycle processes exactly the operations queued when it was
//!   requested
//! - Per-item ordering is total; cross-item ordering is the log's FIFO

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod context;
mod error;
mod handler;
mod locks;
mod op_error;
mod operations;
mod pull;
mod push;
mod queue;
mod remote;
mod system;
mod table;

pub use config::SyncConfig;
pub use context::SyncContext;
pub use error::{SyncError, SyncResult};
pub use handler::{DefaultSyncHandler, RemoteOperationExecutor, SyncHandler};
pub use locks::{
    KeyedMutexGuard, KeyedMutexRegistry, KeyedReadGuard, KeyedRwLockRegistry, KeyedWriteGuard,
};
pub use op_error::{OperationErrorList, TableOperationError};
pub use operations::{collapse, Collapse, TableOperation, TableOperationKind};
pub use pull::{IncrementalPullStrategy, OffsetPullStrategy, PullCursor, PullStrategy};
pub use push::{PushCompletionResult, PushStatus};
pub use queue::{Bookmark, EnqueueOutcome, OperationQueue};
pub use remote::{MockRemoteService, RemoteError, RemoteResult, RemoteService};
pub use table::SyncTable;

/// Server-managed system column names and row helpers.
pub mod columns {
    pub use crate::system::{
        format_timestamp, is_deleted, item_id, parse_timestamp, strip_system_columns, CREATED_AT,
        DELETED, ID, UPDATED_AT, VERSION,
    };
}
