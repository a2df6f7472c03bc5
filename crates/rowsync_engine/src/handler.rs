//! The sync handler extension point.

use crate::error::{SyncError, SyncResult};
use crate::operations::{execute_remote, TableOperation};
use crate::push::PushCompletionResult;
use crate::remote::RemoteService;
use rowsync_store::Row;

/// Executes one queued operation against the remote service.
///
/// Handed to [`SyncHandler::execute_table_operation`] so a handler can
/// inspect the item, run the operation, and post-process the outcome
/// (retry with a merged row, swallow a conflict, and so on).
pub struct RemoteOperationExecutor<'a> {
    remote: &'a dyn RemoteService,
    item: Option<Row>,
}

impl<'a> RemoteOperationExecutor<'a> {
    pub(crate) fn new(remote: &'a dyn RemoteService, item: Option<Row>) -> Self {
        Self { remote, item }
    }

    /// The item snapshot the operation will send: the current local
    /// row, or the backed-up row for deletes.
    pub fn item(&self) -> Option<&Row> {
        self.item.as_ref()
    }

    /// Runs the operation against the remote service with the captured
    /// item snapshot.
    pub fn execute(&self, operation: &TableOperation) -> SyncResult<Option<Row>> {
        execute_remote(operation, self.remote, self.item.as_ref())
    }

    /// Runs the operation with a caller-supplied item instead of the
    /// captured snapshot. Useful for conflict handlers that merge the
    /// server's copy before retrying.
    pub fn execute_with_item(
        &self,
        operation: &TableOperation,
        item: &Row,
    ) -> SyncResult<Option<Row>> {
        execute_remote(operation, self.remote, Some(item))
    }
}

/// Application hook into the push pipeline.
///
/// This is the only supported conflict-resolution extension point: the
/// handler sits between the operation log and the remote service, and
/// gets the aggregate result before `push()` returns.
pub trait SyncHandler: Send + Sync {
    /// Executes one queued operation. The returned row, if any, is
    /// written back to the local store as server data.
    ///
    /// The default forwards to [`RemoteOperationExecutor::execute`].
    fn execute_table_operation(
        &self,
        executor: &RemoteOperationExecutor<'_>,
        operation: &TableOperation,
    ) -> SyncResult<Option<Row>> {
        executor.execute(operation)
    }

    /// Inspects the completed push cycle. Returning an error fails the
    /// overall `push()` even when the cycle itself completed.
    ///
    /// The default rejects any cycle that recorded operation errors.
    fn on_push_complete(&self, result: &PushCompletionResult) -> SyncResult<()> {
        if result.operation_errors.is_empty() {
            Ok(())
        } else {
            Err(SyncError::PushFailed(Box::new(result.clone())))
        }
    }
}

/// The stock handler: operations run unmodified and a push with any
/// recorded operation errors fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSyncHandler;

impl SyncHandler for DefaultSyncHandler {}
