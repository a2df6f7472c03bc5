//! The sync context: initialization, the push pipeline and pulls.

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::handler::{RemoteOperationExecutor, SyncHandler};
use crate::locks::{KeyedMutexGuard, KeyedMutexRegistry, KeyedReadGuard, KeyedRwLockRegistry};
use crate::op_error::{OperationErrorList, TableOperationError};
use crate::operations::{
    apply_local, collapse, item_key, TableOperation, TableOperationKind, BACKUP_TABLE,
};
use crate::pull::{IncrementalPullStrategy, OffsetPullStrategy, PullStrategy};
use crate::push::{PushCompletionResult, PushStatus};
use crate::queue::{Bookmark, EnqueueOutcome, OperationQueue};
use crate::remote::{RemoteError, RemoteService};
use crate::system;
use crate::table::SyncTable;
use parking_lot::{Condvar, Mutex, RwLock};
use rowsync_store::{ColumnType, LocalStore, Query, Row, TableSchema};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::{mpsc, Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// A store and handler pair published by a successful `initialize`.
///
/// Push requests capture a clone, so a running cycle keeps using the
/// collaborators it started with even while `initialize` swaps in new
/// ones (it drains the request queue first, so in practice none
/// survive the swap).
#[derive(Clone)]
struct Session {
    store: Arc<dyn LocalStore>,
    handler: Arc<dyn SyncHandler>,
    queue: Arc<OperationQueue>,
    errors: Arc<OperationErrorList>,
}

enum SessionState {
    Uninitialized,
    Failed(String),
    Ready(Session),
}

struct PushSyncRequest {
    bookmark: Bookmark,
    session: Session,
    done: mpsc::Sender<SyncResult<()>>,
}

#[derive(Default)]
struct PushState {
    fifo: VecDeque<PushSyncRequest>,
    busy: bool,
    consumer_started: bool,
}

struct ContextInner {
    remote: Arc<dyn RemoteService>,
    config: SyncConfig,
    /// Outermost lock tier: guards the store/handler swap.
    session: RwLock<SessionState>,
    /// Middle tier: shared for log use, exclusive for the push
    /// consumer's head peek.
    op_lock: RwLock<()>,
    /// Per-table shared/exclusive locks: pull and purge exclude a
    /// table's mutations, enqueue and push share it.
    table_locks: KeyedRwLockRegistry,
    /// Innermost tier: per-item exclusive locks serializing collapse
    /// plus the matching local-store write.
    item_locks: KeyedMutexRegistry,
    push_state: Mutex<PushState>,
    push_pending: Condvar,
    push_idle: Condvar,
}

/// Synchronizes a local replica with a remote data service.
///
/// One context owns the durable operation log, a single background
/// push consumer, and the pull path. Handles are cheap to clone and
/// share the same state.
///
/// Lock tiers are always acquired outermost to innermost: init lock,
/// op lock, table lock, item lock.
#[derive(Clone)]
pub struct SyncContext {
    inner: Arc<ContextInner>,
}

impl SyncContext {
    /// Creates an uninitialized context over a remote service with the
    /// default configuration.
    pub fn new(remote: Arc<dyn RemoteService>) -> Self {
        Self::with_config(remote, SyncConfig::default())
    }

    /// Creates an uninitialized context with an explicit configuration.
    pub fn with_config(remote: Arc<dyn RemoteService>, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                remote,
                config,
                session: RwLock::new(SessionState::Uninitialized),
                op_lock: RwLock::new(()),
                table_locks: KeyedRwLockRegistry::new(),
                item_locks: KeyedMutexRegistry::new(),
                push_state: Mutex::new(PushState::default()),
                push_pending: Condvar::new(),
                push_idle: Condvar::new(),
            }),
        }
    }

    /// Returns a handle to a synced table.
    pub fn table(&self, name: &str) -> SyncTable {
        SyncTable::new(self.clone(), name)
    }

    /// True once `initialize` has completed without error.
    pub fn is_initialized(&self) -> bool {
        matches!(*self.inner.session.read(), SessionState::Ready(_))
    }

    /// Initializes the context with a local store and sync handler.
    ///
    /// Waits for any queued push requests to drain, loads the
    /// operation log and error list from the store, and starts the
    /// push consumer (once, for the life of the context). A load
    /// failure leaves the context failed: every later call returns
    /// [`SyncError::NotInitialized`] until a retry succeeds.
    pub fn initialize(
        &self,
        store: Arc<dyn LocalStore>,
        handler: Arc<dyn SyncHandler>,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        let mut session = inner.session.write();
        // No cycle may keep references to the outgoing store/handler.
        inner.wait_push_idle();
        let _op_guard = inner.op_lock.write();

        match Self::load_session(store, handler) {
            Ok(new_session) => {
                *session = SessionState::Ready(new_session);
                self.ensure_consumer_started()?;
                info!("sync context initialized");
                Ok(())
            }
            Err(err) => {
                warn!(error = %err, "sync context initialization failed");
                *session = SessionState::Failed(err.to_string());
                Err(err)
            }
        }
    }

    /// Number of operations queued and not yet pushed.
    pub fn pending_operations(&self) -> SyncResult<usize> {
        let state = self.inner.session.read();
        let session = ensure_ready(&state)?;
        let _op_guard = self.inner.op_lock.read();
        Ok(session.queue.count_pending())
    }

    /// Recorded per-operation push failures awaiting resolution.
    pub fn operation_errors(&self) -> SyncResult<Vec<TableOperationError>> {
        let state = self.inner.session.read();
        let session = ensure_ready(&state)?;
        Ok(session.errors.all())
    }

    /// Pushes all operations queued at call time to the remote
    /// service.
    ///
    /// Concurrent callers are served by one consumer: each call gets
    /// its own completion, but at most one push executes remote
    /// operations at a time. Operations enqueued after this call
    /// starts wait for the next push.
    pub fn push(&self) -> SyncResult<()> {
        let receiver = {
            let state = self.inner.session.read();
            let session = ensure_ready(&state)?;
            self.inner.submit_push_request(session)
        };
        receiver
            .recv()
            .unwrap_or_else(|_| Err(consumer_terminated()))
    }

    /// Pulls a remote query's rows into the local store.
    ///
    /// With a `query_id` the pull is incremental and resumable: only
    /// rows changed since the persisted high-water mark are fetched.
    /// If the table has pending operations they are pushed first.
    pub fn pull(&self, table_name: &str, query: Option<Query>, query_id: Option<&str>) -> SyncResult<()> {
        let table_name = normalize_table_name(table_name);
        loop {
            let receiver = {
                let state = self.inner.session.read();
                let session = ensure_ready(&state)?;
                let _op_guard = self.inner.op_lock.read();
                let _table_guard = self.inner.table_locks.acquire_write(&table_name);

                if session.queue.count_pending_for_table(&table_name) > 0 {
                    // Local changes go out before the table is
                    // overwritten with remote rows.
                    Some(self.inner.submit_push_request(session))
                } else {
                    self.inner
                        .process_pull(session, &table_name, query.clone(), query_id)?;
                    None
                }
            };

            match receiver {
                Some(receiver) => {
                    receiver.recv().unwrap_or_else(|_| Err(consumer_terminated()))?;
                }
                None => return Ok(()),
            }
        }
    }

    /// Deletes local rows matching a query without queueing remote
    /// deletes. Fails while the table has pending operations.
    pub fn purge(&self, table_name: &str, query: Option<Query>) -> SyncResult<()> {
        let table_name = normalize_table_name(table_name);
        let state = self.inner.session.read();
        let session = ensure_ready(&state)?;
        let _op_guard = self.inner.op_lock.read();
        let _table_guard = self.inner.table_locks.acquire_write(&table_name);

        if session.queue.count_pending_for_table(&table_name) > 0 {
            return Err(SyncError::PurgePending { table_name });
        }

        let query = scoped_query(&table_name, query);
        session.store.delete(&query)?;
        Ok(())
    }

    pub(crate) fn insert(&self, table_name: &str, item_id: &str, item: Row) -> SyncResult<()> {
        self.enqueue_operation(TableOperationKind::Insert, table_name, item_id, Some(item))
    }

    pub(crate) fn update(&self, table_name: &str, item_id: &str, item: Row) -> SyncResult<()> {
        self.enqueue_operation(TableOperationKind::Update, table_name, item_id, Some(item))
    }

    pub(crate) fn delete(&self, table_name: &str, item_id: &str) -> SyncResult<()> {
        self.enqueue_operation(TableOperationKind::Delete, table_name, item_id, None)
    }

    pub(crate) fn read(&self, table_name: &str, query: Option<Query>) -> SyncResult<Vec<Row>> {
        let state = self.inner.session.read();
        let session = ensure_ready(&state)?;
        let query = scoped_query(table_name, query);
        Ok(session.store.read(&query)?)
    }

    pub(crate) fn lookup(&self, table_name: &str, item_id: &str) -> SyncResult<Option<Row>> {
        let state = self.inner.session.read();
        let session = ensure_ready(&state)?;
        Ok(session.store.lookup(table_name, item_id)?)
    }

    /// Applies a mutation to the local store and merges it into the
    /// operation log, atomically per item.
    fn enqueue_operation(
        &self,
        kind: TableOperationKind,
        table_name: &str,
        item_id: &str,
        item: Option<Row>,
    ) -> SyncResult<()> {
        let inner = &self.inner;
        let state = inner.session.read();
        let session = ensure_ready(&state)?;

        let _op_guard = inner.op_lock.read();
        let _table_guard = inner.table_locks.acquire_read(table_name);
        let key = item_key(table_name, item_id);
        let _item_guard = inner.item_locks.acquire(&key);

        let operation = TableOperation::new(kind, table_name, item_id);

        // Reject illegal transitions before touching the store, so a
        // failed enqueue leaves the local row untouched. The item lock
        // makes the check-then-enqueue race-free.
        if let Some(existing) = session.queue.pending_kind(&key) {
            collapse(existing, &operation)?;
        }

        apply_local(&operation, session.store.as_ref(), item.as_ref())?;

        if session.queue.enqueue(operation)? == EnqueueOutcome::Cancelled {
            // The entry never reached the server; its delete backup is
            // meaningless now.
            session.store.delete_ids(BACKUP_TABLE, &[key])?;
        }
        Ok(())
    }

    fn load_session(
        store: Arc<dyn LocalStore>,
        handler: Arc<dyn SyncHandler>,
    ) -> SyncResult<Session> {
        OperationQueue::initialize_store(store.as_ref())?;
        OperationErrorList::initialize_store(store.as_ref())?;
        IncrementalPullStrategy::initialize_store(store.as_ref())?;
        store.define_table(
            BACKUP_TABLE,
            &TableSchema::new()
                .column("id", ColumnType::String)
                .column("tablename", ColumnType::String)
                .column("itemid", ColumnType::String)
                .column("clientitem", ColumnType::Json),
        )?;
        store.initialize()?;

        let queue = Arc::new(OperationQueue::load(Arc::clone(&store))?);
        let errors = Arc::new(OperationErrorList::load(Arc::clone(&store))?);

        Ok(Session {
            store,
            handler,
            queue,
            errors,
        })
    }

    /// Starts the push consumer thread. Runs once per context; the
    /// thread holds only a weak handle so it winds down after the last
    /// context handle is dropped.
    fn ensure_consumer_started(&self) -> SyncResult<()> {
        let mut push = self.inner.push_state.lock();
        if push.consumer_started {
            return Ok(());
        }

        let weak = Arc::downgrade(&self.inner);
        std::thread::Builder::new()
            .name("rowsync-push".into())
            .spawn(move || ContextInner::consume_push_requests(weak))
            .map_err(|err| {
                SyncError::Internal(format!("failed to start push consumer: {err}"))
            })?;
        push.consumer_started = true;
        Ok(())
    }
}

/// One head operation with its table and item locks held.
struct LockedOperation<'a> {
    operation: TableOperation,
    _table_guard: KeyedReadGuard<'a>,
    _item_guard: KeyedMutexGuard<'a>,
}

enum StepOutcome {
    /// The operation ran; it leaves the log.
    Processed,
    /// The operation failed with a handled rejection; it leaves the
    /// log and the error sticks around for resolution.
    Recorded(Box<TableOperationError>),
    /// The cycle stops; this and later operations stay queued.
    Aborted(PushStatus),
}

impl ContextInner {
    fn submit_push_request(&self, session: &Session) -> mpsc::Receiver<SyncResult<()>> {
        let bookmark = session.queue.bookmark();
        let (done, receiver) = mpsc::channel();
        let mut push = self.push_state.lock();
        push.fifo.push_back(PushSyncRequest {
            bookmark,
            session: session.clone(),
            done,
        });
        self.push_pending.notify_one();
        receiver
    }

    fn wait_push_idle(&self) {
        let mut push = self.push_state.lock();
        while push.busy || !push.fifo.is_empty() {
            self.push_idle.wait(&mut push);
        }
    }

    /// The consumer loop: one thread serves every push request, so at
    /// most one push executes remote operations at a time.
    fn consume_push_requests(weak: Weak<ContextInner>) {
        loop {
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let request = {
                let mut push = inner.push_state.lock();
                match push.fifo.pop_front() {
                    Some(request) => {
                        push.busy = true;
                        Some(request)
                    }
                    None => {
                        // Bounded wait so the thread notices when the
                        // context goes away.
                        let _ = inner
                            .push_pending
                            .wait_for(&mut push, Duration::from_millis(100));
                        push.fifo.pop_front().map(|request| {
                            push.busy = true;
                            request
                        })
                    }
                }
            };

            if let Some(request) = request {
                let outcome = inner.run_push_cycle(&request);
                request.session.queue.unbookmark(&request.bookmark);
                let _ = request.done.send(outcome);

                let mut push = inner.push_state.lock();
                push.busy = false;
                if push.fifo.is_empty() {
                    inner.push_idle.notify_all();
                }
            }
        }
    }

    fn run_push_cycle(&self, request: &PushSyncRequest) -> SyncResult<()> {
        let session = &request.session;
        debug!("push cycle started");

        let mut result = match self.drain_bookmark(request) {
            Ok(status) => PushCompletionResult::new(status),
            Err(err) => {
                let status = match &err {
                    SyncError::Store(_) => PushStatus::CancelledByLocalStoreError,
                    _ => PushStatus::InternalError,
                };
                let mut result = PushCompletionResult::new(status);
                if status == PushStatus::InternalError {
                    result.internal_error = Some(err.to_string());
                }
                result
            }
        };

        result.operation_errors = session.errors.all();
        if let Err(err) = session.errors.clear() {
            warn!(error = %err, "failed to clear recorded operation errors");
        }

        debug!(
            status = %result.status,
            operation_errors = result.operation_errors.len(),
            "push cycle finished"
        );

        let status = result.status;
        session.handler.on_push_complete(&result)?;
        if status == PushStatus::Complete {
            Ok(())
        } else {
            Err(SyncError::PushFailed(Box::new(result)))
        }
    }

    /// Drains the bookmarked log head to tail.
    ///
    /// Failure policy: handled remote rejections are recorded and the
    /// drain continues; network, authentication and local-store
    /// failures abort it, leaving the remaining operations queued for
    /// the next push.
    fn drain_bookmark(&self, request: &PushSyncRequest) -> SyncResult<PushStatus> {
        loop {
            let Some(locked) = self.peek_and_lock(request)? else {
                return Ok(PushStatus::Complete);
            };

            match self.process_operation(&request.session, &locked.operation)? {
                StepOutcome::Processed => {
                    request.session.queue.dequeue_bookmarked(&request.bookmark)?;
                }
                StepOutcome::Recorded(error) => {
                    warn!(
                        table = %locked.operation.table_name,
                        item = %locked.operation.item_id,
                        status = ?error.status_code,
                        "operation rejected; recorded for later resolution"
                    );
                    request.session.errors.add(*error)?;
                    request.session.queue.dequeue_bookmarked(&request.bookmark)?;
                }
                StepOutcome::Aborted(status) => return Ok(status),
            }
        }
    }

    /// Peeks the next bookmarked operation and takes its table and
    /// item locks. Op lock is held exclusively for the short peek so
    /// enqueue collapsing cannot race the head.
    fn peek_and_lock(&self, request: &PushSyncRequest) -> SyncResult<Option<LockedOperation<'_>>> {
        let _op_guard = self.op_lock.write();

        let Some(operation) = request.session.queue.peek_bookmarked(&request.bookmark)? else {
            return Ok(None);
        };

        let table_guard = self.table_locks.acquire_read(&operation.table_name);
        let item_guard = self.item_locks.acquire(&operation.item_key());
        Ok(Some(LockedOperation {
            operation,
            _table_guard: table_guard,
            _item_guard: item_guard,
        }))
    }

    fn process_operation(
        &self,
        session: &Session,
        operation: &TableOperation,
    ) -> SyncResult<StepOutcome> {
        let item = self.lookup_with_backup(session, operation)?;
        let executor = RemoteOperationExecutor::new(self.remote.as_ref(), item.clone());

        match session.handler.execute_table_operation(&executor, operation) {
            Ok(result_row) => {
                if let Some(row) = result_row {
                    session
                        .store
                        .upsert(&operation.table_name, &[row], true)?;
                }
                self.clear_backup(session, operation)?;
                Ok(StepOutcome::Processed)
            }
            Err(SyncError::Remote(remote_err)) => match cancel_status(&remote_err) {
                Some(status) => Ok(StepOutcome::Aborted(status)),
                None => {
                    let error = TableOperationError::from_remote(operation, item, &remote_err);
                    self.clear_backup(session, operation)?;
                    Ok(StepOutcome::Recorded(Box::new(error)))
                }
            },
            Err(other) => Err(other),
        }
    }

    /// The item snapshot an operation sends: the live local row, or
    /// the backed-up row a queued delete preserved.
    fn lookup_with_backup(
        &self,
        session: &Session,
        operation: &TableOperation,
    ) -> SyncResult<Option<Row>> {
        if let Some(item) = session
            .store
            .lookup(&operation.table_name, &operation.item_id)?
        {
            return Ok(Some(item));
        }

        let backup = session.store.lookup(BACKUP_TABLE, &operation.item_key())?;
        Ok(backup.and_then(|b| b.get("clientitem").and_then(Value::as_object).cloned()))
    }

    fn clear_backup(&self, session: &Session, operation: &TableOperation) -> SyncResult<()> {
        session
            .store
            .delete_ids(BACKUP_TABLE, &[operation.item_key()])?;
        Ok(())
    }

    fn process_pull(
        &self,
        session: &Session,
        table_name: &str,
        query: Option<Query>,
        query_id: Option<&str>,
    ) -> SyncResult<()> {
        let query = scoped_query(table_name, query);
        let mut strategy: Box<dyn PullStrategy> = match query_id {
            Some(query_id) => Box::new(IncrementalPullStrategy::new(
                query,
                query_id,
                Arc::clone(&session.store),
                self.config.page_size,
            )),
            None => Box::new(OffsetPullStrategy::new(query, self.config.page_size)),
        };
        strategy.initialize()?;

        let mut total = 0usize;
        loop {
            let rows = self.remote.read(table_name, strategy.query())?;
            total += rows.len();
            self.process_pulled_rows(session, table_name, &rows)?;
            strategy.on_results_processed(&rows)?;
            if !strategy.move_to_next_page(rows.len())? {
                break;
            }
        }

        debug!(table = table_name, rows = total, "pull finished");
        Ok(())
    }

    /// Writes one pulled page into the local store: soft-deleted rows
    /// become local deletes, the rest upsert as server data.
    fn process_pulled_rows(
        &self,
        session: &Session,
        table_name: &str,
        rows: &[Row],
    ) -> SyncResult<()> {
        let mut deleted = Vec::new();
        let mut updated = Vec::new();

        for row in rows {
            let Some(id) = system::item_id(row) else {
                continue;
            };
            if system::is_deleted(row) {
                deleted.push(id.to_string());
            } else {
                updated.push(row.clone());
            }
        }

        if !deleted.is_empty() {
            session.store.delete_ids(table_name, &deleted)?;
        }
        if !updated.is_empty() {
            session.store.upsert(table_name, &updated, true)?;
        }
        Ok(())
    }
}

fn ensure_ready(state: &SessionState) -> SyncResult<&Session> {
    match state {
        SessionState::Ready(session) => Ok(session),
        SessionState::Uninitialized | SessionState::Failed(_) => Err(SyncError::NotInitialized),
    }
}

fn cancel_status(error: &RemoteError) -> Option<PushStatus> {
    match error {
        RemoteError::Network(_) => Some(PushStatus::CancelledByNetworkError),
        RemoteError::Status { code: 401, .. } => Some(PushStatus::CancelledByAuthenticationError),
        RemoteError::Status { .. } => None,
    }
}

fn consumer_terminated() -> SyncError {
    SyncError::Internal("push consumer terminated unexpectedly".into())
}

/// Lowercases and trims a table name; lookups and locks key on the
/// normalized form.
pub(crate) fn normalize_table_name(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Clamps a caller query onto the given table.
fn scoped_query(table_name: &str, query: Option<Query>) -> Query {
    match query {
        Some(mut query) => {
            query.table_name = table_name.to_string();
            query
        }
        None => Query::table(table_name),
    }
}
