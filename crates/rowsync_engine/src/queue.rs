//! The durable operation log.

use crate::error::{SyncError, SyncResult};
use crate::operations::{collapse, Collapse, TableOperation, TableOperationKind};
use parking_lot::RwLock;
use rowsync_store::{ColumnType, LocalStore, Query, QueryOrder, StoreResult, TableSchema};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Table that persists the operation log.
pub(crate) const OPERATIONS_TABLE: &str = "__operations";

struct QueueItem {
    operation: TableOperation,
    cancelled: bool,
}

struct BookmarkSlot {
    id: u64,
    cancelled: bool,
}

struct QueueInner {
    items: VecDeque<QueueItem>,
    /// Item key to live operation sequence. Holds the log invariant:
    /// at most one pending operation per `(table, item)`.
    by_key: HashMap<String, u64>,
    table_counts: HashMap<String, usize>,
    bookmarks: VecDeque<BookmarkSlot>,
    next_sequence: u64,
    next_bookmark: u64,
}

/// A marker over the operation log bounding one push cycle.
///
/// Operations enqueued after the bookmark was taken are out of scope
/// for the cycle it belongs to.
#[derive(Debug)]
pub struct Bookmark {
    id: u64,
    sequence_bound: u64,
}

/// Ordered, per-item-collapsed record of pending mutations, persisted
/// through the local store.
///
/// The queue is internally synchronized; the sync context layers its
/// own lock tiers (init, op, table, item) on top.
pub struct OperationQueue {
    store: Arc<dyn LocalStore>,
    inner: RwLock<QueueInner>,
}

/// What happened to a newly enqueued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The operation was queued (fresh entry, or it replaced a
    /// collapsed one at the tail).
    Enqueued,
    /// The operation was absorbed into the existing entry for the
    /// item.
    Collapsed,
    /// The operation cancelled the existing entry out; nothing remains
    /// queued for the item.
    Cancelled,
}

impl OperationQueue {
    /// Declares the operations table on the local store.
    pub(crate) fn initialize_store(store: &dyn LocalStore) -> StoreResult<()> {
        store.define_table(
            OPERATIONS_TABLE,
            &TableSchema::new()
                .column("id", ColumnType::String)
                .column("kind", ColumnType::Integer)
                .column("tablename", ColumnType::String)
                .column("itemid", ColumnType::String)
                .column("__createdat", ColumnType::DateTime)
                .column("sequence", ColumnType::Integer),
        )
    }

    /// Loads the queue from the local store, restoring enqueue order
    /// and resuming the sequence counter.
    pub fn load(store: Arc<dyn LocalStore>) -> SyncResult<Self> {
        let rows = store.read(
            &Query::table(OPERATIONS_TABLE).order_by("sequence", QueryOrder::Ascending),
        )?;

        let mut inner = QueueInner {
            items: VecDeque::new(),
            by_key: HashMap::new(),
            table_counts: HashMap::new(),
            bookmarks: VecDeque::new(),
            next_sequence: 0,
            next_bookmark: 0,
        };

        for row in &rows {
            let operation = TableOperation::from_row(row)?;
            inner.next_sequence = inner.next_sequence.max(operation.sequence + 1);
            inner.by_key.insert(operation.item_key(), operation.sequence);
            *inner
                .table_counts
                .entry(operation.table_name.clone())
                .or_insert(0) += 1;
            inner.items.push_back(QueueItem {
                operation,
                cancelled: false,
            });
        }

        Ok(Self {
            store,
            inner: RwLock::new(inner),
        })
    }

    /// Merges a new operation into the log per the collapse table.
    ///
    /// Illegal transitions (duplicate insert, insert over a pending
    /// update, anything over a pending delete) fail without touching
    /// the log. The caller holds the item's exclusive lock, so the
    /// check-then-mutate here is race-free.
    pub fn enqueue(&self, operation: TableOperation) -> SyncResult<EnqueueOutcome> {
        let key = operation.item_key();
        let mut inner = self.inner.write();

        let existing = inner.by_key.get(&key).copied();
        match existing {
            None => {
                self.enqueue_item(&mut inner, operation)?;
                Ok(EnqueueOutcome::Enqueued)
            }
            Some(sequence) => {
                let existing_kind = find_kind(&inner, sequence).ok_or_else(|| {
                    SyncError::Internal("operation log key map out of sync".into())
                })?;

                match collapse(existing_kind, &operation)? {
                    Collapse::KeepExisting => Ok(EnqueueOutcome::Collapsed),
                    Collapse::ReplaceWithIncoming => {
                        self.cancel_item(&mut inner, &key, sequence)?;
                        self.enqueue_item(&mut inner, operation)?;
                        Ok(EnqueueOutcome::Enqueued)
                    }
                    Collapse::CancelBoth => {
                        self.cancel_item(&mut inner, &key, sequence)?;
                        Ok(EnqueueOutcome::Cancelled)
                    }
                }
            }
        }
    }

    /// Returns the kind of the pending operation for an item key, if
    /// one is queued.
    pub fn pending_kind(&self, key: &str) -> Option<TableOperationKind> {
        let inner = self.inner.read();
        inner
            .by_key
            .get(key)
            .copied()
            .and_then(|sequence| find_kind(&inner, sequence))
    }

    /// Number of pending operations.
    pub fn count_pending(&self) -> usize {
        self.inner.read().by_key.len()
    }

    /// Number of pending operations for one table.
    pub fn count_pending_for_table(&self, table_name: &str) -> usize {
        self.inner
            .read()
            .table_counts
            .get(table_name)
            .copied()
            .unwrap_or(0)
    }

    /// Takes a bookmark over the current log. Operations enqueued
    /// later are outside the bookmark's scope.
    pub fn bookmark(&self) -> Bookmark {
        let mut inner = self.inner.write();
        let id = inner.next_bookmark;
        inner.next_bookmark += 1;
        let sequence_bound = inner.next_sequence;
        inner.bookmarks.push_back(BookmarkSlot {
            id,
            cancelled: false,
        });
        Bookmark { id, sequence_bound }
    }

    /// Releases a bookmark once its cycle has finished.
    pub fn unbookmark(&self, bookmark: &Bookmark) {
        let mut inner = self.inner.write();
        if let Some(slot) = inner.bookmarks.iter_mut().find(|s| s.id == bookmark.id) {
            slot.cancelled = true;
        }
        while inner
            .bookmarks
            .front()
            .map(|s| s.cancelled)
            .unwrap_or(false)
        {
            inner.bookmarks.pop_front();
        }
    }

    /// Peeks the next operation within the bookmark's scope.
    pub fn peek_bookmarked(&self, bookmark: &Bookmark) -> SyncResult<Option<TableOperation>> {
        let inner = self.inner.read();
        Self::ensure_current_bookmark(&inner, bookmark)?;
        Ok(Self::head_in_scope(&inner, bookmark).cloned())
    }

    /// Dequeues the next operation within the bookmark's scope,
    /// removing it from the log and the store.
    pub fn dequeue_bookmarked(&self, bookmark: &Bookmark) -> SyncResult<Option<TableOperation>> {
        let mut inner = self.inner.write();
        Self::ensure_current_bookmark(&inner, bookmark)?;

        let Some(operation) = Self::head_in_scope(&inner, bookmark).cloned() else {
            return Ok(None);
        };

        self.store
            .delete_ids(OPERATIONS_TABLE, &[operation.id.clone()])?;

        inner.by_key.remove(&operation.item_key());
        decrement_table_count(&mut inner, &operation.table_name);
        // Drop the head along with any cancelled entries behind it.
        inner.items.pop_front();
        while inner.items.front().map(|i| i.cancelled).unwrap_or(false) {
            inner.items.pop_front();
        }

        Ok(Some(operation))
    }

    fn ensure_current_bookmark(inner: &QueueInner, bookmark: &Bookmark) -> SyncResult<()> {
        match inner.bookmarks.front() {
            Some(slot) if slot.id == bookmark.id && !slot.cancelled => Ok(()),
            Some(_) => Err(SyncError::Internal(
                "another bookmark is pending ahead of this one".into(),
            )),
            None => Err(SyncError::Internal("bookmark has been released".into())),
        }
    }

    fn head_in_scope<'a>(
        inner: &'a QueueInner,
        bookmark: &Bookmark,
    ) -> Option<&'a TableOperation> {
        inner
            .items
            .iter()
            .find(|item| !item.cancelled)
            .map(|item| &item.operation)
            .filter(|op| op.sequence < bookmark.sequence_bound)
    }

    fn enqueue_item(&self, inner: &mut QueueInner, mut operation: TableOperation) -> SyncResult<()> {
        operation.sequence = inner.next_sequence;
        inner.next_sequence += 1;

        self.store
            .upsert(OPERATIONS_TABLE, &[operation.to_row()], false)?;

        inner
            .by_key
            .insert(operation.item_key(), operation.sequence);
        *inner
            .table_counts
            .entry(operation.table_name.clone())
            .or_insert(0) += 1;
        inner.items.push_back(QueueItem {
            operation,
            cancelled: false,
        });
        Ok(())
    }

    fn cancel_item(&self, inner: &mut QueueInner, key: &str, sequence: u64) -> SyncResult<()> {
        let Some(item) = inner
            .items
            .iter_mut()
            .find(|i| !i.cancelled && i.operation.sequence == sequence)
        else {
            return Err(SyncError::Internal(
                "operation log key map out of sync".into(),
            ));
        };

        let operation_id = item.operation.id.clone();
        let table_name = item.operation.table_name.clone();
        item.cancelled = true;

        self.store.delete_ids(OPERATIONS_TABLE, &[operation_id])?;

        inner.by_key.remove(key);
        decrement_table_count(inner, &table_name);
        while inner.items.front().map(|i| i.cancelled).unwrap_or(false) {
            inner.items.pop_front();
        }
        Ok(())
    }
}

fn find_kind(inner: &QueueInner, sequence: u64) -> Option<TableOperationKind> {
    inner
        .items
        .iter()
        .find(|i| !i.cancelled && i.operation.sequence == sequence)
        .map(|i| i.operation.kind)
}

fn decrement_table_count(inner: &mut QueueInner, table_name: &str) {
    if let Some(count) = inner.table_counts.get_mut(table_name) {
        if *count > 1 {
            *count -= 1;
        } else {
            inner.table_counts.remove(table_name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_store::MemoryLocalStore;

    fn new_queue() -> OperationQueue {
        let store = Arc::new(MemoryLocalStore::new());
        OperationQueue::initialize_store(store.as_ref()).unwrap();
        OperationQueue::load(store).unwrap()
    }

    fn op(kind: TableOperationKind, item_id: &str) -> TableOperation {
        TableOperation::new(kind, "todo", item_id)
    }

    #[test]
    fn enqueue_assigns_increasing_sequences() {
        let queue = new_queue();
        queue.enqueue(op(TableOperationKind::Insert, "a")).unwrap();
        queue.enqueue(op(TableOperationKind::Insert, "b")).unwrap();

        let bookmark = queue.bookmark();
        let first = queue.peek_bookmarked(&bookmark).unwrap().unwrap();
        assert_eq!(first.item_id, "a");
        assert_eq!(first.sequence, 0);
        assert_eq!(queue.count_pending(), 2);
        queue.unbookmark(&bookmark);
    }

    #[test]
    fn insert_then_update_keeps_single_insert_entry() {
        let queue = new_queue();
        queue.enqueue(op(TableOperationKind::Insert, "a")).unwrap();
        let outcome = queue.enqueue(op(TableOperationKind::Update, "a")).unwrap();

        assert_eq!(outcome, EnqueueOutcome::Collapsed);
        assert_eq!(queue.count_pending(), 1);
        assert_eq!(
            queue.pending_kind("todo/a"),
            Some(TableOperationKind::Insert)
        );
    }

    #[test]
    fn insert_then_delete_cancels_out() {
        let queue = new_queue();
        queue.enqueue(op(TableOperationKind::Insert, "a")).unwrap();
        let outcome = queue.enqueue(op(TableOperationKind::Delete, "a")).unwrap();

        assert_eq!(outcome, EnqueueOutcome::Cancelled);
        assert_eq!(queue.count_pending(), 0);
        assert_eq!(queue.pending_kind("todo/a"), None);
    }

    #[test]
    fn update_then_delete_replaces_entry() {
        let queue = new_queue();
        queue.enqueue(op(TableOperationKind::Update, "a")).unwrap();
        let outcome = queue.enqueue(op(TableOperationKind::Delete, "a")).unwrap();

        assert_eq!(outcome, EnqueueOutcome::Enqueued);
        assert_eq!(queue.count_pending(), 1);
        assert_eq!(
            queue.pending_kind("todo/a"),
            Some(TableOperationKind::Delete)
        );
    }

    #[test]
    fn illegal_transitions_fail_and_leave_log_unchanged() {
        let queue = new_queue();
        queue.enqueue(op(TableOperationKind::Insert, "a")).unwrap();

        let result = queue.enqueue(op(TableOperationKind::Insert, "a"));
        assert!(matches!(result, Err(SyncError::DuplicateInsert { .. })));
        assert_eq!(queue.count_pending(), 1);
        assert_eq!(
            queue.pending_kind("todo/a"),
            Some(TableOperationKind::Insert)
        );
    }

    #[test]
    fn per_table_counts_track_live_entries() {
        let queue = new_queue();
        queue.enqueue(op(TableOperationKind::Insert, "a")).unwrap();
        queue.enqueue(op(TableOperationKind::Insert, "b")).unwrap();
        queue
            .enqueue(TableOperation::new(TableOperationKind::Insert, "notes", "n"))
            .unwrap();

        assert_eq!(queue.count_pending_for_table("todo"), 2);
        assert_eq!(queue.count_pending_for_table("notes"), 1);

        queue.enqueue(op(TableOperationKind::Delete, "a")).unwrap();
        assert_eq!(queue.count_pending_for_table("todo"), 1);
    }

    #[test]
    fn bookmark_excludes_later_operations() {
        let queue = new_queue();
        queue.enqueue(op(TableOperationKind::Insert, "a")).unwrap();

        let bookmark = queue.bookmark();
        queue.enqueue(op(TableOperationKind::Insert, "b")).unwrap();

        let first = queue.dequeue_bookmarked(&bookmark).unwrap();
        assert_eq!(first.unwrap().item_id, "a");
        // "b" was enqueued after the bookmark; it waits for the next
        // cycle.
        assert!(queue.peek_bookmarked(&bookmark).unwrap().is_none());
        assert_eq!(queue.count_pending(), 1);
        queue.unbookmark(&bookmark);
    }

    #[test]
    fn only_current_bookmark_may_drain() {
        let queue = new_queue();
        queue.enqueue(op(TableOperationKind::Insert, "a")).unwrap();

        let first = queue.bookmark();
        let second = queue.bookmark();

        assert!(queue.peek_bookmarked(&second).is_err());
        assert!(queue.peek_bookmarked(&first).is_ok());

        queue.unbookmark(&first);
        assert!(queue.peek_bookmarked(&second).is_ok());
        queue.unbookmark(&second);
    }

    #[test]
    fn dequeue_removes_from_store() {
        let store = Arc::new(MemoryLocalStore::new());
        OperationQueue::initialize_store(store.as_ref()).unwrap();
        let queue = OperationQueue::load(store.clone() as Arc<dyn LocalStore>).unwrap();

        queue.enqueue(op(TableOperationKind::Insert, "a")).unwrap();
        assert_eq!(store.row_count(OPERATIONS_TABLE), 1);

        let bookmark = queue.bookmark();
        queue.dequeue_bookmarked(&bookmark).unwrap();
        queue.unbookmark(&bookmark);

        assert_eq!(store.row_count(OPERATIONS_TABLE), 0);
        assert_eq!(queue.count_pending(), 0);
    }

    #[test]
    fn load_restores_order_and_sequence() {
        let store = Arc::new(MemoryLocalStore::new());
        OperationQueue::initialize_store(store.as_ref()).unwrap();

        {
            let queue = OperationQueue::load(store.clone() as Arc<dyn LocalStore>).unwrap();
            queue.enqueue(op(TableOperationKind::Insert, "a")).unwrap();
            queue.enqueue(op(TableOperationKind::Update, "b")).unwrap();
        }

        let reloaded = OperationQueue::load(store.clone() as Arc<dyn LocalStore>).unwrap();
        assert_eq!(reloaded.count_pending(), 2);

        // New operations continue the persisted sequence.
        reloaded
            .enqueue(op(TableOperationKind::Insert, "c"))
            .unwrap();
        let bookmark = reloaded.bookmark();
        let mut sequences = Vec::new();
        while let Some(op) = reloaded.dequeue_bookmarked(&bookmark).unwrap() {
            sequences.push((op.item_id.clone(), op.sequence));
        }
        reloaded.unbookmark(&bookmark);

        assert_eq!(sequences[0].0, "a");
        assert_eq!(sequences[1].0, "b");
        assert_eq!(sequences[2].0, "c");
        assert!(sequences[2].1 > sequences[1].1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn kind_strategy() -> impl Strategy<Value = TableOperationKind> {
            prop_oneof![
                Just(TableOperationKind::Insert),
                Just(TableOperationKind::Update),
                Just(TableOperationKind::Delete),
            ]
        }

        // Reference model of the collapse table for a single item.
        fn model_step(
            state: Option<TableOperationKind>,
            incoming: TableOperationKind,
        ) -> Result<Option<TableOperationKind>, ()> {
            use TableOperationKind::{Delete, Insert, Update};
            match (state, incoming) {
                (None, kind) => Ok(Some(kind)),
                (Some(Insert), Insert) => Err(()),
                (Some(Insert), Update) => Ok(Some(Insert)),
                (Some(Insert), Delete) => Ok(None),
                (Some(Update), Insert) => Err(()),
                (Some(Update), Update) => Ok(Some(Update)),
                (Some(Update), Delete) => Ok(Some(Delete)),
                (Some(Delete), _) => Err(()),
            }
        }

        proptest! {
            #[test]
            fn queue_matches_collapse_model(kinds in prop::collection::vec(kind_strategy(), 1..40)) {
                let queue = new_queue();
                let mut model: Option<TableOperationKind> = None;

                for kind in kinds {
                    let result = queue.enqueue(op(kind, "a"));
                    match model_step(model, kind) {
                        Ok(next) => {
                            prop_assert!(result.is_ok());
                            model = next;
                        }
                        Err(()) => {
                            prop_assert!(result.is_err());
                        }
                    }

                    // Never more than one entry for the item.
                    prop_assert!(queue.count_pending() <= 1);
                    prop_assert_eq!(queue.pending_kind("todo/a"), model);
                }
            }
        }
    }
}
