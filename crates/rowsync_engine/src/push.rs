//! Push cycle outcome types.

use crate::op_error::TableOperationError;
use std::fmt;

/// How a push cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushStatus {
    /// Every bookmarked operation was processed.
    Complete,
    /// A network failure aborted the cycle; unprocessed operations
    /// remain queued.
    CancelledByNetworkError,
    /// The remote service rejected the credentials (401); unprocessed
    /// operations remain queued.
    CancelledByAuthenticationError,
    /// The local store failed mid-cycle; unprocessed operations remain
    /// queued.
    CancelledByLocalStoreError,
    /// An unexpected failure aborted the cycle.
    InternalError,
}

impl fmt::Display for PushStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PushStatus::Complete => "complete",
            PushStatus::CancelledByNetworkError => "cancelled by network error",
            PushStatus::CancelledByAuthenticationError => "cancelled by authentication error",
            PushStatus::CancelledByLocalStoreError => "cancelled by local store error",
            PushStatus::InternalError => "internal error",
        };
        f.write_str(text)
    }
}

/// The aggregate outcome of one push cycle, handed to the sync
/// handler's completion hook and carried by
/// [`SyncError::PushFailed`](crate::SyncError::PushFailed).
#[derive(Debug, Clone)]
pub struct PushCompletionResult {
    /// How the cycle ended.
    pub status: PushStatus,
    /// Per-operation failures recorded during the cycle.
    pub operation_errors: Vec<TableOperationError>,
    /// Description of the unexpected failure, when `status` is
    /// [`PushStatus::InternalError`].
    pub internal_error: Option<String>,
}

impl PushCompletionResult {
    /// Creates a result with the given status and no errors.
    pub fn new(status: PushStatus) -> Self {
        Self {
            status,
            operation_errors: Vec::new(),
            internal_error: None,
        }
    }

    /// Returns true if the cycle completed and recorded no operation
    /// errors.
    pub fn is_success(&self) -> bool {
        self.status == PushStatus::Complete && self.operation_errors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display() {
        assert_eq!(PushStatus::Complete.to_string(), "complete");
        assert_eq!(
            PushStatus::CancelledByNetworkError.to_string(),
            "cancelled by network error"
        );
    }

    #[test]
    fn success_requires_complete_and_no_errors() {
        let result = PushCompletionResult::new(PushStatus::Complete);
        assert!(result.is_success());

        let result = PushCompletionResult::new(PushStatus::CancelledByNetworkError);
        assert!(!result.is_success());
    }
}
