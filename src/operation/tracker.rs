//! In-flight operation tracking.

use std::collections::HashMap;
use std::os::unix::io::RawFd;

use crate::operation::OperationType;

/// Tracks operations that have been submitted but whose handler has not yet
/// been dispatched.
///
/// The reactor uses the count to decide whether there is work left to wait
/// for, and the per-operation records for diagnostics.
#[derive(Debug)]
pub(crate) struct OperationTracker {
    in_flight: HashMap<u64, OperationHandle>,
    next_id: u64,
}

/// Record for one in-flight operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct OperationHandle {
    pub(crate) id: u64,
    pub(crate) op_type: OperationType,
    pub(crate) fd: Option<RawFd>,
    /// Continuation hint reported by the handler at submission
    pub(crate) continuation: bool,
}

impl OperationTracker {
    pub(crate) fn new() -> Self {
        Self {
            in_flight: HashMap::new(),
            next_id: 1, // 0 is never handed out
        }
    }

    /// Register a new operation and return its ID.
    pub(crate) fn register_operation(
        &mut self,
        op_type: OperationType,
        fd: Option<RawFd>,
        continuation: bool,
    ) -> u64 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        self.in_flight.insert(
            id,
            OperationHandle {
                id,
                op_type,
                fd,
                continuation,
            },
        );
        id
    }

    /// Mark an operation as completed and remove it from tracking.
    pub(crate) fn complete_operation(&mut self, id: u64) -> Option<OperationHandle> {
        self.in_flight.remove(&id)
    }

    #[cfg(test)]
    pub(crate) fn is_operation_tracked(&self, id: u64) -> bool {
        self.in_flight.contains_key(&id)
    }

    /// Forget every in-flight operation, returning how many there were.
    pub(crate) fn clear(&mut self) -> usize {
        let count = self.in_flight.len();
        self.in_flight.clear();
        count
    }

    /// Number of operations currently in flight.
    pub(crate) fn count(&self) -> usize {
        self.in_flight.len()
    }

    /// Snapshot of all in-flight operations, ordered by ID.
    pub(crate) fn debug_info(&self) -> Vec<OperationHandle> {
        let mut handles: Vec<_> = self.in_flight.values().copied().collect();
        handles.sort_by_key(|handle| handle.id);
        handles
    }
}
