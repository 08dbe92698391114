//! The heap-walk step log.
//!
//! A debugging aid only — switching it on or off, or resizing its buffer,
//! never changes what a walk or search returns. It is realized as an
//! explicit field on the reader-owned walk context rather than a
//! `thread_local!`, so nothing about it outlives the top-level call that
//! owns it.

use std::collections::VecDeque;

/// Sentinel `base_size` recorded when a method-table lookup failed.
pub const BASE_SIZE_TYPE_LOOKUP_FAILED: i64 = i64::MIN + 1;
/// Sentinel `base_size` recorded when an allocation-context skip detected
/// corruption (non-monotonic or past-end).
pub const BASE_SIZE_CORRUPTION: i64 = i64::MIN + 2;

/// One diagnostic record produced while walking a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapWalkStep {
    pub address: u64,
    pub method_table: u64,
    pub base_size: i64,
    pub component_size: i64,
    pub count: i64,
}

impl HeapWalkStep {
    pub fn is_failure(&self) -> bool {
        self.base_size == BASE_SIZE_TYPE_LOOKUP_FAILED
    }

    pub fn is_corruption(&self) -> bool {
        self.base_size == BASE_SIZE_CORRUPTION
    }
}

/// A fixed-capacity ring buffer of [`HeapWalkStep`]s. `None` capacity means
/// logging is disabled: `record` becomes a no-op.
pub struct StepLog {
    capacity: Option<usize>,
    steps: VecDeque<HeapWalkStep>,
}

impl StepLog {
    pub fn new(capacity: Option<usize>) -> Self {
        StepLog {
            capacity,
            steps: VecDeque::new(),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity
    }

    /// Resizing reallocates the buffer and drops whatever was recorded so
    /// far.
    pub fn set_capacity(&mut self, capacity: Option<usize>) {
        self.capacity = capacity;
        self.steps.clear();
    }

    pub fn record(&mut self, step: HeapWalkStep) {
        let Some(capacity) = self.capacity else {
            return;
        };
        if capacity == 0 {
            return;
        }
        if self.steps.len() == capacity {
            self.steps.pop_front();
        }
        self.steps.push_back(step);
    }

    pub fn steps(&self) -> impl Iterator<Item = &HeapWalkStep> {
        self.steps.iter()
    }

    /// Dropped at the end of a top-level enumeration.
    pub fn reset(&mut self) {
        self.steps.clear();
    }
}
