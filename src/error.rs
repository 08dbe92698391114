//! Error taxonomy for the heap walker and rooting engine.
//!
//! Construction-time failures (`InvariantViolation`) are fatal and bubble
//! straight to the caller. Walk-time failures (`Corruption`) are localized:
//! the walker records a diagnostic step and moves on to the next segment.
//! `Cancelled` is cooperative and carries no partial-result guarantee.
//! A transient zero/garbage read is deliberately *not* an error variant here
//! — callers see it as `None`, per the `TransientRead` entry of the
//! taxonomy.

use thiserror::Error;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, HeapError>;

#[derive(Debug, Error)]
pub enum HeapError {
    /// A null/absent argument, or a `maxTasks` that isn't positive.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Segments out of order, or the metadata provider failed to resolve one
    /// of the mandatory singleton types (String, Object, Free, Exception).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Detected mid-walk: an unreadable method table, or an allocation
    /// context skip that goes backward or past the segment end.
    #[error("heap corruption at {address:#x} in segment [{segment_start:#x}, {segment_end:#x}): {reason}")]
    Corruption {
        address: u64,
        segment_start: u64,
        segment_end: u64,
        reason: String,
    },

    /// Cooperative cancellation observed at a loop boundary or before a
    /// child expansion.
    #[error("operation cancelled")]
    Cancelled,
}

impl HeapError {
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        HeapError::InvalidInput(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        HeapError::InvariantViolation(msg.into())
    }
}
