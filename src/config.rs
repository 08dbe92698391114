//! Tunable knobs for the walker, the reference enumerator and the path
//! finder.
//!
//! This is not a tuning surface for a collector — there is no pause-time
//! target or generation ratio to pick, because this crate never allocates
//! or collects. What's left is the handful of parameters left to the
//! embedding debugger: how much memory to cache per read, how many
//! diagnostic steps to retain, where the "object is suspiciously large"
//! line sits, and how many roots to search concurrently.

use crate::error::HeapError;

/// Pointer width of the inspected process. Drives alignment (`align`),
/// minimum object size, and the width of the method-table word read at the
/// start of every object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    Four,
    Eight,
}

impl PointerWidth {
    #[inline(always)]
    pub fn bytes(self) -> u64 {
        match self {
            PointerWidth::Four => 4,
            PointerWidth::Eight => 8,
        }
    }
}

/// Tunables for [`crate::memory_reader::MemoryReader`].
#[derive(Debug, Clone, Copy)]
pub struct ReaderConfig {
    /// Size in bytes of the single contiguous cache window. Default 64 KiB.
    pub window_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            window_size: 64 * 1024,
        }
    }
}

/// Tunables shared by the walker and the reference enumerator.
#[derive(Debug, Clone, Copy)]
pub struct HeapConfig {
    pub pointer_width: PointerWidth,
    pub reader: ReaderConfig,
    /// Capacity of the per-thread step-log ring buffer. `None` means step
    /// logging is disabled (the default — it is a debugging aid with no
    /// effect on results).
    pub step_log_capacity: Option<usize>,
    /// Minimum size, in bytes, at which a non-large-object-segment object is
    /// considered suspiciously large by `carefully` mode. Default 85 000,
    /// the generation-2 sanity constant used by the reference enumerator.
    pub oversize_threshold: u64,
}

impl HeapConfig {
    pub fn new(pointer_width: PointerWidth) -> Self {
        HeapConfig {
            pointer_width,
            reader: ReaderConfig::default(),
            step_log_capacity: None,
            oversize_threshold: 85_000,
        }
    }

    /// Minimum object size: `3 * pointerSize`.
    #[inline(always)]
    pub fn min_object_size(&self) -> u64 {
        3 * self.pointer_width.bytes()
    }
}

/// Tunables for [`crate::pathfinder::PathFinder`].
#[derive(Debug, Clone, Copy)]
pub struct PathFinderConfig {
    allow_parallel_search: bool,
    max_tasks: usize,
}

impl Default for PathFinderConfig {
    fn default() -> Self {
        PathFinderConfig {
            allow_parallel_search: false,
            max_tasks: 1,
        }
    }
}

impl PathFinderConfig {
    pub fn allow_parallel_search(&self) -> bool {
        self.allow_parallel_search
    }

    pub fn set_allow_parallel_search(&mut self, allow: bool) {
        self.allow_parallel_search = allow;
    }

    pub fn max_tasks(&self) -> usize {
        self.max_tasks
    }

    /// Sets the bound on concurrently in-flight root searches.
    ///
    /// Validates `max_tasks` (the argument), not `self.max_tasks` — a
    /// zero argument is always rejected regardless of the field's current
    /// value.
    pub fn set_max_tasks(&mut self, max_tasks: usize) -> Result<(), HeapError> {
        if max_tasks == 0 {
            return Err(HeapError::invalid_input(
                "max_tasks must be a positive count of concurrent root searches",
            ));
        }
        self.max_tasks = max_tasks;
        Ok(())
    }
}
