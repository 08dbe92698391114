//! A post-mortem managed-heap inspector: given read-only access to the
//! memory of a stopped managed-runtime process (live process or full
//! dump), reconstructs the logical structure of its garbage-collected
//! heap — object boundaries, types, outbound references — and answers
//! reachability queries over it.
//!
//! This crate is the walker and rooting engine only. Dump-file parsing,
//! the debugger/DAC data-access layer, and type/metadata caching are
//! supplied by the embedding application through the traits in
//! [`external`]; see that module and [`Heap`] for the seam.

pub mod align;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod external;
pub mod gcdesc;
pub mod heap;
pub mod memory_reader;
pub mod object;
pub mod pathfinder;
pub mod references;
pub mod root;
pub mod segment;
pub mod types;
pub mod walker;

pub use config::{HeapConfig, PathFinderConfig, PointerWidth, ReaderConfig};
pub use diagnostics::HeapWalkStep;
pub use error::{HeapError, Result};
pub use heap::Heap;
pub use object::Object;
pub use pathfinder::{CancelToken, Path, PathFinder};
pub use root::Root;
pub use segment::Segment;
pub use types::Type;
