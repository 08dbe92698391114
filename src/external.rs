//! Collaborator traits consumed by this crate.
//!
//! Everything here is implemented by the embedding debugger: dump-file
//! parsing, the live-process/DAC data-access layer, and type/metadata
//! caching are out of scope and live on the other side of these traits.
//! `Heap` is generic over them rather than boxing them: a capability trait
//! the core is parameterized over, so the hot read path stays monomorphized
//! instead of paying a vtable call per cache miss.

use crate::segment::Segment;
use crate::types::Type;

/// Raw memory access into the inspected process or dump. Reads are expected
/// to silently return `0`/partial data on invalid addresses; callers (this
/// crate, always) are responsible for validating addresses against segment
/// bounds before trusting a read.
pub trait DataReader {
    /// Copies as much of `buf.len()` bytes starting at `addr` as is mapped;
    /// returns the number of bytes actually read (may be less than
    /// `buf.len()`, including zero).
    fn read_memory(&self, addr: u64, buf: &mut [u8]) -> usize;

    /// Reads a pointer-width value (always interpreted as 8 bytes; the low
    /// 4 are the meaningful value on a 32-bit target) at `addr`, or `0` if
    /// the address is not mapped.
    fn read_pointer_unsafe(&self, addr: u64) -> u64;

    /// Reads a 4-byte little-endian word at `addr`, or `0` if unmapped.
    /// The only `readUnsafe<T>` instantiation this crate needs.
    fn read_u32_unsafe(&self, addr: u64) -> u32;
}

/// A handle kind as exposed by the runtime's handle table. Only `Strong`
/// (and `Pinned`, which keeps the referent from moving but is otherwise
/// strong) keep an object alive for rooting purposes; the rest are skipped
/// by [`crate::root::RootEnumerator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Strong,
    Pinned,
    WeakShort,
    WeakLong,
    AsyncPinned,
    Dependent,
    RefCounted,
}

impl HandleKind {
    #[inline]
    pub fn is_strong(self) -> bool {
        matches!(self, HandleKind::Strong | HandleKind::Pinned)
    }
}

/// One entry of the runtime's handle table.
#[derive(Debug, Clone, Copy)]
pub struct HandleInfo {
    pub object: u64,
    pub kind: HandleKind,
}

/// A contiguous word-addressable range scanned for finalizer-queue roots:
/// each segment is iterated word-by-word, and a slot is a root if it
/// contains non-zero.
#[derive(Debug, Clone, Copy)]
pub struct FinalizerQueueSegment {
    pub start: u64,
    pub end: u64,
}

/// Segments, allocation contexts, and finalizer-queue state as built by the
/// metadata provider. Allocation contexts are keyed by their bump pointer,
/// mapping to the context's limit.
pub struct HeapLayout {
    pub segments: Vec<Segment>,
    pub allocation_contexts: std::collections::BTreeMap<u64, u64>,
    pub finalizer_queue_segments: Vec<FinalizerQueueSegment>,
    pub finalizer_objects: Vec<u64>,
}

/// Static facts about the runtime needed to lay out segments and recognize
/// the pre-cached singleton types.
pub trait HeapBuilder {
    fn can_walk_heap(&self) -> bool;
    fn is_server(&self) -> bool;

    fn string_method_table(&self) -> u64;
    fn object_method_table(&self) -> u64;
    fn free_method_table(&self) -> u64;
    fn exception_method_table(&self) -> u64;

    /// Builds the segment list, allocation-context map, and finalizer state.
    /// Called once at heap construction.
    fn create_segments(&self) -> crate::error::Result<HeapLayout>;
}

/// Type metadata and dependent-handle resolution, plus the raw reader the
/// rest of the crate reads through.
pub trait HeapHelpers {
    type Reader: DataReader;

    fn data_reader(&self) -> &Self::Reader;

    /// Resolves a method table (and, for strings/arrays, the allocating
    /// object's address — some runtimes need it to distinguish generic
    /// instantiations) to a [`Type`]. Returns `None` if the method table is
    /// unreadable/unrecognized; the walker treats that as a failure step
    /// and stops the current segment.
    fn get_or_create_type(&self, method_table: u64, object: Option<u64>) -> Option<Type>;

    /// All dependent-handle `(source, target)` edges currently registered.
    /// Materialized lazily by [`crate::references::ReferenceEnumerator`] on
    /// first use and sorted by source address.
    fn enumerate_dependent_handle_links(&self) -> Vec<(u64, u64)>;
}

/// A single thread of the inspected runtime.
pub trait RuntimeThread {
    fn id(&self) -> u64;

    /// Object addresses rooted by this thread's stack (and registers).
    /// Symbolic decoding of the frames themselves is out of scope here;
    /// only the root addresses matter.
    fn enumerate_stack_roots(&self) -> Vec<u64>;
}

/// The managed runtime: its handle table and its threads.
pub trait Runtime {
    type Thread: RuntimeThread;

    fn enumerate_handles(&self) -> Vec<HandleInfo>;
    fn threads(&self) -> &[Self::Thread];
}
