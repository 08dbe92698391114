//! `Heap` — the facade this crate exposes to its caller.
//!
//! Ties the segment index, type singletons, walker, reference enumerator,
//! root enumerator and path finder together behind the handful of methods
//! an embedding debugger actually calls. Generic over the collaborator
//! traits of [`crate::external`] rather than boxed, so the hot read path
//! stays monomorphized.

use crate::config::HeapConfig;
use crate::diagnostics::{HeapWalkStep, StepLog};
use crate::error::Result;
use crate::external::{HeapBuilder, HeapHelpers, Runtime};
use crate::memory_reader::MemoryReader;
use crate::object::{object_size, Object};
use crate::pathfinder::{CancelToken, Path, PathFinder};
use crate::references::ReferenceEnumerator;
use crate::root::{Root, RootEnumerator};
use crate::segment::{Segment, SegmentIndex};
use crate::types::{Type, WellKnownTypes};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// A reconstructed view over one stopped managed-runtime heap. Built once
/// per attached runtime and held for as long as the runtime handle is
/// valid; there is no mutation of the inspected process anywhere in this
/// crate.
pub struct Heap<B: HeapBuilder, H: HeapHelpers, T: Runtime> {
    builder: B,
    helpers: H,
    runtime: T,
    well_known: WellKnownTypes,
    segments: SegmentIndex,
    allocation_contexts: BTreeMap<u64, u64>,
    finalizer_queue_segments: Vec<crate::external::FinalizerQueueSegment>,
    finalizer_objects: Vec<u64>,
    config: HeapConfig,
    path_config: Mutex<crate::config::PathFinderConfig>,
    step_log: Mutex<StepLog>,
}

impl<B: HeapBuilder, H: HeapHelpers, T: Runtime> Heap<B, H, T> {
    /// Eagerly resolves the segment list, allocation contexts, finalizer
    /// state and the runtime's pre-cached singleton types. Failure here is
    /// fatal: an unresolved `String`/`Object`/`Free`/`Exception` type, or an
    /// out-of-order/overlapping segment list, surfaces as
    /// [`crate::error::HeapError::InvariantViolation`] rather than silently
    /// producing a half-usable heap.
    pub fn new(builder: B, helpers: H, runtime: T, config: HeapConfig) -> Result<Self> {
        let layout = builder.create_segments()?;
        let segments = SegmentIndex::new(layout.segments)?;

        let resolve_well_known = |mt: u64, label: &str| -> Result<Type> {
            helpers
                .get_or_create_type(mt, None)
                .ok_or_else(|| crate::error::HeapError::invariant(format!("{label} type unresolved at construction")))
        };
        let well_known = WellKnownTypes {
            string_type: resolve_well_known(builder.string_method_table(), "String")?,
            object_type: resolve_well_known(builder.object_method_table(), "Object")?,
            free_type: resolve_well_known(builder.free_method_table(), "Free")?,
            exception_type: resolve_well_known(builder.exception_method_table(), "Exception")?,
        };

        Ok(Heap {
            builder,
            helpers,
            runtime,
            well_known,
            segments,
            allocation_contexts: layout.allocation_contexts,
            finalizer_queue_segments: layout.finalizer_queue_segments,
            finalizer_objects: layout.finalizer_objects,
            config,
            path_config: Mutex::new(crate::config::PathFinderConfig::default()),
            step_log: Mutex::new(StepLog::new(None)),
        })
    }

    pub fn can_walk_heap(&self) -> bool {
        self.builder.can_walk_heap()
    }

    pub fn is_server(&self) -> bool {
        self.builder.is_server()
    }

    pub fn segments(&self) -> &[Segment] {
        self.segments.segments()
    }

    pub fn get_segment_by_address(&self, addr: u64) -> Option<Segment> {
        self.segments.segment_of(addr)
    }

    fn new_reader(&self) -> MemoryReader<'_, H::Reader> {
        MemoryReader::new(self.helpers.data_reader(), self.config.reader)
    }

    /// Linearly walks one segment, lazily, skipping allocation contexts and
    /// stopping the segment (not the whole enumeration) on corruption.
    /// Consumes its own [`MemoryReader`], which is discarded when the
    /// returned vector is collected: per-thread caches never outlive a
    /// top-level enumeration.
    pub fn enumerate_objects_in(&self, segment: Segment) -> Vec<Object> {
        let mut reader = self.new_reader();
        let mut guard = self.step_log.lock();
        let step_log = if guard.capacity().is_some() { Some(&mut *guard) } else { None };
        let walker = crate::walker::HeapWalker::new(
            &self.helpers,
            &self.well_known,
            self.config,
            &self.allocation_contexts,
            &mut reader,
            step_log,
            segment,
        );
        walker.collect()
    }

    /// Enumerates every object across every segment, in `start` order. The
    /// step log is reset at the start of this top-level call so `steps()`
    /// reflects only the walk that just ran, not whatever accumulated
    /// across unrelated earlier calls.
    pub fn enumerate_objects(&self) -> Vec<Object> {
        self.step_log.lock().reset();
        self.segments()
            .to_vec()
            .into_iter()
            .flat_map(|segment| self.enumerate_objects_in(segment))
            .collect()
    }

    /// As [`Self::enumerate_objects`], but treats a corrupt
    /// allocation-context skip as a hard failure instead of silently
    /// truncating the affected segment: if the most recently recorded step
    /// is a corruption step, this returns
    /// [`crate::error::HeapError::Corruption`] naming the address and the
    /// segment it was found in, instead of the partial object list.
    /// Requires step logging to be enabled via [`Self::log_heap_walk_steps`];
    /// with it disabled this never distinguishes truncation from a clean
    /// segment boundary and behaves exactly like `enumerate_objects`.
    pub fn enumerate_objects_checked(&self) -> Result<Vec<Object>> {
        let objects = self.enumerate_objects();
        if let Some(step) = self.step() {
            if step.is_corruption() {
                let (segment_start, segment_end) = self
                    .get_segment_by_address(step.address)
                    .map(|s| (s.start, s.end))
                    .unwrap_or((0, 0));
                return Err(crate::error::HeapError::Corruption {
                    address: step.address,
                    segment_start,
                    segment_end,
                    reason: "allocation-context skip is non-monotonic or runs past the segment end".into(),
                });
            }
        }
        Ok(objects)
    }

    /// Resolves the type of whatever object lives at `addr` by reading its
    /// method-table word. `None` if the address is unreadable or the method
    /// table is unrecognized by the metadata provider.
    pub fn get_object_type(&self, addr: u64) -> Option<Type> {
        let mut reader = self.new_reader();
        let mt = reader.read_ptr(addr)?;
        self.helpers.get_or_create_type(mt, Some(addr))
    }

    /// Computes `addr`'s in-memory size, using whichever segment (if any)
    /// contains it to decide the large-object alignment rule.
    pub fn get_object_size(&self, addr: u64, ty: &Type) -> u64 {
        let is_large = self.get_segment_by_address(addr).map(|s| s.is_large_object_segment).unwrap_or(false);
        let mut reader = self.new_reader();
        let object = Object::new(addr, ty.clone());
        object_size(&object, is_large, self.config.pointer_width, &self.well_known, |a| {
            reader.read_dword(a)
        })
    }

    fn reference_enumerator(&self) -> ReferenceEnumerator<'_, H> {
        ReferenceEnumerator::new(&self.helpers, &self.well_known, self.config, &self.segments)
    }

    /// Outbound references from `addr`: the GC descriptor walk, plus the
    /// dependent-handle and loader-allocator extensions when
    /// requested/applicable.
    pub fn enumerate_object_references(
        &self,
        addr: u64,
        ty: &Type,
        carefully: bool,
        consider_dependent_handles: bool,
    ) -> Vec<Object> {
        let object = Object::new(addr, ty.clone());
        let size = self.get_object_size(addr, ty);
        let mut reader = self.new_reader();
        self.reference_enumerator()
            .enumerate_references(&object, size, carefully, consider_dependent_handles, &mut reader)
    }

    fn root_enumerator(&self) -> RootEnumerator<'_, H, T> {
        RootEnumerator::new(
            &self.helpers,
            &self.runtime,
            &self.finalizer_queue_segments,
            self.config.pointer_width.bytes(),
        )
    }

    /// Every root in the fixed phase order: strong handles, finalizer-queue
    /// roots, per-thread stack roots.
    pub fn enumerate_roots(&self) -> Vec<Root> {
        let mut reader = self.new_reader();
        self.root_enumerator().enumerate_roots(&mut reader)
    }

    /// Just the finalizer-queue phase of root enumeration, callable on its
    /// own.
    pub fn enumerate_finalizer_roots(&self) -> Vec<Root> {
        let mut reader = self.new_reader();
        self.root_enumerator().finalizer_roots(&mut reader)
    }

    /// Objects currently queued for finalization (`HeapBuilder::create_segments`'s
    /// `finalizer_objects`), distinct from the *roots* derived from the
    /// finalizer queue's slot addresses: this is the set of objects waiting
    /// to run a finalizer, whether or not anything else still references
    /// them.
    pub fn enumerate_finalizable_objects(&self) -> Vec<Object> {
        self.finalizer_objects
            .iter()
            .filter(|&&addr| addr != 0)
            .map(|&addr| {
                let ty = self.get_object_type(addr).unwrap_or_else(|| self.well_known.object_type.clone());
                Object::new(addr, ty)
            })
            .collect()
    }

    fn path_finder(&self) -> PathFinder<'_, H> {
        PathFinder::new(&self.helpers, &self.well_known, self.config, &self.segments, *self.path_config.lock())
    }

    /// Current [`crate::config::PathFinderConfig`] tunables (parallel
    /// search on/off, `max_tasks`).
    pub fn path_finder_config(&self) -> crate::config::PathFinderConfig {
        *self.path_config.lock()
    }

    pub fn set_path_finder_config(&self, config: crate::config::PathFinderConfig) {
        *self.path_config.lock() = config;
    }

    /// Registers a progress callback on the path finder used by the next
    /// `find_single_path`/`enumerate_all_paths`/`enumerate_gc_roots*` call.
    /// Since each of those calls builds a fresh [`PathFinder`], callbacks
    /// don't persist across calls — register immediately before the call
    /// whose progress you want to observe.
    pub fn with_progress(&self, register: impl FnOnce(&PathFinder<'_, H>)) -> PathFinder<'_, H> {
        let finder = self.path_finder();
        register(&finder);
        finder
    }

    /// First path from `source` to `target`, or `None` if unreachable.
    pub fn find_single_path(&self, source: u64, target: u64, carefully: bool, cancel: &CancelToken) -> Result<Option<Path>> {
        self.path_finder().find_single_path(source, target, carefully, cancel)
    }

    /// All paths from `source` to `target`.
    pub fn enumerate_all_paths(
        &self,
        source: u64,
        target: u64,
        unique: bool,
        carefully: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<Path>> {
        self.path_finder().enumerate_all_paths(source, target, unique, carefully, cancel)
    }

    /// Every root-to-`target` path, fanned out sequentially over
    /// [`Self::enumerate_roots`] with shared `seen`/`knownEndPoints` state.
    pub fn enumerate_gc_roots(&self, target: u64, unique: bool, carefully: bool, cancel: &CancelToken) -> Result<Vec<(Root, Path)>> {
        let roots = self.enumerate_roots();
        self.path_finder().enumerate_gc_roots(roots, target, unique, carefully, cancel)
    }

    /// As [`Self::enumerate_gc_roots`], but fans out one task per root over
    /// a bounded pool when `path_finder_config().allow_parallel_search()` —
    /// legal only once the caller has copied the relevant memory into
    /// process-local buffers, since `H` and its `DataReader` must then be
    /// safe to read from multiple threads.
    pub fn enumerate_gc_roots_parallel(
        &self,
        target: u64,
        unique: bool,
        carefully: bool,
        cancel: &CancelToken,
    ) -> Result<Vec<(Root, Path)>>
    where
        H: Sync,
        H::Reader: Sync,
    {
        let roots = self.enumerate_roots();
        self.path_finder().enumerate_gc_roots_parallel(roots, target, unique, carefully, cancel)
    }

    /// Enables/resizes (or disables, with `None`) the heap-walk step log.
    /// Reallocates and drops whatever was recorded so far.
    pub fn log_heap_walk_steps(&self, buffer_size: Option<usize>) {
        self.step_log.lock().set_capacity(buffer_size);
    }

    /// Snapshot of the steps recorded by the most recent [`Self::enumerate_objects`]/
    /// [`Self::enumerate_objects_in`] call. Empty when step logging is disabled.
    pub fn steps(&self) -> Vec<HeapWalkStep> {
        self.step_log.lock().steps().copied().collect()
    }

    /// The most recently recorded step, if step logging is enabled and at
    /// least one step has been recorded since the last reset.
    pub fn step(&self) -> Option<HeapWalkStep> {
        self.step_log.lock().steps().last().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PointerWidth;
    use crate::external::{
        DataReader, FinalizerQueueSegment, HandleInfo, HandleKind, HeapLayout, Runtime, RuntimeThread,
    };
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeReader {
        words: StdMutex<HashMap<u64, u64>>,
    }
    impl FakeReader {
        fn new() -> Self {
            FakeReader {
                words: StdMutex::new(HashMap::new()),
            }
        }
        fn set(&self, addr: u64, value: u64) {
            self.words.lock().unwrap().insert(addr, value);
        }
    }
    impl DataReader for FakeReader {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> usize {
            if let Some(&v) = self.words.lock().unwrap().get(&addr) {
                let b = v.to_le_bytes();
                let n = buf.len().min(8);
                buf[..n].copy_from_slice(&b[..n]);
                n
            } else {
                0
            }
        }
        fn read_pointer_unsafe(&self, addr: u64) -> u64 {
            *self.words.lock().unwrap().get(&addr).unwrap_or(&0)
        }
        fn read_u32_unsafe(&self, addr: u64) -> u32 {
            *self.words.lock().unwrap().get(&addr).unwrap_or(&0) as u32
        }
    }

    struct FakeHelpers {
        reader: FakeReader,
        types: HashMap<u64, Type>,
    }
    impl HeapHelpers for FakeHelpers {
        type Reader = FakeReader;
        fn data_reader(&self) -> &FakeReader {
            &self.reader
        }
        fn get_or_create_type(&self, mt: u64, _obj: Option<u64>) -> Option<Type> {
            self.types.get(&mt).cloned()
        }
        fn enumerate_dependent_handle_links(&self) -> Vec<(u64, u64)> {
            Vec::new()
        }
    }

    struct FakeBuilder {
        segments: Vec<Segment>,
    }
    impl HeapBuilder for FakeBuilder {
        fn can_walk_heap(&self) -> bool {
            true
        }
        fn is_server(&self) -> bool {
            false
        }
        fn string_method_table(&self) -> u64 {
            3
        }
        fn object_method_table(&self) -> u64 {
            1
        }
        fn free_method_table(&self) -> u64 {
            4
        }
        fn exception_method_table(&self) -> u64 {
            5
        }
        fn create_segments(&self) -> Result<HeapLayout> {
            Ok(HeapLayout {
                segments: self.segments.clone(),
                allocation_contexts: BTreeMap::new(),
                finalizer_queue_segments: Vec::new(),
                finalizer_objects: Vec::new(),
            })
        }
    }

    struct NoThread;
    impl RuntimeThread for NoThread {
        fn id(&self) -> u64 {
            0
        }
        fn enumerate_stack_roots(&self) -> Vec<u64> {
            Vec::new()
        }
    }

    struct FakeRuntime {
        handles: Vec<HandleInfo>,
    }
    impl Runtime for FakeRuntime {
        type Thread = NoThread;
        fn enumerate_handles(&self) -> Vec<HandleInfo> {
            self.handles.clone()
        }
        fn threads(&self) -> &[NoThread] {
            &[]
        }
    }

    #[test]
    fn constructs_and_resolves_well_known_types_once() {
        let reader = FakeReader::new();
        reader.set(0x1000, 1);
        let mut types = HashMap::new();
        for mt in [1u64, 3, 4, 5] {
            types.insert(mt, Type::new(mt, format!("T{mt}"), 24, 0, false, false, 0, None));
        }
        let helpers = FakeHelpers { reader, types };
        let builder = FakeBuilder {
            segments: vec![Segment {
                start: 0x1000,
                end: 0x2000,
                committed_end: 0x2000,
                first_object: 0x1000,
                is_large_object_segment: false,
            }],
        };
        let runtime = FakeRuntime {
            handles: vec![HandleInfo {
                object: 0x1000,
                kind: HandleKind::Strong,
            }],
        };
        let config = HeapConfig::new(PointerWidth::Eight);
        let heap = Heap::new(builder, helpers, runtime, config).unwrap();

        assert_eq!(heap.segments().len(), 1);
        let objects = heap.enumerate_objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].address, 0x1000);

        let roots = heap.enumerate_roots();
        assert_eq!(roots.len(), 1);
    }

    #[test]
    fn fails_construction_when_a_well_known_type_is_unresolvable() {
        let reader = FakeReader::new();
        let helpers = FakeHelpers {
            reader,
            types: HashMap::new(), // no types resolvable at all
        };
        let builder = FakeBuilder { segments: Vec::new() };
        let runtime = FakeRuntime { handles: Vec::new() };
        let config = HeapConfig::new(PointerWidth::Eight);
        assert!(Heap::new(builder, helpers, runtime, config).is_err());
    }

    #[test]
    fn finalizer_queue_and_finalizable_objects_resolve_independently() {
        struct LayoutBuilder;
        impl HeapBuilder for LayoutBuilder {
            fn can_walk_heap(&self) -> bool {
                true
            }
            fn is_server(&self) -> bool {
                false
            }
            fn string_method_table(&self) -> u64 {
                3
            }
            fn object_method_table(&self) -> u64 {
                1
            }
            fn free_method_table(&self) -> u64 {
                4
            }
            fn exception_method_table(&self) -> u64 {
                5
            }
            fn create_segments(&self) -> Result<HeapLayout> {
                Ok(HeapLayout {
                    segments: vec![Segment {
                        start: 0x1000,
                        end: 0x3000,
                        committed_end: 0x3000,
                        first_object: 0x1000,
                        is_large_object_segment: false,
                    }],
                    allocation_contexts: BTreeMap::new(),
                    finalizer_queue_segments: vec![FinalizerQueueSegment {
                        start: 0x2000,
                        end: 0x2008,
                    }],
                    finalizer_objects: vec![0x1000],
                })
            }
        }
        let reader = FakeReader::new();
        reader.set(0x1000, 1);
        reader.set(0x2000, 0x1000);
        let mut types = HashMap::new();
        for mt in [1u64, 3, 4, 5] {
            types.insert(mt, Type::new(mt, format!("T{mt}"), 24, 0, false, false, 0, None));
        }
        let helpers = FakeHelpers { reader, types };
        let runtime = FakeRuntime { handles: Vec::new() };
        let config = HeapConfig::new(PointerWidth::Eight);
        let heap = Heap::new(LayoutBuilder, helpers, runtime, config).unwrap();

        let finalizer_roots = heap.enumerate_finalizer_roots();
        assert_eq!(finalizer_roots.len(), 1);
        assert_eq!(finalizer_roots[0].object().address, 0x1000);

        let finalizable = heap.enumerate_finalizable_objects();
        assert_eq!(finalizable.len(), 1);
        assert_eq!(finalizable[0].address, 0x1000);
    }

    #[test]
    fn checked_enumeration_surfaces_allocation_context_corruption() {
        struct CorruptBuilder;
        impl HeapBuilder for CorruptBuilder {
            fn can_walk_heap(&self) -> bool {
                true
            }
            fn is_server(&self) -> bool {
                false
            }
            fn string_method_table(&self) -> u64 {
                3
            }
            fn object_method_table(&self) -> u64 {
                1
            }
            fn free_method_table(&self) -> u64 {
                4
            }
            fn exception_method_table(&self) -> u64 {
                5
            }
            fn create_segments(&self) -> Result<HeapLayout> {
                let mut allocation_contexts = BTreeMap::new();
                // limit + gap(24) = 0x2010, past the segment's 0x2000 end.
                allocation_contexts.insert(0x1000u64, 0x1ff8u64);
                Ok(HeapLayout {
                    segments: vec![Segment {
                        start: 0x1000,
                        end: 0x2000,
                        committed_end: 0x2000,
                        first_object: 0x1000,
                        is_large_object_segment: false,
                    }],
                    allocation_contexts,
                    finalizer_queue_segments: Vec::new(),
                    finalizer_objects: Vec::new(),
                })
            }
        }
        let reader = FakeReader::new();
        let mut types = HashMap::new();
        for mt in [1u64, 3, 4, 5] {
            types.insert(mt, Type::new(mt, format!("T{mt}"), 24, 0, false, false, 0, None));
        }
        let helpers = FakeHelpers { reader, types };
        let runtime = FakeRuntime { handles: Vec::new() };
        let config = HeapConfig::new(PointerWidth::Eight);
        let heap = Heap::new(CorruptBuilder, helpers, runtime, config).unwrap();
        heap.log_heap_walk_steps(Some(8));

        let err = heap.enumerate_objects_checked().unwrap_err();
        match err {
            crate::error::HeapError::Corruption {
                address,
                segment_start,
                segment_end,
                ..
            } => {
                assert_eq!(address, 0x1000);
                assert_eq!(segment_start, 0x1000);
                assert_eq!(segment_end, 0x2000);
            }
            other => panic!("expected Corruption, got {other:?}"),
        }
    }

    #[test]
    fn checked_enumeration_passes_through_clean_walks() {
        let reader = FakeReader::new();
        reader.set(0x1000, 1);
        let mut types = HashMap::new();
        for mt in [1u64, 3, 4, 5] {
            types.insert(mt, Type::new(mt, format!("T{mt}"), 24, 0, false, false, 0, None));
        }
        let helpers = FakeHelpers { reader, types };
        let builder = FakeBuilder {
            segments: vec![Segment {
                start: 0x1000,
                end: 0x2000,
                committed_end: 0x2000,
                first_object: 0x1000,
                is_large_object_segment: false,
            }],
        };
        let runtime = FakeRuntime { handles: Vec::new() };
        let config = HeapConfig::new(PointerWidth::Eight);
        let heap = Heap::new(builder, helpers, runtime, config).unwrap();
        heap.log_heap_walk_steps(Some(8));

        let objects = heap.enumerate_objects_checked().unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].address, 0x1000);
    }
}
