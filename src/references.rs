//! Outbound-reference enumeration: per-type GC descriptor walks plus
//! dependent-handle and loader-allocator edges.

use crate::config::HeapConfig;
use crate::external::HeapHelpers;
use crate::gcdesc::GcReference;
use crate::memory_reader::MemoryReader;
use crate::object::Object;
use crate::segment::SegmentIndex;
use crate::types::WellKnownTypes;
use std::cell::RefCell;

/// Combines the per-type GC descriptor walk with dependent-handle lookups
/// and the loader-allocator edge.
pub struct ReferenceEnumerator<'h, H: HeapHelpers> {
    helpers: &'h H,
    well_known: &'h WellKnownTypes,
    config: HeapConfig,
    segment_index: &'h SegmentIndex,
    /// Lazily materialized on first query that asks for dependent handles,
    /// then reused for the lifetime of the heap instance.
    dependent_edges: RefCell<Option<Vec<(u64, u64)>>>,
}

impl<'h, H: HeapHelpers> ReferenceEnumerator<'h, H> {
    pub fn new(
        helpers: &'h H,
        well_known: &'h WellKnownTypes,
        config: HeapConfig,
        segment_index: &'h SegmentIndex,
    ) -> Self {
        ReferenceEnumerator {
            helpers,
            well_known,
            config,
            segment_index,
            dependent_edges: RefCell::new(None),
        }
    }

    /// Resolves the type of whatever object lives at `address`, for
    /// wrapping a raw referent into an [`Object`]. Tolerates unreadable or
    /// unrecognized method tables by returning `None`.
    pub fn resolve_type(
        &self,
        address: u64,
        reader: &mut MemoryReader<'h, H::Reader>,
    ) -> Option<crate::types::Type> {
        let mt = reader.read_ptr(address)?;
        self.helpers.get_or_create_type(mt, Some(address))
    }

    fn dependent_targets(&self, source: u64) -> Vec<u64> {
        let mut cache = self.dependent_edges.borrow_mut();
        let edges = cache.get_or_insert_with(|| {
            let mut edges = self.helpers.enumerate_dependent_handle_links();
            edges.sort_unstable_by_key(|&(src, _)| src);
            edges
        });
        let start = edges.partition_point(|&(src, _)| src < source);
        edges[start..]
            .iter()
            .take_while(|&&(src, _)| src == source)
            .map(|&(_, dst)| dst)
            .collect()
    }

    /// True if `object` runs past its segment's end, or (for a non-large
    /// segment) if `size` is at or above the oversize threshold.
    fn is_too_large(&self, object: &Object, size: u64) -> bool {
        match self.segment_index.segment_of(object.address) {
            Some(segment) => {
                object.address + size > segment.end
                    || (!segment.is_large_object_segment && size >= self.config.oversize_threshold)
            }
            // No segment at all for this address: cannot verify bounds, so
            // treat conservatively as too large under `carefully`.
            None => true,
        }
    }

    /// Enumerates outbound references from `object` (whose computed size is
    /// `size`). Every yielded address is non-zero and wrapped with its
    /// resolved type (which may be `None`).
    pub fn enumerate_references(
        &self,
        object: &Object,
        size: u64,
        carefully: bool,
        include_dependent: bool,
        reader: &mut MemoryReader<'h, H::Reader>,
    ) -> Vec<Object> {
        let mut out = Vec::new();

        if include_dependent {
            for target in self.dependent_targets(object.address) {
                if target != 0 {
                    out.push(Object::new(target, self.resolve_type_or_unknown(target, reader)));
                }
            }
        }

        if object.ty.is_collectible() {
            if let Some(loader_allocator) = reader.read_ptr(object.ty.loader_allocator_handle()) {
                if loader_allocator != 0 {
                    out.push(Object::new(
                        loader_allocator,
                        self.resolve_type_or_unknown(loader_allocator, reader),
                    ));
                }
            }
        }

        if object.ty.contains_pointers() {
            if carefully && self.is_too_large(object, size) {
                return out;
            }
            if let Some(desc) = object.ty.gc_desc() {
                let mut read_ptr_fn = |addr: u64| reader.read_ptr(addr);
                let refs: Vec<GcReference> = desc.walk_object(object.address, size, &mut read_ptr_fn);
                for r in refs {
                    if r.referent != 0 {
                        out.push(Object::new(
                            r.referent,
                            self.resolve_type_or_unknown(r.referent, reader),
                        ));
                    }
                }
            }
        }

        out
    }

    fn resolve_type_or_unknown(
        &self,
        address: u64,
        reader: &mut MemoryReader<'h, H::Reader>,
    ) -> crate::types::Type {
        self.resolve_type(address, reader).unwrap_or_else(|| {
            // A referent whose type can't be resolved still needs *some*
            // Type so downstream code can treat every Object uniformly;
            // model it with the runtime's own Free/Object placeholder.
            self.well_known.object_type.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PointerWidth;
    use crate::external::DataReader;
    use crate::gcdesc::OffsetListDescriptor;
    use crate::segment::Segment;
    use crate::types::Type;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct FakeReader {
        bytes: HashMap<u64, u64>,
    }
    impl DataReader for FakeReader {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> usize {
            if let Some(&v) = self.bytes.get(&addr) {
                let b = v.to_le_bytes();
                let n = buf.len().min(8);
                buf[..n].copy_from_slice(&b[..n]);
                n
            } else {
                0
            }
        }
        fn read_pointer_unsafe(&self, addr: u64) -> u64 {
            *self.bytes.get(&addr).unwrap_or(&0)
        }
        fn read_u32_unsafe(&self, addr: u64) -> u32 {
            *self.bytes.get(&addr).unwrap_or(&0) as u32
        }
    }

    struct FakeHelpers {
        reader: FakeReader,
        types: HashMap<u64, Type>,
        dependent: Vec<(u64, u64)>,
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
            self.dependent.clone()
        }
    }

    fn config() -> HeapConfig {
        HeapConfig::new(PointerWidth::Eight)
    }

    #[test]
    fn dependent_edge_only_yielded_when_requested() {
        let ty = Type::new(1, "A", 24, 0, false, false, 0, None);
        let helpers = FakeHelpers {
            reader: FakeReader { bytes: HashMap::new() },
            types: HashMap::from([(1, ty.clone())]),
            dependent: vec![(0x1000, 0x2000)],
        };
        let well_known = WellKnownTypes {
            string_type: ty.clone(),
            object_type: ty.clone(),
            free_type: ty.clone(),
            exception_type: ty.clone(),
        };
        let segs = SegmentIndex::new(vec![Segment {
            start: 0x1000,
            end: 0x3000,
            committed_end: 0x3000,
            first_object: 0x1000,
            is_large_object_segment: false,
        }])
        .unwrap();
        let enumerator = ReferenceEnumerator::new(&helpers, &well_known, config(), &segs);
        let obj = Object::new(0x1000, ty);
        let mut mr = MemoryReader::new(helpers.data_reader(), config().reader);

        let refs = enumerator.enumerate_references(&obj, 24, false, false, &mut mr);
        assert!(refs.is_empty());

        let refs = enumerator.enumerate_references(&obj, 24, false, true, &mut mr);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].address, 0x2000);
    }

    #[test]
    fn gc_desc_walk_filters_zero_referents() {
        let desc = Arc::new(OffsetListDescriptor::new(vec![8, 16]));
        let ty = Type::new(1, "A", 24, 0, true, false, 0, Some(desc));
        let mut bytes = HashMap::new();
        bytes.insert(0x1008, 0x5000u64);
        bytes.insert(0x1010, 0u64);
        let helpers = FakeHelpers {
            reader: FakeReader { bytes },
            types: HashMap::from([(1, ty.clone())]),
            dependent: Vec::new(),
        };
        let well_known = WellKnownTypes {
            string_type: ty.clone(),
            object_type: ty.clone(),
            free_type: ty.clone(),
            exception_type: ty.clone(),
        };
        let segs = SegmentIndex::new(vec![Segment {
            start: 0x1000,
            end: 0x3000,
            committed_end: 0x3000,
            first_object: 0x1000,
            is_large_object_segment: false,
        }])
        .unwrap();
        let enumerator = ReferenceEnumerator::new(&helpers, &well_known, config(), &segs);
        let obj = Object::new(0x1000, ty);
        let mut mr = MemoryReader::new(helpers.data_reader(), config().reader);
        let refs = enumerator.enumerate_references(&obj, 24, false, false, &mut mr);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].address, 0x5000);
    }

    #[test]
    fn carefully_mode_skips_oversize_objects_in_non_large_segment() {
        let desc = Arc::new(OffsetListDescriptor::new(vec![8]));
        let ty = Type::new(1, "A", 24, 0, true, false, 0, Some(desc));
        let mut bytes = HashMap::new();
        bytes.insert(0x1008, 0x5000u64);
        let helpers = FakeHelpers {
            reader: FakeReader { bytes },
            types: HashMap::from([(1, ty.clone())]),
            dependent: Vec::new(),
        };
        let well_known = WellKnownTypes {
            string_type: ty.clone(),
            object_type: ty.clone(),
            free_type: ty.clone(),
            exception_type: ty.clone(),
        };
        let segs = SegmentIndex::new(vec![Segment {
            start: 0x1000,
            end: 0x3000,
            committed_end: 0x3000,
            first_object: 0x1000,
            is_large_object_segment: false,
        }])
        .unwrap();
        let enumerator = ReferenceEnumerator::new(&helpers, &well_known, config(), &segs);
        let obj = Object::new(0x1000, ty);
        let mut mr = MemoryReader::new(helpers.data_reader(), config().reader);
        let refs = enumerator.enumerate_references(&obj, 90_000, true, false, &mut mr);
        assert!(refs.is_empty());
    }
}
