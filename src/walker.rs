//! Linear enumeration of objects within a segment.

use crate::align::align_and_clamp;
use crate::config::HeapConfig;
use crate::diagnostics::{HeapWalkStep, StepLog, BASE_SIZE_CORRUPTION, BASE_SIZE_TYPE_LOOKUP_FAILED};
use crate::external::{DataReader, HeapHelpers};
use crate::memory_reader::MemoryReader;
use crate::object::{object_size, Object};
use crate::segment::Segment;
use crate::types::WellKnownTypes;
use std::collections::BTreeMap;

/// Lazily enumerates the objects of one segment, in ascending address
/// order, skipping allocation contexts and stopping (without propagating
/// an error; walk-time failures are localized to the current segment) on
/// a failed type lookup or a corrupt allocation-context skip.
pub struct HeapWalker<'h, 'r, 's, H: HeapHelpers> {
    helpers: &'h H,
    well_known: &'h WellKnownTypes,
    config: HeapConfig,
    allocation_contexts: &'h BTreeMap<u64, u64>,
    reader: &'r mut MemoryReader<'h, H::Reader>,
    step_log: Option<&'s mut StepLog>,
    segment: Segment,
    cursor: u64,
    done: bool,
}

impl<'h, 'r, 's, H: HeapHelpers> HeapWalker<'h, 'r, 's, H> {
    pub fn new(
        helpers: &'h H,
        well_known: &'h WellKnownTypes,
        config: HeapConfig,
        allocation_contexts: &'h BTreeMap<u64, u64>,
        reader: &'r mut MemoryReader<'h, H::Reader>,
        step_log: Option<&'s mut StepLog>,
        segment: Segment,
    ) -> Self {
        log::trace!("entering segment [{:#x}, {:#x})", segment.start, segment.end);
        HeapWalker {
            helpers,
            well_known,
            config,
            allocation_contexts,
            reader,
            step_log,
            cursor: segment.first_object,
            segment,
            done: false,
        }
    }

    fn record(&mut self, step: HeapWalkStep) {
        if step.is_corruption() || step.is_failure() {
            log::warn!(
                "heap walk stopped segment [{:#x}, {:#x}) at {:#x}: {}",
                self.segment.start,
                self.segment.end,
                step.address,
                if step.is_corruption() { "allocation-context skip corruption" } else { "method table lookup failed" }
            );
        }
        if let Some(log) = self.step_log.as_deref_mut() {
            log.record(step);
        }
    }

    /// Reads the method table word at `obj`, resolving MT-plus-count in a
    /// single bulk read for large-object segments.
    fn read_method_table(&mut self, obj: u64) -> Option<u64> {
        if self.segment.is_large_object_segment {
            let width = self.config.pointer_width.bytes();
            let mut buf = vec![0u8; (2 * width + 4) as usize];
            let n = self.helpers.data_reader().read_memory(obj, &mut buf);
            if (n as u64) < width {
                return None;
            }
            let mut mt_bytes = [0u8; 8];
            mt_bytes[..width as usize].copy_from_slice(&buf[..width as usize]);
            Some(u64::from_le_bytes(mt_bytes))
        } else {
            self.reader.read_ptr(obj)
        }
    }
}

impl<'h, 'r, 's, H: HeapHelpers> Iterator for HeapWalker<'h, 'r, 's, H> {
    type Item = Object;

    fn next(&mut self) -> Option<Object> {
        loop {
            if self.done || self.cursor >= self.segment.committed_end {
                self.done = true;
                return None;
            }

            if let Some(&limit) = self.allocation_contexts.get(&self.cursor) {
                let gap = align_and_clamp(
                    self.config.min_object_size(),
                    self.segment.is_large_object_segment,
                    self.config.pointer_width,
                );
                let next = limit + gap;
                if next <= self.cursor || next > self.segment.end {
                    self.record(HeapWalkStep {
                        address: self.cursor,
                        method_table: 0,
                        base_size: BASE_SIZE_CORRUPTION,
                        component_size: 0,
                        count: 0,
                    });
                    self.done = true;
                    return None;
                }
                self.cursor = next;
                continue;
            }

            let obj = self.cursor;
            let Some(mt) = self.read_method_table(obj) else {
                self.record(HeapWalkStep {
                    address: obj,
                    method_table: 0,
                    base_size: BASE_SIZE_TYPE_LOOKUP_FAILED,
                    component_size: 0,
                    count: 0,
                });
                self.done = true;
                return None;
            };

            let Some(ty) = self.helpers.get_or_create_type(mt, Some(obj)) else {
                self.record(HeapWalkStep {
                    address: obj,
                    method_table: mt,
                    base_size: BASE_SIZE_TYPE_LOOKUP_FAILED,
                    component_size: 0,
                    count: 0,
                });
                self.done = true;
                return None;
            };

            let object = Object::new(obj, ty);
            let reader = &mut self.reader;
            let size = object_size(
                &object,
                self.segment.is_large_object_segment,
                self.config.pointer_width,
                self.well_known,
                |addr| reader.read_dword(addr),
            );

            self.record(HeapWalkStep {
                address: obj,
                method_table: mt,
                base_size: object.ty.base_size() as i64,
                component_size: object.ty.component_size() as i64,
                count: 0,
            });

            self.cursor = obj + size;
            return Some(object);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HeapConfig, PointerWidth};
    use crate::types::Type;
    use std::cell::RefCell;
    use std::collections::HashMap;

    struct FakeReader {
        bytes: RefCell<HashMap<u64, u8>>,
    }

    impl FakeReader {
        fn new() -> Self {
            FakeReader {
                bytes: RefCell::new(HashMap::new()),
            }
        }
        fn write_u64(&self, addr: u64, value: u64) {
            for (i, b) in value.to_le_bytes().iter().enumerate() {
                self.bytes.borrow_mut().insert(addr + i as u64, *b);
            }
        }
        fn write_u32(&self, addr: u64, value: u32) {
            for (i, b) in value.to_le_bytes().iter().enumerate() {
                self.bytes.borrow_mut().insert(addr + i as u64, *b);
            }
        }
    }

    impl DataReader for FakeReader {
        fn read_memory(&self, addr: u64, buf: &mut [u8]) -> usize {
            let map = self.bytes.borrow();
            for (i, slot) in buf.iter_mut().enumerate() {
                match map.get(&(addr + i as u64)) {
                    Some(b) => *slot = *b,
                    None => return i,
                }
            }
            buf.len()
        }
        fn read_pointer_unsafe(&self, addr: u64) -> u64 {
            let mut buf = [0u8; 8];
            self.read_memory(addr, &mut buf);
            u64::from_le_bytes(buf)
        }
        fn read_u32_unsafe(&self, addr: u64) -> u32 {
            let mut buf = [0u8; 4];
            self.read_memory(addr, &mut buf);
            u32::from_le_bytes(buf)
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

    fn well_known(types: &HashMap<u64, Type>) -> WellKnownTypes {
        WellKnownTypes {
            string_type: types[&3].clone(),
            object_type: types[&1].clone(),
            free_type: types[&1].clone(),
            exception_type: types[&1].clone(),
        }
    }

    #[test]
    fn walks_synthetic_segment_of_mixed_object_sizes() {
        let reader = FakeReader::new();
        reader.write_u64(0x1000, 1); // type A, base 24
        reader.write_u64(0x1018, 2); // type B, base 32
        reader.write_u64(0x1038, 3); // String, base 22, comp 2
        reader.write_u32(0x1038 + 8, 3); // count = 3

        let mut types = HashMap::new();
        types.insert(1, Type::new(1, "A", 24, 0, false, false, 0, None));
        types.insert(2, Type::new(2, "B", 32, 0, false, false, 0, None));
        types.insert(3, Type::new(3, "String", 22, 2, true, false, 0, None));

        let well_known = well_known(&types);
        let helpers = FakeHelpers { reader, types };
        let config = HeapConfig::new(PointerWidth::Eight);
        let allocation_contexts = BTreeMap::new();
        let segment = Segment {
            start: 0x1000,
            end: 0x2000,
            committed_end: 0x2000,
            first_object: 0x1000,
            is_large_object_segment: false,
        };

        let mut mr = MemoryReader::new(helpers.data_reader(), config.reader);
        let walker = HeapWalker::new(
            &helpers,
            &well_known,
            config,
            &allocation_contexts,
            &mut mr,
            None,
            segment,
        );
        let objects: Vec<Object> = walker.collect();
        let addrs: Vec<u64> = objects.iter().map(|o| o.address).collect();
        assert_eq!(addrs, vec![0x1000, 0x1018, 0x1038]);
    }

    #[test]
    fn skips_allocation_context() {
        let reader = FakeReader::new();
        reader.write_u64(0x1000, 1);
        // next = limit + align_and_clamp(min_object_size, ...) = 0x2200 + 24 = 0x2218.
        reader.write_u64(0x2218, 1);
        let mut types = HashMap::new();
        types.insert(1, Type::new(1, "A", 24, 0, false, false, 0, None));
        let well_known = well_known(&types);
        let helpers = FakeHelpers { reader, types };
        let config = HeapConfig::new(PointerWidth::Eight);
        let mut allocation_contexts = BTreeMap::new();
        allocation_contexts.insert(0x2000u64, 0x2200u64);
        let segment = Segment {
            start: 0x1000,
            end: 0x3000,
            committed_end: 0x3000,
            first_object: 0x1000,
            is_large_object_segment: false,
        };
        let mut mr = MemoryReader::new(helpers.data_reader(), config.reader);
        // drive the cursor directly to the allocation context start.
        let mut walker = HeapWalker::new(
            &helpers,
            &well_known,
            config,
            &allocation_contexts,
            &mut mr,
            None,
            segment,
        );
        walker.cursor = 0x2000;
        assert_eq!(walker.next().unwrap().address, 0x2218);
    }
}
