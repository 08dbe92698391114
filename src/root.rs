//! GC root enumeration.
//!
//! Yields, in a fixed phase order: strong handles, then finalizer-queue
//! roots, then every live thread's stack roots. Ordering across phases is
//! fixed; within a phase it mirrors the external provider.

use crate::external::{FinalizerQueueSegment, HandleKind, HeapHelpers, Runtime, RuntimeThread};
use crate::memory_reader::MemoryReader;
use crate::object::Object;
use crate::types::Type;

/// A GC root, tagged by where it came from. Each variant exposes the
/// [`Object`] it keeps alive.
#[derive(Debug, Clone)]
pub enum Root {
    Handle { object: Object, is_strong: bool },
    Stack { thread: u64, object: Object },
    Finalizer { slot_address: u64, object: Object },
}

impl Root {
    pub fn object(&self) -> &Object {
        match self {
            Root::Handle { object, .. } => object,
            Root::Stack { object, .. } => object,
            Root::Finalizer { object, .. } => object,
        }
    }
}

pub struct RootEnumerator<'h, H: HeapHelpers, Rt: Runtime> {
    helpers: &'h H,
    runtime: &'h Rt,
    finalizer_queue_segments: &'h [FinalizerQueueSegment],
    pointer_width_bytes: u64,
}

impl<'h, H: HeapHelpers, Rt: Runtime> RootEnumerator<'h, H, Rt> {
    pub fn new(
        helpers: &'h H,
        runtime: &'h Rt,
        finalizer_queue_segments: &'h [FinalizerQueueSegment],
        pointer_width_bytes: u64,
    ) -> Self {
        RootEnumerator {
            helpers,
            runtime,
            finalizer_queue_segments,
            pointer_width_bytes,
        }
    }

    fn resolve(&self, address: u64, reader: &mut MemoryReader<'h, H::Reader>) -> Option<Type> {
        let mt = reader.read_ptr(address)?;
        self.helpers.get_or_create_type(mt, Some(address))
    }

    fn handle_roots(&self, reader: &mut MemoryReader<'h, H::Reader>) -> Vec<Root> {
        let mut roots = Vec::new();
        for handle in self.runtime.enumerate_handles() {
            if !handle.kind.is_strong() || handle.object == 0 {
                continue;
            }
            if let Some(ty) = self.resolve(handle.object, reader) {
                roots.push(Root::Handle {
                    object: Object::new(handle.object, ty),
                    is_strong: matches!(handle.kind, HandleKind::Strong),
                });
            }
        }
        roots
    }

    /// Iterates every finalizer-queue segment word-by-word; a slot is a root
    /// if it contains non-zero. Exposed standalone (`Heap::enumerate_finalizer_roots`)
    /// as well as folded into [`Self::enumerate_roots`]'s fixed phase order.
    pub fn finalizer_roots(&self, reader: &mut MemoryReader<'h, H::Reader>) -> Vec<Root> {
        let mut roots = Vec::new();
        for segment in self.finalizer_queue_segments {
            let mut addr = segment.start;
            while addr + self.pointer_width_bytes <= segment.end {
                if let Some(slot) = reader.read_ptr(addr) {
                    if slot != 0 {
                        if let Some(ty) = self.resolve(slot, reader) {
                            roots.push(Root::Finalizer {
                                slot_address: addr,
                                object: Object::new(slot, ty),
                            });
                        }
                    }
                }
                addr += self.pointer_width_bytes;
            }
        }
        roots
    }

    fn stack_roots(&self, reader: &mut MemoryReader<'h, H::Reader>) -> Vec<Root> {
        let mut roots = Vec::new();
        for thread in self.runtime.threads() {
            for addr in thread.enumerate_stack_roots() {
                if addr == 0 {
                    continue;
                }
                if let Some(ty) = self.resolve(addr, reader) {
                    roots.push(Root::Stack {
                        thread: thread.id(),
                        object: Object::new(addr, ty),
                    });
                }
            }
        }
        roots
    }

    /// Enumerates every root in the fixed phase order: strong handles,
    /// finalizer-queue slots, then per-thread stack roots.
    pub fn enumerate_roots(&self, reader: &mut MemoryReader<'h, H::Reader>) -> Vec<Root> {
        let mut roots = self.handle_roots(reader);
        roots.extend(self.finalizer_roots(reader));
        roots.extend(self.stack_roots(reader));
        roots
    }
}
