//! GC descriptor walk.
//!
//! The descriptor's encoding is entirely the metadata provider's concern —
//! this crate never decodes reference-map bits itself. It only defines the
//! seam: given an object's address and size plus a pointer-reading
//! callback, the descriptor yields `(offset, referent)` pairs. The
//! descriptor is trusted to stay within `[object, object + size)`.

/// One outbound pointer field discovered by a [`GcDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcReference {
    pub offset: u64,
    pub referent: u64,
}

/// A pointer-reading callback handed to the descriptor. Backed by
/// [`crate::memory_reader::MemoryReader`] when the address falls in its
/// cached window, falling back to the raw `DataReader` otherwise.
pub type FieldReader<'a> = dyn FnMut(u64) -> Option<u64> + 'a;

/// Per-type encoded reference map, supplied by the metadata provider and
/// invoked by [`crate::walker::HeapWalker`]/[`crate::references::ReferenceEnumerator`]
/// only when `Type::contains_pointers()` is set.
pub trait GcDescriptor: Send + Sync {
    /// Yields every outbound pointer field of the object at `object_address`
    /// (whose size has already been computed as `object_size`).
    fn walk_object(
        &self,
        object_address: u64,
        object_size: u64,
        read_ptr: &mut FieldReader<'_>,
    ) -> Vec<GcReference>;
}

/// A [`GcDescriptor`] built from a fixed list of pointer-field offsets
/// relative to the object's address — the common case for fixed-layout
/// types, and the shape used throughout this crate's own tests.
pub struct OffsetListDescriptor {
    offsets: Vec<u64>,
}

impl OffsetListDescriptor {
    pub fn new(offsets: Vec<u64>) -> Self {
        OffsetListDescriptor { offsets }
    }
}

impl GcDescriptor for OffsetListDescriptor {
    fn walk_object(
        &self,
        object_address: u64,
        _object_size: u64,
        read_ptr: &mut FieldReader<'_>,
    ) -> Vec<GcReference> {
        self.offsets
            .iter()
            .filter_map(|&offset| {
                let field_addr = object_address + offset;
                read_ptr(field_addr).map(|referent| GcReference {
                    offset,
                    referent,
                })
            })
            .collect()
    }
}
