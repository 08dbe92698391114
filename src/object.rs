//! Objects and their size computation.

use crate::align::align_and_clamp;
use crate::config::PointerWidth;
use crate::types::{Type, WellKnownTypes};

/// A `(address, type)` pair identifying one heap object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    pub address: u64,
    pub ty: Type,
}

impl Object {
    pub fn new(address: u64, ty: Type) -> Self {
        Object { address, ty }
    }
}

/// Computes an object's in-memory size:
///
/// * `component_size == 0` → `size = base_size`.
/// * else → `count = *(u32)(address + pointer_width)`; `String` gets
///   `count += 1` for the runtime's unaccounted trailing terminator;
///   `size = count * component_size + base_size`.
/// * then aligned, then clamped to the minimum object size.
///
/// `read_count` reads the 4-byte component-count word at the given address;
/// it returns `None` on an unmapped address, in which case the count is
/// treated as zero, not an error.
pub fn object_size(
    object: &Object,
    is_large_object_segment: bool,
    pointer_width: PointerWidth,
    well_known: &WellKnownTypes,
    mut read_count: impl FnMut(u64) -> Option<u32>,
) -> u64 {
    let size = if object.ty.component_size() == 0 {
        object.ty.base_size()
    } else {
        let mut count = read_count(object.address + pointer_width.bytes()).unwrap_or(0) as u64;
        if well_known.is_string(&object.ty) {
            count += 1;
        }
        count * object.ty.component_size() as u64 + object.ty.base_size()
    };
    align_and_clamp(size, is_large_object_segment, pointer_width)
}
