//! Per-method-table type descriptors.
//!
//! Types are produced by the embedding debugger's metadata factory
//! (`HeapHelpers::get_or_create_type`), keyed by `(methodTable,
//! objectAddress)`. The same method table always yields an equal `Type`
//! value — we get that for free by comparing method tables instead of
//! structural fields.

use crate::gcdesc::GcDescriptor;
use std::fmt;
use std::sync::Arc;

struct TypeInner {
    method_table: u64,
    name: Box<str>,
    base_size: u64,
    component_size: u32,
    contains_pointers: bool,
    is_collectible: bool,
    loader_allocator_handle: u64,
    gc_desc: Option<Arc<dyn GcDescriptor>>,
}

/// An immutable per-method-table descriptor. Cheap to clone (an `Arc`
/// bump); compares equal to any other `Type` built from the same method
/// table.
#[derive(Clone)]
pub struct Type(Arc<TypeInner>);

impl Type {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        method_table: u64,
        name: impl Into<Box<str>>,
        base_size: u64,
        component_size: u32,
        contains_pointers: bool,
        is_collectible: bool,
        loader_allocator_handle: u64,
        gc_desc: Option<Arc<dyn GcDescriptor>>,
    ) -> Self {
        Type(Arc::new(TypeInner {
            method_table,
            name: name.into(),
            base_size,
            component_size,
            contains_pointers,
            is_collectible,
            loader_allocator_handle,
            gc_desc,
        }))
    }

    #[inline(always)]
    pub fn method_table(&self) -> u64 {
        self.0.method_table
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.0.name
    }

    #[inline(always)]
    pub fn base_size(&self) -> u64 {
        self.0.base_size
    }

    /// `0` for fixed-size types; otherwise the per-element size used by the
    /// string/array size formula.
    #[inline(always)]
    pub fn component_size(&self) -> u32 {
        self.0.component_size
    }

    #[inline(always)]
    pub fn contains_pointers(&self) -> bool {
        self.0.contains_pointers
    }

    #[inline(always)]
    pub fn is_collectible(&self) -> bool {
        self.0.is_collectible
    }

    #[inline(always)]
    pub fn loader_allocator_handle(&self) -> u64 {
        self.0.loader_allocator_handle
    }

    #[inline(always)]
    pub fn gc_desc(&self) -> Option<&Arc<dyn GcDescriptor>> {
        self.0.gc_desc.as_ref()
    }
}

impl PartialEq for Type {
    fn eq(&self, other: &Self) -> bool {
        self.0.method_table == other.0.method_table
    }
}
impl Eq for Type {}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Type")
            .field("method_table", &format_args!("{:#x}", self.0.method_table))
            .field("name", &self.0.name)
            .field("base_size", &self.0.base_size)
            .field("component_size", &self.0.component_size)
            .finish()
    }
}

/// The runtime's pre-cached singleton types, resolved once at heap
/// construction and compared against by identity (method table equality)
/// from then on.
#[derive(Clone)]
pub struct WellKnownTypes {
    pub string_type: Type,
    pub object_type: Type,
    pub free_type: Type,
    pub exception_type: Type,
}

impl WellKnownTypes {
    #[inline]
    pub fn is_string(&self, ty: &Type) -> bool {
        *ty == self.string_type
    }

    #[inline]
    pub fn is_free(&self, ty: &Type) -> bool {
        *ty == self.free_type
    }
}
