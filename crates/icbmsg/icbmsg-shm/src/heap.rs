use crate::view::Backing;
use std::alloc::{Layout, alloc_zeroed, dealloc, handle_alloc_error};
use std::ptr::NonNull;

/// Alignment of heap regions: one cache line, which covers every cursor,
/// index and header field the transport places in shared memory.
const HEAP_ALIGN: usize = 64;

/// Zeroed, cache-line aligned heap allocation standing in for a shared memory
/// region when both link sides live in the same process.
pub struct HeapRegion {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the region is plain bytes; all access goes through ShmView which
// only performs raw copies and atomic operations.
unsafe impl Send for HeapRegion {}
unsafe impl Sync for HeapRegion {}

impl HeapRegion {
    /// Allocates `len` zeroed bytes. A zero `len` allocates one alignment unit
    /// so the pointer is always valid.
    pub fn new(len: usize) -> Self {
        let layout = match Layout::from_size_align(len.max(HEAP_ALIGN), HEAP_ALIGN) {
            Ok(layout) => layout,
            Err(_) => panic!("heap region of {len} bytes overflows isize"),
        };
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let Some(ptr) = NonNull::new(raw) else {
            handle_alloc_error(layout)
        };
        Self { ptr, len, layout }
    }
}

impl Backing for HeapRegion {
    fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Drop for HeapRegion {
    fn drop(&mut self) {
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}
