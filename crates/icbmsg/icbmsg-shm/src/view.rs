//! Bounds-checked window over memory shared with another core.
//!
//! The peer can rewrite any byte of a shared region at any time, so the view
//! only offers accessors that copy in or out of caller-owned memory, plus
//! 32-bit atomics for the ring cursors. Each accessor range-checks its offset
//! against the window before touching memory, which makes this module the one
//! place where peer-controlled offsets are turned into pointers.

use crate::error::ShmError;
use std::any::Any;
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// Memory that can back a [`ShmView`].
pub trait Backing: Send + Sync + 'static {
    /// Start of the region. Must stay valid for the lifetime of `self`.
    fn as_mut_ptr(&self) -> *mut u8;
    fn len(&self) -> usize;
}

/// Cloneable handle to a byte range of shared memory.
///
/// Clones and subviews keep the backing alive.
#[derive(Clone)]
pub struct ShmView {
    base: NonNull<u8>,
    len: usize,
    _owner: Arc<dyn Any + Send + Sync>,
}

// SAFETY: the view only performs raw copies and atomic accesses through
// `base`, and the owner keeping the memory alive is Send + Sync.
unsafe impl Send for ShmView {}

impl fmt::Debug for ShmView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmView")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.len)
            .finish()
    }
}

impl ShmView {
    /// Wraps a backing and views all of it.
    pub fn new<B: Backing>(backing: B) -> Self {
        let len = backing.len();
        let base = NonNull::new(backing.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            base,
            len,
            _owner: Arc::new(backing),
        }
    }

    /// Views a region the platform placed at a fixed address.
    ///
    /// # Safety
    /// `ptr..ptr + len` must be valid for reads and writes for the lifetime of
    /// every view derived from the result, and must not be accessed by this
    /// core through any path other than `ShmView`.
    pub unsafe fn from_raw(ptr: *mut u8, len: usize) -> Self {
        Self {
            base: NonNull::new(ptr).unwrap_or(NonNull::dangling()),
            len,
            _owner: Arc::new(()),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Numeric start address of the window.
    #[inline]
    pub fn addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Narrows the window to `offset..offset + len`.
    pub fn subview(&self, offset: usize, len: usize) -> Result<ShmView, ShmError> {
        let ptr = self.checked_ptr(offset, len)?;
        Ok(ShmView {
            base: NonNull::new(ptr).unwrap_or(self.base),
            len,
            _owner: Arc::clone(&self._owner),
        })
    }

    /// Splits into `..mid` and `mid..`.
    pub fn split_at(&self, mid: usize) -> Result<(ShmView, ShmView), ShmError> {
        let head = self.subview(0, mid)?;
        let tail = self.subview(mid, self.len - mid)?;
        Ok((head, tail))
    }

    /// Copies `dst.len()` bytes starting at `offset` out of shared memory.
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<(), ShmError> {
        let src = self.checked_ptr(offset, dst.len())?;
        // SAFETY: range checked above; dst is caller-owned and cannot overlap.
        unsafe { ptr::copy_nonoverlapping(src, dst.as_mut_ptr(), dst.len()) };
        Ok(())
    }

    /// Copies `src` into shared memory at `offset`.
    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<(), ShmError> {
        let dst = self.checked_ptr(offset, src.len())?;
        // SAFETY: range checked above; src is caller-owned and cannot overlap.
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
        Ok(())
    }

    pub fn fill(&self, offset: usize, len: usize, byte: u8) -> Result<(), ShmError> {
        let dst = self.checked_ptr(offset, len)?;
        // SAFETY: range checked above.
        unsafe { ptr::write_bytes(dst, byte, len) };
        Ok(())
    }

    /// Loads a cursor published by the peer. Acquire pairs with the peer's
    /// Release in [`ShmView::store_u32`], so bytes written before the cursor
    /// are visible once the new cursor value is.
    pub fn load_u32(&self, offset: usize) -> Result<u32, ShmError> {
        let p = self.aligned_u32(offset)?;
        // SAFETY: p is in range and 4-byte aligned.
        Ok(unsafe { AtomicU32::from_ptr(p) }.load(Ordering::Acquire))
    }

    /// Publishes a cursor to the peer.
    pub fn store_u32(&self, offset: usize, value: u32) -> Result<(), ShmError> {
        let p = self.aligned_u32(offset)?;
        // SAFETY: p is in range and 4-byte aligned.
        unsafe { AtomicU32::from_ptr(p) }.store(value, Ordering::Release);
        Ok(())
    }

    /// Single volatile read of a native-endian u32, for header fields that are
    /// validated after reading and must not be re-read afterwards.
    pub fn read_u32_volatile(&self, offset: usize) -> Result<u32, ShmError> {
        let p = self.aligned_u32(offset)?;
        // SAFETY: p is in range and 4-byte aligned.
        Ok(unsafe { ptr::read_volatile(p) })
    }

    pub fn write_u32_volatile(&self, offset: usize, value: u32) -> Result<(), ShmError> {
        let p = self.aligned_u32(offset)?;
        // SAFETY: p is in range and 4-byte aligned.
        unsafe { ptr::write_volatile(p, value) };
        Ok(())
    }

    pub fn read_u16_be(&self, offset: usize) -> Result<u16, ShmError> {
        let mut b = [0u8; 2];
        self.read_bytes(offset, &mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    pub fn write_u16_be(&self, offset: usize, value: u16) -> Result<(), ShmError> {
        self.write_bytes(offset, &value.to_be_bytes())
    }

    fn checked_ptr(&self, offset: usize, len: usize) -> Result<*mut u8, ShmError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.len => {
                // SAFETY: offset <= len of the window, so the result stays in
                // (or one past) the region.
                Ok(unsafe { self.base.as_ptr().add(offset) })
            }
            _ => Err(ShmError::OutOfBounds {
                offset,
                len,
                region: self.len,
            }),
        }
    }

    fn aligned_u32(&self, offset: usize) -> Result<*mut u32, ShmError> {
        let p = self.checked_ptr(offset, 4)?;
        if (p as usize) % 4 != 0 {
            return Err(ShmError::Misaligned { offset, align: 4 });
        }
        Ok(p.cast())
    }
}
