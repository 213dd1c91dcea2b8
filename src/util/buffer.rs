//! Memory-aligned buffers for direct IO
//!
//! Requests against descriptors opened with O_DIRECT need the buffer address
//! (as well as length and offset) aligned to the device block size, which a
//! plain `Vec<u8>` does not guarantee.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

/// Zero-initialised heap buffer with a guaranteed alignment
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    size: usize,
    layout: Layout,
}

impl AlignedBuffer {
    /// Allocate `size` zeroed bytes aligned to `alignment`
    ///
    /// A zero-sized buffer allocates nothing but still reports an aligned
    /// address, so it can back zero-length requests.
    ///
    /// # Panics
    /// Panics if alignment is not a power of 2 or if allocation fails
    pub fn new(size: usize, alignment: usize) -> Self {
        assert!(alignment.is_power_of_two(), "Alignment must be a power of 2");

        let layout = Layout::from_size_align(size, alignment)
            .expect("Invalid layout parameters");

        let ptr = if size == 0 {
            // Aligned, non-null, never dereferenced
            NonNull::new(alignment as *mut u8).expect("alignment is non-zero")
        } else {
            let raw = unsafe { alloc_zeroed(layout) };
            NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout))
        };

        AlignedBuffer { ptr, size, layout }
    }

    /// Get a raw pointer to the buffer
    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    /// Get a mutable raw pointer to the buffer
    #[inline(always)]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Get the buffer as a slice
    #[inline(always)]
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Get the buffer as a mutable slice
    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }

    /// Size of the buffer in bytes
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Alignment the buffer was allocated with
    #[inline(always)]
    pub fn alignment(&self) -> usize {
        self.layout.align()
    }

    #[inline(always)]
    pub fn is_aligned(&self) -> bool {
        (self.ptr.as_ptr() as usize) % self.layout.align() == 0
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        if self.size > 0 {
            unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
        }
    }
}

// AlignedBuffer is Send because it owns its memory
unsafe impl Send for AlignedBuffer {}
