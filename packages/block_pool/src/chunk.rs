use std::alloc::{Layout, alloc, dealloc};
use std::ptr::NonNull;

/// One contiguous memory allocation divided into a fixed number of equally sized blocks.
///
/// A chunk does not know which of its blocks are in use - that is tracked by the free list of the
/// owning pool. It only owns the memory and releases it when dropped.
#[derive(Debug)]
pub(crate) struct Chunk {
    first_block_ptr: NonNull<u8>,

    /// Layout of the entire chunk, i.e. `block_count` blocks of the pool's block stride.
    layout: Layout,
}

impl Chunk {
    /// Allocates the memory for a new chunk.
    ///
    /// Returns `None` if the memory allocator could not satisfy the request.
    #[must_use]
    pub(crate) fn allocate(layout: Layout) -> Option<Self> {
        debug_assert!(layout.size() > 0, "chunk layout must not be zero-sized");

        // SAFETY: The layout is not zero-sized, as guaranteed by the pool that validated the
        // block layout and growth count when it was built.
        let ptr = unsafe { alloc(layout) };

        NonNull::new(ptr).map(|first_block_ptr| Self {
            first_block_ptr,
            layout,
        })
    }

    /// Pointer to the start of the block at `offset` bytes from the start of the chunk.
    ///
    /// # Panics
    ///
    /// Panics if the offset is outside the chunk.
    #[must_use]
    pub(crate) fn block_at(&self, offset: usize) -> NonNull<u8> {
        assert!(
            offset < self.layout.size(),
            "block offset {offset} out of bounds in chunk of {} bytes",
            self.layout.size()
        );

        // SAFETY: Guarded by bounds check above, so the pointer stays within the allocation.
        unsafe { self.first_block_ptr.add(offset) }
    }

    /// Returns the byte offset of `ptr` from the start of the chunk, if the pointer is inside it.
    #[must_use]
    pub(crate) fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let start = self.first_block_ptr.as_ptr().addr();
        let offset = ptr.as_ptr().addr().checked_sub(start)?;

        (offset < self.layout.size()).then_some(offset)
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        // SAFETY: The layout must match between alloc and dealloc. It does.
        unsafe {
            dealloc(self.first_block_ptr.as_ptr(), self.layout);
        }
    }
}
