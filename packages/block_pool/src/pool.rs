use std::alloc::{Layout, handle_alloc_error};
use std::num::NonZero;
use std::ptr::NonNull;

use crate::{AllocError, AllocationPolicy, BlockPoolBuilder, BuildError, Chunk, Result};

/// A slab allocator that hands out fixed-size memory blocks with stable addresses.
///
/// The pool owns a set of chunks, each a contiguous allocation holding `growth` blocks. Unused
/// blocks of all chunks are threaded onto a single intrusive free list, so both
/// [`allocate()`][1] and [`release()`][2] are O(1). When the free list is exhausted, the pool
/// grows by one chunk. Chunks are never released individually - the memory of all chunks is
/// released at once when the pool is dropped.
///
/// The pool is untyped: it deals in raw pointers to memory that satisfies the
/// [block layout][3] given at creation time. It never reads or writes the contents of a block
/// that has been handed out, never drops values stored in blocks and never moves a block.
///
/// # Out of band access
///
/// The pool does not create references to blocks, so it is valid to access block memory via the
/// returned pointers from unsafe code even when not holding a reference to the pool, until the
/// block is released or the pool is dropped.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
/// use std::num::NonZero;
///
/// use block_pool::BlockPool;
///
/// let mut pool = BlockPool::new(Layout::new::<u64>(), NonZero::new(16).unwrap()).unwrap();
///
/// let block = pool.allocate().unwrap().cast::<u64>();
///
/// // SAFETY: The block is valid for writes of a u64 and nobody else is using it.
/// unsafe {
///     block.write(42);
///     assert_eq!(block.read(), 42);
/// }
///
/// // SAFETY: The block came from this pool and has not been released yet.
/// unsafe { pool.release(block.cast()) };
/// ```
///
/// [1]: Self::allocate
/// [2]: Self::release
/// [3]: Self::block_layout
#[derive(Debug)]
pub struct BlockPool {
    /// The layout requested by the caller for each block.
    block_layout: Layout,

    /// The layout of each block as laid out in a chunk. At least as large and as aligned as both
    /// `block_layout` and a free list link, padded so consecutive blocks stay aligned.
    stride_layout: Layout,

    /// The layout of one whole chunk of `growth` blocks.
    chunk_layout: Layout,

    growth: NonZero<usize>,

    allocation_policy: AllocationPolicy,

    chunks: Vec<Chunk>,

    /// Top of the stack of vacant blocks. Each vacant block stores the link to the next one.
    /// Also known as intrusive freelist. `None` if every block of every chunk is handed out.
    free_head: Option<NonNull<VacantBlock>>,

    /// Number of blocks currently handed out to callers.
    allocated: usize,
}

/// What a vacant block contains while it sits on the free list.
#[repr(C)]
#[derive(Clone, Copy)]
struct VacantBlock {
    next: Option<NonNull<VacantBlock>>,
}

impl BlockPool {
    /// Creates a new empty pool with the default allocation policy.
    ///
    /// No memory is allocated until the first block is requested.
    ///
    /// # Errors
    ///
    /// Returns an error if the block layout is zero-sized or if a chunk of `growth` blocks
    /// would not fit in the address space.
    pub fn new(
        block_layout: Layout,
        growth: NonZero<usize>,
    ) -> std::result::Result<Self, BuildError> {
        Self::builder()
            .block_layout(block_layout)
            .growth(growth)
            .build()
    }

    /// Starts building a new [`BlockPool`].
    ///
    /// # Examples
    ///
    /// ```
    /// use std::num::NonZero;
    ///
    /// use block_pool::{AllocationPolicy, BlockPool};
    ///
    /// let pool = BlockPool::builder()
    ///     .block_layout_of::<[u8; 24]>()
    ///     .growth(NonZero::new(8).unwrap())
    ///     .allocation_policy(AllocationPolicy::WarnAndReturnNone)
    ///     .build()
    ///     .unwrap();
    ///
    /// assert_eq!(pool.growth().get(), 8);
    /// assert_eq!(pool.capacity(), 0);
    /// ```
    pub fn builder() -> BlockPoolBuilder {
        BlockPoolBuilder::new()
    }

    pub(crate) fn new_inner(
        block_layout: Layout,
        growth: NonZero<usize>,
        allocation_policy: AllocationPolicy,
    ) -> std::result::Result<Self, BuildError> {
        if block_layout.size() == 0 {
            return Err(BuildError::ZeroSizedBlock);
        }

        let link_layout = Layout::new::<VacantBlock>();

        let stride_layout = Layout::from_size_align(
            block_layout.size().max(link_layout.size()),
            block_layout.align().max(link_layout.align()),
        )
        .map_err(|_| BuildError::PoolTooLarge {
            block_size: block_layout.size(),
            growth: growth.get(),
        })?
        .pad_to_align();

        let chunk_layout = stride_layout
            .size()
            .checked_mul(growth.get())
            .and_then(|size| Layout::from_size_align(size, stride_layout.align()).ok())
            .ok_or(BuildError::PoolTooLarge {
                block_size: stride_layout.size(),
                growth: growth.get(),
            })?;

        Ok(Self {
            block_layout,
            stride_layout,
            chunk_layout,
            growth,
            allocation_policy,
            chunks: Vec::new(),
            free_head: None,
            allocated: 0,
        })
    }

    /// The layout each block satisfies, as requested when the pool was created.
    #[must_use]
    pub fn block_layout(&self) -> Layout {
        self.block_layout
    }

    /// The number of blocks added to the pool each time it grows.
    #[must_use]
    pub fn growth(&self) -> NonZero<usize> {
        self.growth
    }

    /// What the pool does when the memory allocator cannot provide a new chunk.
    #[must_use]
    pub fn allocation_policy(&self) -> AllocationPolicy {
        self.allocation_policy
    }

    /// The number of blocks currently handed out.
    #[must_use]
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    pub fn len(&self) -> usize {
        self.allocated
    }

    /// Whether no blocks are currently handed out.
    ///
    /// An empty pool may still be holding memory for vacant blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    /// The number of chunks the pool has grown so far.
    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// The total number of blocks the pool holds memory for, whether handed out or vacant.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.chunks
            .len()
            .checked_mul(self.growth.get())
            .expect("guarded by chunk layout size calculation - total blocks cannot exceed virtual memory")
    }

    /// The number of blocks that can be handed out without growing the pool.
    #[must_use]
    pub fn vacant(&self) -> usize {
        self.capacity()
            .checked_sub(self.allocated)
            .expect("cannot have more blocks handed out than the pool has capacity for")
    }

    /// Hands out one block.
    ///
    /// The returned pointer is aligned and sized for the [block layout][1] and remains valid
    /// and at the same address until it is passed to [`release()`][2] or the pool is dropped.
    /// The contents of the block are uninitialized.
    ///
    /// If there are no vacant blocks, the pool first grows by [`growth()`][3] blocks.
    ///
    /// # Errors
    ///
    /// Returns an error if the pool needed to grow but the memory allocator could not provide
    /// the memory and the [allocation policy][4] permits reporting this to the caller.
    ///
    /// [1]: Self::block_layout
    /// [2]: Self::release
    /// [3]: Self::growth
    /// [4]: AllocationPolicy
    pub fn allocate(&mut self) -> Result<NonNull<u8>> {
        let block = match self.free_head {
            Some(block) => block,
            None => self.grow()?,
        };

        // SAFETY: Every block on the free list was initialized as a VacantBlock when it was
        // pushed onto the list and nobody else has access to vacant blocks.
        self.free_head = unsafe { block.read() }.next;

        self.allocated = self
            .allocated
            .checked_add(1)
            .expect("guarded by chunk layout size calculation - total blocks cannot exceed virtual memory");

        Ok(block.cast())
    }

    /// Returns a block to the pool, making it available to future [`allocate()`][1] calls.
    ///
    /// The contents of the block are not dropped.
    ///
    /// # Safety
    ///
    /// The pointer must have been returned by [`allocate()`][1] on this same pool and must not
    /// have been released since. The caller must not access the block after this call.
    ///
    /// # Panics
    ///
    /// In debug builds, panics if the pointer does not point to the start of a block owned by
    /// this pool.
    ///
    /// [1]: Self::allocate
    pub unsafe fn release(&mut self, block: NonNull<u8>) {
        debug_assert!(
            self.owns(block),
            "released pointer {block:p} does not point to a block of this pool"
        );

        let block = block.cast::<VacantBlock>();

        // SAFETY: The caller guarantees the block is from this pool, so it is valid for writes of
        // a VacantBlock (stride layout covers it) and nobody else is using it any more.
        unsafe {
            block.write(VacantBlock {
                next: self.free_head,
            });
        }

        self.free_head = Some(block);

        self.allocated = self
            .allocated
            .checked_sub(1)
            .expect("released more blocks than were handed out - double release is not allowed");
    }

    /// Grows the pool until at least `additional` blocks are vacant.
    ///
    /// # Errors
    ///
    /// Returns an error if a new chunk was needed but the memory allocator could not provide
    /// the memory and the [allocation policy][AllocationPolicy] permits reporting this. Chunks
    /// allocated before the failure are kept.
    #[cfg_attr(test, mutants::skip)] // Can be mutated to infinitely growing memory use.
    pub fn reserve(&mut self, additional: usize) -> Result<()> {
        while self.vacant() < additional {
            let first = self.grow()?;

            // grow() hands back the new chunk's first block detached from the free list so that
            // allocate() can serve it directly. We are not serving it, so put it back.
            //
            // SAFETY: The block is vacant, part of this pool and valid for writes of a link.
            unsafe {
                first.write(VacantBlock {
                    next: self.free_head,
                });
            }
            self.free_head = Some(first);
        }

        Ok(())
    }

    /// Whether `ptr` points to the start of a block in one of this pool's chunks.
    ///
    /// This does not tell whether the block is currently handed out or vacant.
    #[must_use]
    pub fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.chunks.iter().any(|chunk| {
            chunk
                .offset_of(ptr)
                .is_some_and(|offset| offset % self.stride_layout.size() == 0)
        })
    }

    /// Allocates a new chunk, pushes all its blocks except the first onto the free list and
    /// returns the first block (still formatted as a vacant block) to the caller.
    fn grow(&mut self) -> Result<NonNull<VacantBlock>> {
        let Some(chunk) = Chunk::allocate(self.chunk_layout) else {
            return Err(self.allocation_failed());
        };

        let stride = self.stride_layout.size();

        // Push in reverse so blocks are handed out in address order, lowest first.
        for index in (0..self.growth.get()).rev() {
            let offset = index
                .checked_mul(stride)
                .expect("guarded by chunk layout size calculation");

            let block = chunk.block_at(offset).cast::<VacantBlock>();

            // SAFETY: The block is inside the freshly allocated chunk, aligned for VacantBlock
            // (stride layout guarantees it) and not in use by anyone.
            unsafe {
                block.write(VacantBlock {
                    next: self.free_head,
                });
            }

            self.free_head = Some(block);
        }

        self.chunks.push(chunk);

        tracing::trace!(
            block_size = self.block_layout.size(),
            chunks = self.chunks.len(),
            capacity = self.capacity(),
            "block pool grew by one chunk"
        );

        let first = self
            .free_head
            .expect("we just pushed at least one block because growth is non-zero");

        // SAFETY: We just initialized this block as a VacantBlock above.
        self.free_head = unsafe { first.read() }.next;

        Ok(first)
    }

    #[cfg_attr(test, mutants::skip)] // Abort path cannot be tested in-process.
    fn allocation_failed(&self) -> AllocError {
        match self.allocation_policy {
            AllocationPolicy::Abort => handle_alloc_error(self.chunk_layout),
            AllocationPolicy::ReturnNone => {}
            AllocationPolicy::WarnAndReturnNone => {
                tracing::warn!(
                    chunk_size = self.chunk_layout.size(),
                    chunk_align = self.chunk_layout.align(),
                    "block pool failed to allocate a new chunk"
                );
            }
        }

        AllocError::new(self.chunk_layout)
    }

    #[cfg_attr(test, mutants::skip)] // This is essentially test logic, mutation is meaningless.
    #[cfg(test)]
    #[must_use]
    pub(crate) fn free_list_len(&self) -> usize {
        let mut count: usize = 0;
        let mut cursor = self.free_head;

        while let Some(block) = cursor {
            assert!(
                self.owns(block.cast()),
                "free list entry {block:p} does not point to a block of this pool"
            );

            count = count
                .checked_add(1)
                .expect("free list cannot be longer than the pool capacity");

            // SAFETY: Every block on the free list is initialized as a VacantBlock.
            cursor = unsafe { block.read() }.next;
        }

        count
    }
}

// SAFETY: The raw pointers only point into memory owned by the pool itself and the pool never
// accesses the contents of blocks that are handed out, so it can move between threads freely.
unsafe impl Send for BlockPool {}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::collections::HashSet;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(BlockPool: Send, std::fmt::Debug);
    assert_not_impl_any!(BlockPool: Sync);

    fn pool_of<T>(growth: usize) -> BlockPool {
        BlockPool::new(Layout::new::<T>(), NonZero::new(growth).unwrap()).unwrap()
    }

    #[test]
    fn smoke_test() {
        let mut pool = pool_of::<u64>(4);

        assert_eq!(pool.capacity(), 0);
        assert!(pool.is_empty());

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();

        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.capacity(), 4);
        assert_eq!(pool.chunk_count(), 1);
        assert_eq!(pool.vacant(), 2);

        // SAFETY: Both blocks came from this pool and are released once.
        unsafe {
            pool.release(a);
            pool.release(b);
        }

        assert!(pool.is_empty());
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn grows_when_exhausted() {
        let mut pool = pool_of::<u64>(4);

        let blocks = (0..5).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>();

        assert_eq!(pool.chunk_count(), 2);
        assert_eq!(pool.capacity(), 8);
        assert_eq!(pool.len(), 5);

        let unique = blocks.iter().copied().collect::<HashSet<_>>();
        assert_eq!(unique.len(), 5);
    }

    #[test]
    fn released_block_is_reused_first() {
        let mut pool = pool_of::<u32>(8);

        let _a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let _c = pool.allocate().unwrap();

        // SAFETY: b came from this pool and is released once.
        unsafe { pool.release(b) };

        assert_eq!(pool.allocate().unwrap(), b);
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn blocks_are_aligned_and_writable() {
        #[repr(align(64))]
        struct Aligned([u8; 3]);

        let mut pool = pool_of::<Aligned>(3);

        for _ in 0..7 {
            let block = pool.allocate().unwrap().cast::<Aligned>();
            assert!(block.is_aligned());

            // SAFETY: Block is sized and aligned for Aligned.
            unsafe { block.write(Aligned([1, 2, 3])) };
        }
    }

    #[test]
    fn tiny_blocks_still_fit_free_list_link() {
        let mut pool = pool_of::<u8>(16);

        let blocks = (0..16).map(|_| pool.allocate().unwrap()).collect::<Vec<_>>();

        for (index, block) in blocks.iter().enumerate() {
            // SAFETY: Each block is valid for writes of a u8.
            unsafe { block.write(u8::try_from(index).unwrap()) };
        }

        for block in blocks.iter().rev() {
            // SAFETY: Each block came from this pool and is released once.
            unsafe { pool.release(*block) };
        }

        assert_eq!(pool.free_list_len(), 16);
        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn owns_recognizes_blocks() {
        let mut pool = pool_of::<u64>(4);
        let mut other = pool_of::<u64>(4);

        let mine = pool.allocate().unwrap();
        let theirs = other.allocate().unwrap();

        assert!(pool.owns(mine));
        assert!(!pool.owns(theirs));

        // SAFETY: Still inside the same chunk, just not at a block boundary.
        let misaligned = unsafe { mine.add(1) };
        assert!(!pool.owns(misaligned));
    }

    #[test]
    fn reserve_grows_without_handing_out() {
        let mut pool = pool_of::<u64>(4);

        pool.reserve(9).unwrap();

        assert_eq!(pool.chunk_count(), 3);
        assert_eq!(pool.vacant(), 12);
        assert_eq!(pool.free_list_len(), 12);
        assert!(pool.is_empty());

        for _ in 0..12 {
            _ = pool.allocate().unwrap();
        }

        assert_eq!(pool.chunk_count(), 3);
    }

    #[test]
    fn reserve_noop_when_enough_vacant() {
        let mut pool = pool_of::<u64>(4);

        pool.reserve(4).unwrap();
        pool.reserve(2).unwrap();

        assert_eq!(pool.chunk_count(), 1);
    }

    #[test]
    fn zero_sized_block_is_error() {
        let result = BlockPool::new(Layout::new::<()>(), NonZero::new(4).unwrap());

        assert_eq!(result.unwrap_err(), BuildError::ZeroSizedBlock);
    }

    #[test]
    fn oversized_chunk_is_error() {
        let result = BlockPool::new(Layout::new::<u64>(), NonZero::new(usize::MAX).unwrap());

        assert!(matches!(result, Err(BuildError::PoolTooLarge { .. })));
    }

    #[test]
    fn independent_pools_do_not_share_blocks() {
        let mut a = pool_of::<u64>(2);
        let mut b = pool_of::<u64>(2);

        let from_a = a.allocate().unwrap();

        // SAFETY: from_a came from a and is released once.
        unsafe { a.release(from_a) };

        let from_b = b.allocate().unwrap();
        assert!(!a.owns(from_b));
        assert!(b.owns(from_b));
    }
}
