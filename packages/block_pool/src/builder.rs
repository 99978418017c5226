use std::alloc::Layout;
use std::num::NonZero;

use crate::{AllocationPolicy, BlockPool, BuildError};

/// Number of blocks in each chunk if the caller does not specify otherwise.
#[cfg(not(miri))]
const DEFAULT_GROWTH: NonZero<usize> = NonZero::new(64).unwrap();

// Under Miri, we use a smaller growth because Miri test runtime scales by memory usage.
#[cfg(miri)]
const DEFAULT_GROWTH: NonZero<usize> = NonZero::new(4).unwrap();

/// Builder for creating an instance of [`BlockPool`].
///
/// The block layout must always be specified. Everything else has a sensible default.
///
/// # Examples
///
/// ```
/// use std::alloc::Layout;
/// use std::num::NonZero;
///
/// use block_pool::{AllocationPolicy, BlockPool};
///
/// let pool = BlockPool::builder()
///     .block_layout(Layout::new::<[u32; 4]>())
///     .growth(NonZero::new(32).unwrap())
///     .allocation_policy(AllocationPolicy::ReturnNone)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.block_layout(), Layout::new::<[u32; 4]>());
/// ```
#[derive(Debug)]
#[must_use]
pub struct BlockPoolBuilder {
    block_layout: Option<Layout>,
    growth: NonZero<usize>,
    allocation_policy: AllocationPolicy,
}

impl BlockPoolBuilder {
    pub(crate) fn new() -> Self {
        Self {
            block_layout: None,
            growth: DEFAULT_GROWTH,
            allocation_policy: AllocationPolicy::default(),
        }
    }

    /// Sets the memory layout every block must satisfy.
    pub fn block_layout(mut self, layout: Layout) -> Self {
        self.block_layout = Some(layout);
        self
    }

    /// Sets the block layout to that of `T`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::alloc::Layout;
    ///
    /// use block_pool::BlockPool;
    ///
    /// let pool = BlockPool::builder().block_layout_of::<String>().build().unwrap();
    ///
    /// assert_eq!(pool.block_layout(), Layout::new::<String>());
    /// ```
    pub fn block_layout_of<T>(self) -> Self {
        self.block_layout(Layout::new::<T>())
    }

    /// Sets how many blocks each newly grown chunk holds.
    ///
    /// Larger values mean fewer (but larger) memory allocations as the pool grows.
    pub fn growth(mut self, growth: NonZero<usize>) -> Self {
        self.growth = growth;
        self
    }

    /// Sets the [allocation policy][AllocationPolicy] that governs what happens when the
    /// memory allocator cannot provide a new chunk.
    pub fn allocation_policy(mut self, policy: AllocationPolicy) -> Self {
        self.allocation_policy = policy;
        self
    }

    /// Builds the block pool with the specified configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if no block layout was set, if the block layout is zero-sized or if a
    /// chunk would not fit in the address space.
    pub fn build(self) -> Result<BlockPool, BuildError> {
        let layout = self.block_layout.ok_or(BuildError::MissingLayout)?;

        BlockPool::new_inner(layout, self.growth, self.allocation_policy)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(BlockPoolBuilder: Send, Sync, std::fmt::Debug);

    #[test]
    fn defaults() {
        let builder = BlockPoolBuilder::new();

        assert!(builder.block_layout.is_none());
        assert_eq!(builder.growth, DEFAULT_GROWTH);
        assert_eq!(builder.allocation_policy, AllocationPolicy::Abort);
    }

    #[test]
    fn missing_layout_is_error() {
        let result = BlockPoolBuilder::new().build();

        assert_eq!(result.unwrap_err(), BuildError::MissingLayout);
    }

    #[test]
    fn settings_reach_pool() {
        let pool = BlockPoolBuilder::new()
            .block_layout_of::<u128>()
            .growth(NonZero::new(3).unwrap())
            .allocation_policy(AllocationPolicy::WarnAndReturnNone)
            .build()
            .unwrap();

        assert_eq!(pool.block_layout(), Layout::new::<u128>());
        assert_eq!(pool.growth().get(), 3);
        assert_eq!(
            pool.allocation_policy(),
            AllocationPolicy::WarnAndReturnNone
        );
    }

    #[test]
    fn layout_can_be_overridden() {
        let pool = BlockPoolBuilder::new()
            .block_layout_of::<u8>()
            .block_layout_of::<u64>()
            .build()
            .unwrap();

        assert_eq!(pool.block_layout(), Layout::new::<u64>());
    }
}
