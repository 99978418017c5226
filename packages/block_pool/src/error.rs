use std::alloc::Layout;

use thiserror::Error;

/// The underlying memory allocator could not provide memory for a new pool of blocks.
///
/// This is only ever returned when the [`AllocationPolicy`][crate::AllocationPolicy] of the
/// block pool permits allocation failures to be reported to the caller.
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("failed to allocate a pool of {} bytes with alignment {}", .layout.size(), .layout.align())]
pub struct AllocError {
    layout: Layout,
}

impl AllocError {
    #[must_use]
    pub(crate) fn new(layout: Layout) -> Self {
        Self { layout }
    }

    /// The layout of the pool allocation that failed.
    #[must_use]
    pub fn layout(&self) -> Layout {
        self.layout
    }
}

/// Errors that can occur when building a [`BlockPool`][crate::BlockPool].
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum BuildError {
    /// No block layout was specified before building.
    #[error("block layout must be set via block_layout() or block_layout_of() before building")]
    MissingLayout,

    /// The block layout has a size of zero bytes.
    #[error("block pool must have non-zero block size")]
    ZeroSizedBlock,

    /// A pool of the requested number of blocks would not fit in the address space.
    #[error("a pool of {growth} blocks of {block_size} bytes does not fit in the address space")]
    PoolTooLarge {
        /// Size of one block in bytes, including free list bookkeeping.
        block_size: usize,

        /// Number of blocks in one pool.
        growth: usize,
    },
}

/// A specialized `Result` type for block pool operations, returning the crate's
/// [`AllocError`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, AllocError>;

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::fmt::Debug;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(AllocError: Send, Sync, Debug, Copy);
    assert_impl_all!(BuildError: Send, Sync, Debug, Copy);

    #[test]
    fn alloc_error_reports_layout() {
        let layout = Layout::from_size_align(4096, 16).unwrap();
        let error = AllocError::new(layout);

        assert_eq!(error.layout(), layout);
        assert_eq!(
            error.to_string(),
            "failed to allocate a pool of 4096 bytes with alignment 16"
        );
    }

    #[test]
    fn pool_too_large_message() {
        let error = BuildError::PoolTooLarge {
            block_size: 8,
            growth: usize::MAX,
        };

        assert!(error.to_string().contains("does not fit in the address space"));
    }
}
