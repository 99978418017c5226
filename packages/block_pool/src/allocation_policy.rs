/// Determines what happens when the underlying memory allocator cannot provide a new pool.
///
/// By default, the process is aborted via [`std::alloc::handle_alloc_error()`], which is how the
/// standard library collections treat memory exhaustion.
///
/// # Examples
///
/// ```
/// use block_pool::{AllocationPolicy, BlockPool};
///
/// let pool = BlockPool::builder()
///     .block_layout_of::<u64>()
///     .allocation_policy(AllocationPolicy::ReturnNone)
///     .build()
///     .unwrap();
///
/// assert_eq!(pool.allocation_policy(), AllocationPolicy::ReturnNone);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum AllocationPolicy {
    /// The process is aborted through the global allocation error handler. This is the default.
    #[default]
    Abort,

    /// The allocation fails with an [`AllocError`][crate::AllocError] and nothing is reported.
    ReturnNone,

    /// A warning is emitted via `tracing`, after which the allocation fails with an
    /// [`AllocError`][crate::AllocError].
    WarnAndReturnNone,
}
