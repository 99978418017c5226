use std::marker::PhantomData;
use std::num::NonZero;

use block_pool::{AllocationPolicy, BlockPool};

use crate::{BuildError, DropPolicy, IdTree};

/// Smallest supported number of ID bits consumed per tree level.
pub const MIN_FAN_OUT_BITS: u32 = 1;

/// Largest supported number of ID bits consumed per tree level.
///
/// A page holds `1 << fan_out_bits` links, so this caps a page at 65536 links.
pub const MAX_FAN_OUT_BITS: u32 = 16;

/// Number of ID bits consumed per tree level if the caller does not specify otherwise.
///
/// Values in the 4..=8 range work well: larger values make the tree shallower but every page
/// wider, which costs memory when IDs are sparse.
pub const DEFAULT_FAN_OUT_BITS: u32 = 6;

/// IDs at or above this value are reported via a `tracing` warning unless configured otherwise.
pub const DEFAULT_LARGE_ID_WARNING: u32 = 1 << 24;

#[cfg(not(miri))]
const DEFAULT_ELEMENT_GROWTH: NonZero<usize> = NonZero::new(64).unwrap();

// Under Miri, we use a smaller growth because Miri test runtime scales by memory usage.
#[cfg(miri)]
const DEFAULT_ELEMENT_GROWTH: NonZero<usize> = NonZero::new(4).unwrap();

/// Builder for creating an instance of [`IdTree`].
///
/// You only need to use this builder if you want to customize the tree configuration.
/// The default configuration used by [`IdTree::new()`][1] is sufficient for most use cases.
///
/// # Examples
///
/// ```
/// use std::num::NonZero;
///
/// use id_tree::{AllocationPolicy, IdTree};
///
/// let tree = IdTree::<u64>::builder()
///     .fan_out_bits(8)
///     .element_growth(NonZero::new(256).unwrap())
///     .allocation_policy(AllocationPolicy::ReturnNone)
///     .large_id_warning(None)
///     .build()
///     .unwrap();
///
/// assert_eq!(tree.fan_out_bits(), 8);
/// ```
///
/// [1]: IdTree::new
#[must_use]
pub struct IdTreeBuilder<T> {
    element_growth: NonZero<usize>,
    fan_out_bits: u32,
    allocation_policy: AllocationPolicy,
    drop_policy: DropPolicy,
    large_id_warning: Option<u32>,

    _item: PhantomData<T>,
}

impl<T> std::fmt::Debug for IdTreeBuilder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdTreeBuilder")
            .field(
                "item_type",
                &std::format_args!("{}", std::any::type_name::<T>()),
            )
            .field("element_growth", &self.element_growth)
            .field("fan_out_bits", &self.fan_out_bits)
            .field("allocation_policy", &self.allocation_policy)
            .field("drop_policy", &self.drop_policy)
            .field("large_id_warning", &self.large_id_warning)
            .finish()
    }
}

impl<T> IdTreeBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            element_growth: DEFAULT_ELEMENT_GROWTH,
            fan_out_bits: DEFAULT_FAN_OUT_BITS,
            allocation_policy: AllocationPolicy::default(),
            drop_policy: DropPolicy::default(),
            large_id_warning: Some(DEFAULT_LARGE_ID_WARNING),
            _item: PhantomData,
        }
    }

    /// Sets how many element slots the element storage grows by when it runs out of room.
    pub fn element_growth(mut self, growth: NonZero<usize>) -> Self {
        self.element_growth = growth;
        self
    }

    /// Sets the number of ID bits consumed per tree level.
    ///
    /// Must be in [`MIN_FAN_OUT_BITS`]..=[`MAX_FAN_OUT_BITS`]; this is validated by
    /// [`build()`][Self::build].
    pub fn fan_out_bits(mut self, bits: u32) -> Self {
        self.fan_out_bits = bits;
        self
    }

    /// Sets the [allocation policy][AllocationPolicy] that governs what happens when the
    /// element storage cannot grow.
    pub fn allocation_policy(mut self, policy: AllocationPolicy) -> Self {
        self.allocation_policy = policy;
        self
    }

    /// Sets the [drop policy][DropPolicy] for the tree. This governs how
    /// to treat remaining elements in the tree when the tree is dropped.
    pub fn drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = policy;
        self
    }

    /// Sets the ID at or above which insertions are reported via a `tracing` warning.
    ///
    /// `None` disables the warning. The warning never changes how the tree behaves.
    pub fn large_id_warning(mut self, threshold: Option<u32>) -> Self {
        self.large_id_warning = threshold;
        self
    }

    /// Builds the tree with the specified configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `T` is zero-sized or if the fan-out bits are out of range.
    pub fn build(self) -> Result<IdTree<T>, BuildError> {
        if size_of::<T>() == 0 {
            return Err(BuildError::ZeroSizedElement);
        }

        if !(MIN_FAN_OUT_BITS..=MAX_FAN_OUT_BITS).contains(&self.fan_out_bits) {
            return Err(BuildError::FanOutBitsOutOfRange {
                bits: self.fan_out_bits,
            });
        }

        let elements = BlockPool::builder()
            .block_layout_of::<T>()
            .growth(self.element_growth)
            .allocation_policy(self.allocation_policy)
            .build()?;

        Ok(IdTree::new_inner(
            elements,
            self.fan_out_bits,
            self.drop_policy,
            self.large_id_warning,
        ))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(IdTreeBuilder<String>: Send, Sync, std::fmt::Debug);

    #[test]
    fn defaults() {
        let builder = IdTreeBuilder::<u32>::new();

        assert_eq!(builder.element_growth, DEFAULT_ELEMENT_GROWTH);
        assert_eq!(builder.fan_out_bits, DEFAULT_FAN_OUT_BITS);
        assert_eq!(builder.allocation_policy, AllocationPolicy::Abort);
        assert_eq!(builder.drop_policy, DropPolicy::MayDropItems);
        assert_eq!(builder.large_id_warning, Some(DEFAULT_LARGE_ID_WARNING));
    }

    #[test]
    fn zero_sized_element_is_error() {
        let result = IdTreeBuilder::<()>::new().build();

        assert_eq!(result.unwrap_err(), BuildError::ZeroSizedElement);
    }

    #[test]
    fn fan_out_bits_are_validated() {
        for bits in [0, 17, 32, u32::MAX] {
            let result = IdTreeBuilder::<u32>::new().fan_out_bits(bits).build();

            assert_eq!(
                result.unwrap_err(),
                BuildError::FanOutBitsOutOfRange { bits }
            );
        }

        for bits in MIN_FAN_OUT_BITS..=MAX_FAN_OUT_BITS {
            let tree = IdTreeBuilder::<u32>::new().fan_out_bits(bits).build().unwrap();

            assert_eq!(tree.fan_out_bits(), bits);
        }
    }

    #[test]
    fn oversized_element_growth_is_error() {
        let result = IdTreeBuilder::<u64>::new()
            .element_growth(NonZero::new(usize::MAX).unwrap())
            .build();

        assert!(matches!(result, Err(BuildError::ElementPool(_))));
    }

    #[test]
    fn debug_names_item_type() {
        let builder = IdTreeBuilder::<String>::new();

        assert!(format!("{builder:?}").contains("String"));
    }
}
