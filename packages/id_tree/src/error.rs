use block_pool::AllocError;
use thiserror::Error;

/// Errors that can occur when inserting elements into an [`IdTree`][crate::IdTree].
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum Error {
    /// The element storage needed to grow but no memory was available.
    ///
    /// Only returned when the tree's [`AllocationPolicy`][crate::AllocationPolicy] permits
    /// reporting allocation failures. The tree is left exactly as it was before the call.
    #[error("failed to allocate element storage")]
    Allocation(#[from] AllocError),

    /// An element was appended but the largest possible ID has already been used.
    #[error("no IDs remain after the largest possible ID {}", u32::MAX)]
    IdSpaceExhausted,
}

/// Errors that can occur when building an [`IdTree`][crate::IdTree].
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[non_exhaustive]
pub enum BuildError {
    /// The element type has a size of zero bytes.
    #[error("id tree must have non-zero element size")]
    ZeroSizedElement,

    /// The number of ID bits consumed per tree level is outside the supported range.
    #[error("fan-out bits must be in {}..={} but was {bits}", crate::MIN_FAN_OUT_BITS, crate::MAX_FAN_OUT_BITS)]
    FanOutBitsOutOfRange {
        /// The rejected value.
        bits: u32,
    },

    /// The element storage could not be configured.
    #[error("invalid element storage configuration")]
    ElementPool(#[from] block_pool::BuildError),
}

/// A specialized `Result` type for id tree operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
