//! Bit-path arithmetic shared by the tree operations.
//!
//! A page whose least significant indexed bit is `lsb` uses bits `lsb..lsb + fan_out_bits` of
//! an ID to pick one of its slots. Leaf pages have `lsb == 0`.

use num_integer::Integer;

/// Extracts the slot index that `id` occupies in a page indexing bits starting at `lsb`.
///
/// Example: `slot_index(0xfead, 8, 4) == 0xe`, i.e. the third nibble from the right.
#[must_use]
pub(crate) fn slot_index(id: u32, lsb: u32, fan_out_bits: u32) -> usize {
    let shifted = id.checked_shr(lsb).unwrap_or(0);
    let mask = 1_u32
        .checked_shl(fan_out_bits)
        .map_or(u32::MAX, |span| span.wrapping_sub(1));

    usize::try_from(shifted & mask).expect("u32 always fits in usize on supported targets")
}

/// Number of tree levels needed to address `id`, never less than one.
#[must_use]
pub(crate) fn levels_for(id: u32, fan_out_bits: u32) -> u32 {
    let significant_bits = u32::BITS.wrapping_sub(id.leading_zeros());

    Integer::div_ceil(&significant_bits, &fan_out_bits).max(1)
}

/// Clears every bit of `id` below bit position `bit`.
#[must_use]
pub(crate) fn keep_above(id: u32, bit: u32) -> u32 {
    id.checked_shr(bit)
        .and_then(|high| high.checked_shl(bit))
        .unwrap_or(0)
}

/// The ID bits contributed by occupying `slot` in a page indexing bits starting at `lsb`.
#[must_use]
pub(crate) fn slot_bits(slot: usize, lsb: u32) -> u32 {
    let slot = u32::try_from(slot).expect("page slots are bounded by the 16-bit fan-out limit");

    slot.checked_shl(lsb)
        .expect("page least significant bit is always below the key width")
}
