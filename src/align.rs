//! Alignment arithmetic shared by the heap growers and the free list.
//!
//! Every function here takes an alignment that must be a non-zero power of
//! two. Anything else is a programming error and panics.

/// Returns true if `value` is a non-zero power of two.
pub const fn is_power_of_two(value: usize) -> bool {
    value != 0 && (value & (value - 1)) == 0
}

/// Round `value` up to the next multiple of `alignment`, or `None` if that
/// overflows.
pub fn checked_align_up(value: usize, alignment: usize) -> Option<usize> {
    assert!(
        is_power_of_two(alignment),
        "alignment {} is not a power of two",
        alignment
    );
    Some(value.checked_add(alignment - 1)? & !(alignment - 1))
}

/// Round `value` up to the next multiple of `alignment`.
///
/// Panics on overflow.
pub fn align_up(value: usize, alignment: usize) -> usize {
    checked_align_up(value, alignment).expect("align_up overflowed usize")
}

/// Round `value` down to a multiple of `alignment`.
pub fn align_down(value: usize, alignment: usize) -> usize {
    assert!(
        is_power_of_two(alignment),
        "alignment {} is not a power of two",
        alignment
    );
    value & !(alignment - 1)
}

/// Whether `value` is a multiple of `alignment`.
pub fn is_aligned(value: usize, alignment: usize) -> bool {
    align_down(value, alignment) == value
}

/// Bytes to add to `address` to reach the next `alignment` boundary.
pub fn padding_needed(address: usize, alignment: usize) -> usize {
    align_up(address, alignment) - address
}

/// How many objects of `object_size` bytes are needed to hold `bytes`, once
/// `bytes` is rounded up to `alignment`. Returns `None` on overflow.
pub fn unit_count(bytes: usize, object_size: usize, alignment: usize) -> Option<usize> {
    assert!(object_size > 0, "object size must be non-zero");
    let aligned = checked_align_up(bytes, alignment)?;
    Some(aligned / object_size + if aligned % object_size == 0 { 0 } else { 1 })
}

// Round up value to the nearest multiple of increment, which need not be a
// power of two.
#[cfg_attr(not(feature = "use_libc"), allow(dead_code))]
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}
