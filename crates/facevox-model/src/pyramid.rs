//! Size and channel schedules shared by the strided pyramids.
//!
//! Every pyramid in this crate works between a 4-cell base and a target size
//! `4 · 2^k`, halving or doubling once per stage.

use facevox_core::{Error, Result};

/// Spatial size at the narrow end of every pyramid
pub const BASE_SIZE: usize = 4;

/// Number of stride-2 stages between `BASE_SIZE` and `size`.
///
/// `size` must be `4 · 2^k` with `k ≥ 1`.
pub fn depth(size: usize, context: &str) -> Result<usize> {
    if size < 2 * BASE_SIZE || size % BASE_SIZE != 0 || !(size / BASE_SIZE).is_power_of_two() {
        return Err(Error::ShapeMismatch {
            context: format!("{}: size must be 4·2^k with k ≥ 1", context),
            expected: vec![2 * BASE_SIZE],
            actual: vec![size],
        });
    }
    Ok((size / BASE_SIZE).trailing_zeros() as usize)
}

/// Channel width `base · 2^level`, capped at `max`
pub fn widen(base: usize, level: usize, max: usize) -> usize {
    base.checked_shl(level as u32)
        .filter(|&c| c != 0 && c <= max)
        .unwrap_or(max)
}
