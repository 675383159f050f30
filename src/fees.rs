//! Fee-growth accounting for concentrated-liquidity positions.
//!
//! All X128 accumulators live in Z_2^256: the pool contract lets them
//! overflow and every subtraction here must wrap the same way, otherwise
//! long-lived pools produce garbage deltas.

use alloy_primitives::U256;
use tracing::warn;

/// Fee growth accumulated inside a tick range, derived from the global
/// accumulator and the two boundary ticks' `feeGrowthOutside` values.
///
/// The boundary values flip meaning depending on which side of the range the
/// current tick sits, giving three regions:
/// below the range (`current < lower`), above it (`current >= upper`), and
/// inside it.
pub fn fee_growth_inside(
    global_x128: U256,
    lower_outside_x128: U256,
    upper_outside_x128: U256,
    tick_lower: i32,
    tick_upper: i32,
    tick_current: i32,
) -> U256 {
    if tick_current < tick_lower {
        lower_outside_x128.wrapping_sub(upper_outside_x128)
    } else if tick_current >= tick_upper {
        upper_outside_x128.wrapping_sub(lower_outside_x128)
    } else {
        global_x128
            .wrapping_sub(lower_outside_x128)
            .wrapping_sub(upper_outside_x128)
    }
}

/// Growth since the position's last checkpoint.
///
/// A checkpoint ahead of the current inside value means the boundary ticks
/// were re-initialized between observations; the wrapped subtraction would
/// yield an astronomically large bogus delta. With `skip_inconsistent` the
/// observation is dropped (`None`), otherwise the wrapped value is returned
/// as the contract itself would compute it.
pub fn fee_delta(inside_x128: U256, last_x128: U256, skip_inconsistent: bool) -> Option<U256> {
    if skip_inconsistent && last_x128 > inside_x128 {
        warn!(
            "fee growth checkpoint ahead of current inside value ({last_x128} > {inside_x128}), skipping"
        );
        return None;
    }
    Some(inside_x128.wrapping_sub(last_x128))
}

/// Raw token amount owed for a growth delta: `liquidity * delta / 2^128`.
/// The low-limb product always fits in 256 bits; the high-limb term wraps
/// mod 2^256 like the accumulators it derives from.
pub fn fee_token_amount(liquidity: u128, delta_x128: U256) -> U256 {
    let l = U256::from(liquidity);
    let hi = delta_x128 >> 128;
    let lo = delta_x128 & U256::from(u128::MAX);
    l.wrapping_mul(hi).wrapping_add((l * lo) >> 128)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x128(v: u64) -> U256 {
        U256::from(v) << 128
    }

    #[test]
    fn inside_region_subtracts_both_boundaries() {
        // current tick between the boundaries: global 1000, outside 200 + 50.
        let inside = fee_growth_inside(x128(1000), x128(200), x128(50), -100, 100, 50);
        assert_eq!(inside, x128(750));
    }

    #[test]
    fn below_range_uses_lower_minus_upper() {
        let inside = fee_growth_inside(x128(1000), x128(200), x128(50), -100, 100, -200);
        assert_eq!(inside, x128(150));
    }

    #[test]
    fn at_or_above_upper_uses_upper_minus_lower() {
        let at = fee_growth_inside(x128(1000), x128(50), x128(200), -100, 100, 100);
        let above = fee_growth_inside(x128(1000), x128(50), x128(200), -100, 100, 500);
        assert_eq!(at, x128(150));
        assert_eq!(above, x128(150));
    }

    #[test]
    fn subtraction_wraps_modulo_2_pow_256() {
        // global < outside sum; the wrapped result is still the value the
        // pool contract would report.
        let inside = fee_growth_inside(x128(10), x128(200), x128(50), -100, 100, 0);
        let expected = x128(10).wrapping_sub(x128(200)).wrapping_sub(x128(50));
        assert_eq!(inside, expected);
    }

    #[test]
    fn delta_skips_inconsistent_checkpoints_when_asked() {
        assert_eq!(fee_delta(x128(100), x128(200), true), None);
        assert_eq!(
            fee_delta(x128(100), x128(200), false),
            Some(x128(100).wrapping_sub(x128(200)))
        );
        assert_eq!(fee_delta(x128(200), x128(150), true), Some(x128(50)));
    }

    #[test]
    fn token_amount_divides_out_the_fixed_point() {
        // liquidity 4, delta 750 << 128 -> 3000 raw tokens.
        assert_eq!(fee_token_amount(4, x128(750)), U256::from(3000u64));
        assert_eq!(fee_token_amount(0, x128(750)), U256::ZERO);
        assert_eq!(fee_token_amount(4, U256::ZERO), U256::ZERO);
    }

    #[test]
    fn token_amount_never_panics_on_extreme_inputs() {
        // A wrapped delta can carry a saturated high limb; with liquidity at
        // the top of u128 the high-limb product exceeds 2^256 and must wrap
        // instead of aborting the fee pass.
        let delta = U256::MAX;
        let l = U256::from(u128::MAX);
        let expected = l
            .wrapping_mul(delta >> 128)
            .wrapping_add((l * (delta & U256::from(u128::MAX))) >> 128);
        assert_eq!(fee_token_amount(u128::MAX, delta), expected);
    }

    #[test]
    fn token_amount_handles_high_delta_limbs() {
        // delta with bits above 2^128: hi limb contributes l * hi directly.
        let delta = (U256::from(3u64) << 200) | U256::from(7u64);
        let expected = (U256::from(5u64) * (delta >> 128))
            + ((U256::from(5u64) * (delta & U256::from(u128::MAX))) >> 128);
        assert_eq!(fee_token_amount(5, delta), expected);
    }
}
