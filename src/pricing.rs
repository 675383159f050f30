//! Pool price derivation and whitelist-tracked USD volume.

use alloy_primitives::U256;
use tracing::warn;

use crate::model::u256_to_f64;

/// Token whitelist and stable-coin list, loaded from config at startup.
/// Addresses are compared lowercased.
pub struct PriceTracker {
    whitelist: Vec<String>,
    stable_coins: Vec<String>,
}

impl PriceTracker {
    pub fn new(whitelist: Vec<String>, stable_coins: Vec<String>) -> Self {
        Self {
            whitelist: whitelist.into_iter().map(|a| a.to_lowercase()).collect(),
            stable_coins: stable_coins.into_iter().map(|a| a.to_lowercase()).collect(),
        }
    }

    pub fn is_whitelisted(&self, token_id: &str) -> bool {
        self.whitelist.iter().any(|t| t == &token_id.to_lowercase())
    }

    pub fn is_stable_coin(&self, token_id: &str) -> bool {
        self.stable_coins
            .iter()
            .any(|t| t == &token_id.to_lowercase())
    }

    /// Tracked USD amount for a pair of token legs:
    /// both whitelisted -> sum, one whitelisted -> that leg doubled,
    /// neither -> zero.
    pub fn tracked_amount_usd(
        &self,
        token0_id: &str,
        amount0_usd: f64,
        token1_id: &str,
        amount1_usd: f64,
    ) -> f64 {
        match (self.is_whitelisted(token0_id), self.is_whitelisted(token1_id)) {
            (true, true) => amount0_usd + amount1_usd,
            (true, false) => amount0_usd * 2.0,
            (false, true) => amount1_usd * 2.0,
            (false, false) => 0.0,
        }
    }
}

/// Derive `(token0_price, token1_price)` from a pool's sqrtPriceX96.
///
/// `price1 = (sqrtPrice / 2^96)^2 * 10^(d0 - d1)` is token1 per token0;
/// token0's price is its reciprocal. Returns `(0, 0)` for degenerate input
/// rather than propagating NaN/inf into the entities.
pub fn sqrt_price_x96_to_token_prices(
    sqrt_price_x96: U256,
    decimals0: u8,
    decimals1: u8,
) -> (f64, f64) {
    if sqrt_price_x96.is_zero() {
        return (0.0, 0.0);
    }

    let sqrt_price = u256_to_f64(sqrt_price_x96);
    let price1 =
        sqrt_price * sqrt_price * 10f64.powi(decimals0 as i32 - decimals1 as i32) / 2f64.powi(192);

    if !price1.is_finite() || price1 <= 0.0 {
        warn!("degenerate sqrt price {sqrt_price_x96}, zeroing pool prices");
        return (0.0, 0.0);
    }
    (1.0 / price1, price1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> PriceTracker {
        PriceTracker::new(
            vec![
                "0xAAaa000000000000000000000000000000000001".to_string(),
                "0xbbbb000000000000000000000000000000000002".to_string(),
            ],
            vec!["0xbbbb000000000000000000000000000000000002".to_string()],
        )
    }

    #[test]
    fn equal_price_pool_with_equal_decimals() {
        // sqrtPrice = 2^96 means price 1:1.
        let (p0, p1) = sqrt_price_x96_to_token_prices(U256::from(1u64) << 96, 18, 18);
        assert!((p0 - 1.0).abs() < 1e-9);
        assert!((p1 - 1.0).abs() < 1e-9);
    }

    #[test]
    fn decimal_difference_scales_the_price() {
        // 1:1 raw price, token0 has 6 decimals, token1 has 18:
        // price1 = 10^(6-18) = 1e-12.
        let (p0, p1) = sqrt_price_x96_to_token_prices(U256::from(1u64) << 96, 6, 18);
        assert!((p1 - 1e-12).abs() < 1e-21);
        assert!((p0 - 1e12).abs() < 1e3);
    }

    #[test]
    fn zero_sqrt_price_yields_zero_prices() {
        assert_eq!(sqrt_price_x96_to_token_prices(U256::ZERO, 18, 18), (0.0, 0.0));
    }

    #[test]
    fn tracked_amount_depends_on_whitelist_membership() {
        let t = tracker();
        let wl0 = "0xaaaa000000000000000000000000000000000001";
        let wl1 = "0xbbbb000000000000000000000000000000000002";
        let other = "0xcccc000000000000000000000000000000000003";

        assert_eq!(t.tracked_amount_usd(wl0, 10.0, wl1, 5.0), 15.0);
        assert_eq!(t.tracked_amount_usd(wl0, 10.0, other, 5.0), 20.0);
        assert_eq!(t.tracked_amount_usd(other, 10.0, wl1, 5.0), 10.0);
        assert_eq!(t.tracked_amount_usd(other, 10.0, other, 5.0), 0.0);
    }

    #[test]
    fn whitelist_comparison_is_case_insensitive() {
        let t = tracker();
        assert!(t.is_whitelisted("0xAAAA000000000000000000000000000000000001"));
        assert!(t.is_stable_coin("0xBBBB000000000000000000000000000000000002"));
        assert!(!t.is_stable_coin("0xaaaa000000000000000000000000000000000001"));
    }
}
