//! Aggregate entities and the closed entity-kind key.
//!
//! Entities are identified by a stable string id and reference each other by
//! id, never by embedded objects; during a batch the cache overlay is the
//! authoritative copy. The [`EntityKind`] enum plus the [`Entity`] tagged
//! union give compile-time exhaustiveness over cache and flush dispatch.

use alloy_primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of entity kinds. Cache buckets and flush order are keyed by
/// this enum rather than runtime type identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Token,
    Pool,
    Tick,
    Position,
    PositionSnapshot,
    PositionFeeSnapshot,
    Tx,
    LendingPair,
    User,
    Deposit,
    Withdraw,
    BorrowAsset,
    RepayAsset,
    RepayAssetWithCollateral,
    Collateral,
    Liquidate,
    DecreaseLiquidity,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Convert a raw token amount to a decimal-scaled float.
pub fn to_decimal(amount: U256, decimals: u8) -> f64 {
    u256_to_f64(amount) / 10f64.powi(decimals as i32)
}

/// Lossy conversion; fee accumulators exceed u128 so this folds all limbs.
pub fn u256_to_f64(value: U256) -> f64 {
    value
        .into_limbs()
        .iter()
        .rev()
        .fold(0f64, |acc, &limb| acc * 2f64.powi(64) + limb as f64)
}

/// Lowercase hex id for an address-keyed entity.
pub fn address_id(address: Address) -> String {
    format!("{:?}", address)
}

// ============================================
// AMM ENTITIES
// ============================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    /// Lowercase token address.
    pub id: String,
    pub symbol: String,
    pub decimals: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    /// Lowercase pool address.
    pub id: String,
    pub token0_id: String,
    pub token1_id: String,
    pub fee: u32,
    /// Current tick, updated by swaps.
    pub tick: i32,
    pub sqrt_price_x96: U256,
    pub liquidity: u128,
    /// Token0 per one token1, decimal-adjusted.
    pub token0_price: f64,
    /// Token1 per one token0, decimal-adjusted.
    pub token1_price: f64,
    pub volume_token0: f64,
    pub volume_token1: f64,
    /// Cumulative whitelist-tracked swap volume.
    pub volume_usd: f64,
    pub created_at_block_number: u64,
    pub created_at_timestamp: DateTime<Utc>,
}

impl Pool {
    pub fn new(
        id: String,
        token0_id: String,
        token1_id: String,
        fee: u32,
        header: &crate::chain::BlockHeader,
    ) -> Self {
        Self {
            id,
            token0_id,
            token1_id,
            fee,
            tick: 0,
            sqrt_price_x96: U256::ZERO,
            liquidity: 0,
            token0_price: 0.0,
            token1_price: 0.0,
            volume_token0: 0.0,
            volume_token1: 0.0,
            volume_usd: 0.0,
            created_at_block_number: header.height,
            created_at_timestamp: header.time(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    /// `{poolId}#{tickIdx}`.
    pub id: String,
    pub pool_id: String,
    pub tick_idx: i32,
    pub fee_growth_outside0_x128: U256,
    pub fee_growth_outside1_x128: U256,
    pub liquidity_gross: u128,
    pub liquidity_net: i128,
    pub created_at_block_number: u64,
    pub created_at_timestamp: DateTime<Utc>,
}

impl Tick {
    /// Id convention shared by positions and the fee-snapshot pass.
    pub fn make_id(pool_id: &str, tick_idx: i32) -> String {
        format!("{pool_id}#{tick_idx}")
    }

    pub fn new(pool_id: &str, tick_idx: i32, header: &crate::chain::BlockHeader) -> Self {
        Self {
            id: Self::make_id(pool_id, tick_idx),
            pool_id: pool_id.to_string(),
            tick_idx,
            fee_growth_outside0_x128: U256::ZERO,
            fee_growth_outside1_x128: U256::ZERO,
            liquidity_gross: 0,
            liquidity_net: 0,
            created_at_block_number: header.height,
            created_at_timestamp: header.time(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// NFT token id, decimal string.
    pub id: String,
    pub owner: Address,
    pub pool_id: String,
    pub token0_id: String,
    pub token1_id: String,
    pub tick_lower_id: String,
    pub tick_upper_id: String,
    pub tick_idx_lower: i32,
    pub tick_idx_upper: i32,
    pub liquidity: u128,
    pub deposited_token0: f64,
    pub deposited_token1: f64,
    pub withdrawn_token0: f64,
    pub withdrawn_token1: f64,
    pub collected_fees_token0: f64,
    pub collected_fees_token1: f64,
    pub fee_growth_inside0_last_x128: U256,
    pub fee_growth_inside1_last_x128: U256,
    pub last_update_block_number: u64,
    pub last_update_timestamp: DateTime<Utc>,
    pub created_at_block_number: u64,
    pub created_at_timestamp: DateTime<Utc>,
    pub last_fee_snapshot_id: Option<String>,
}

impl Position {
    /// Zero-valued position; fields are backfilled from the on-chain read.
    pub fn new(id: String) -> Self {
        Self {
            id,
            owner: Address::ZERO,
            pool_id: String::new(),
            token0_id: String::new(),
            token1_id: String::new(),
            tick_lower_id: String::new(),
            tick_upper_id: String::new(),
            tick_idx_lower: 0,
            tick_idx_upper: 0,
            liquidity: 0,
            deposited_token0: 0.0,
            deposited_token1: 0.0,
            withdrawn_token0: 0.0,
            withdrawn_token1: 0.0,
            collected_fees_token0: 0.0,
            collected_fees_token1: 0.0,
            fee_growth_inside0_last_x128: U256::ZERO,
            fee_growth_inside1_last_x128: U256::ZERO,
            last_update_block_number: 0,
            last_update_timestamp: DateTime::<Utc>::default(),
            created_at_block_number: 0,
            created_at_timestamp: DateTime::<Utc>::default(),
            last_fee_snapshot_id: None,
        }
    }
}

/// Point-in-time copy of a position, one per (position, block) mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    /// `{positionId}#{blockNumber}`.
    pub id: String,
    pub owner: Address,
    pub pool_id: String,
    pub position_id: String,
    pub transaction_id: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub liquidity: u128,
    pub deposited_token0: f64,
    pub deposited_token1: f64,
    pub withdrawn_token0: f64,
    pub withdrawn_token1: f64,
    pub collected_fees_token0: f64,
    pub collected_fees_token1: f64,
    pub fee_growth_inside0_last_x128: U256,
    pub fee_growth_inside1_last_x128: U256,
}

impl PositionSnapshot {
    pub fn make_id(position_id: &str, block: u64) -> String {
        format!("{position_id}#{block}")
    }

    pub fn from_position(
        position: &Position,
        header: &crate::chain::BlockHeader,
        transaction_id: String,
    ) -> Self {
        Self {
            id: Self::make_id(&position.id, header.height),
            owner: position.owner,
            pool_id: position.pool_id.clone(),
            position_id: position.id.clone(),
            transaction_id,
            block_number: header.height,
            timestamp: header.time(),
            liquidity: position.liquidity,
            deposited_token0: position.deposited_token0,
            deposited_token1: position.deposited_token1,
            withdrawn_token0: position.withdrawn_token0,
            withdrawn_token1: position.withdrawn_token1,
            collected_fees_token0: position.collected_fees_token0,
            collected_fees_token1: position.collected_fees_token1,
            fee_growth_inside0_last_x128: position.fee_growth_inside0_last_x128,
            fee_growth_inside1_last_x128: position.fee_growth_inside1_last_x128,
        }
    }
}

/// Derived unrealized + realized fee totals for a position at a block.
/// Immutable per (position, block) key; in-batch recomputation overwrites.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionFeeSnapshot {
    /// `{positionId}#{blockNumber}`.
    pub id: String,
    pub owner: Address,
    pub pool_id: String,
    pub position_id: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub total_fee_token0: f64,
    pub total_fee_token1: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tx {
    /// Transaction hash.
    pub id: String,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
    pub gas_used: u128,
    pub gas_price: u128,
}

// ============================================
// LENDING ENTITIES
// ============================================

/// Singleton aggregate for the lending pair, id = "1".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LendingPair {
    pub id: String,
    pub total_deposits: U256,
    pub total_borrows: U256,
    pub total_collateral: U256,
    pub total_liquidations: U256,
    pub deposit_count: u64,
    pub withdraw_count: u64,
    pub borrow_count: u64,
    pub repay_count: u64,
    pub collateral_count: u64,
    pub liquidation_count: u64,
    pub last_update_block_number: u64,
    pub last_update_timestamp: DateTime<Utc>,
}

impl LendingPair {
    pub const SINGLETON_ID: &'static str = "1";

    pub fn new() -> Self {
        Self {
            id: Self::SINGLETON_ID.to_string(),
            total_deposits: U256::ZERO,
            total_borrows: U256::ZERO,
            total_collateral: U256::ZERO,
            total_liquidations: U256::ZERO,
            deposit_count: 0,
            withdraw_count: 0,
            borrow_count: 0,
            repay_count: 0,
            collateral_count: 0,
            liquidation_count: 0,
            last_update_block_number: 0,
            last_update_timestamp: DateTime::<Utc>::default(),
        }
    }
}

impl Default for LendingPair {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Lowercase user address.
    pub id: String,
    pub total_deposits: U256,
    pub total_borrows: U256,
    pub total_collateral: U256,
    pub deposit_count: u64,
    pub withdraw_count: u64,
    pub borrow_count: u64,
    pub repay_count: u64,
    pub collateral_count: u64,
    pub last_update_block_number: u64,
    pub last_update_timestamp: DateTime<Utc>,
}

impl User {
    pub fn new(id: String) -> Self {
        Self {
            id,
            total_deposits: U256::ZERO,
            total_borrows: U256::ZERO,
            total_collateral: U256::ZERO,
            deposit_count: 0,
            withdraw_count: 0,
            borrow_count: 0,
            repay_count: 0,
            collateral_count: 0,
            last_update_block_number: 0,
            last_update_timestamp: DateTime::<Utc>::default(),
        }
    }
}

// ============================================
// EVENT RECORDS (append-only, id = {txHash}-{logIndex})
// ============================================

/// Deterministic id shared by all append-only event records, so batch
/// retries never duplicate rows.
pub fn event_record_id(tx_hash: &str, log_index: u64) -> String {
    format!("{tx_hash}-{log_index}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deposit {
    pub id: String,
    pub caller: Address,
    pub owner: Address,
    pub assets: U256,
    pub shares: U256,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Withdraw {
    pub id: String,
    pub caller: Address,
    pub receiver: Address,
    pub owner: Address,
    pub assets: U256,
    pub shares: U256,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BorrowAsset {
    pub id: String,
    pub borrower: Address,
    pub receiver: Address,
    pub borrow_amount: U256,
    pub shares_added: U256,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepayAsset {
    pub id: String,
    pub payer: Address,
    pub borrower: Address,
    pub amount_to_repay: U256,
    pub shares: U256,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepayAssetWithCollateral {
    pub id: String,
    pub borrower: Address,
    pub swapper_address: Address,
    pub collateral_to_swap: U256,
    pub amount_asset_out: U256,
    pub shares_repaid: U256,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollateralAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collateral {
    pub id: String,
    pub sender: Address,
    pub borrower: Address,
    pub amount: U256,
    pub action: CollateralAction,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Liquidate {
    pub id: String,
    pub borrower: Address,
    pub collateral_for_liquidator: U256,
    pub shares_to_liquidate: U256,
    pub amount_liquidator_to_repay: U256,
    pub fees_amount: U256,
    pub shares_to_adjust: U256,
    pub amount_to_adjust: U256,
    pub block_number: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecreaseLiquidity {
    pub id: String,
    pub transaction_id: String,
    pub position_id: String,
    pub liquidity: u128,
    pub amount0: f64,
    pub amount1: f64,
    pub log_index: u64,
    pub timestamp: DateTime<Utc>,
}

// ============================================
// TAGGED UNION
// ============================================

/// Tagged union over every entity variant, the unit the cache and store
/// traffic in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Entity {
    Token(Token),
    Pool(Pool),
    Tick(Tick),
    Position(Position),
    PositionSnapshot(PositionSnapshot),
    PositionFeeSnapshot(PositionFeeSnapshot),
    Tx(Tx),
    LendingPair(LendingPair),
    User(User),
    Deposit(Deposit),
    Withdraw(Withdraw),
    BorrowAsset(BorrowAsset),
    RepayAsset(RepayAsset),
    RepayAssetWithCollateral(RepayAssetWithCollateral),
    Collateral(Collateral),
    Liquidate(Liquidate),
    DecreaseLiquidity(DecreaseLiquidity),
}

macro_rules! entity_variants {
    ($(($variant:ident, $ty:ty, $as_ref:ident, $as_mut:ident)),+ $(,)?) => {
        impl Entity {
            pub fn kind(&self) -> EntityKind {
                match self {
                    $(Entity::$variant(_) => EntityKind::$variant,)+
                }
            }

            pub fn id(&self) -> &str {
                match self {
                    $(Entity::$variant(e) => &e.id,)+
                }
            }

            $(
                pub fn $as_ref(&self) -> Option<&$ty> {
                    match self {
                        Entity::$variant(e) => Some(e),
                        _ => None,
                    }
                }

                pub fn $as_mut(&mut self) -> Option<&mut $ty> {
                    match self {
                        Entity::$variant(e) => Some(e),
                        _ => None,
                    }
                }
            )+
        }

        $(
            impl From<$ty> for Entity {
                fn from(e: $ty) -> Self {
                    Entity::$variant(e)
                }
            }
        )+
    };
}

entity_variants!(
    (Token, Token, as_token, as_token_mut),
    (Pool, Pool, as_pool, as_pool_mut),
    (Tick, Tick, as_tick, as_tick_mut),
    (Position, Position, as_position, as_position_mut),
    (
        PositionSnapshot,
        PositionSnapshot,
        as_position_snapshot,
        as_position_snapshot_mut
    ),
    (
        PositionFeeSnapshot,
        PositionFeeSnapshot,
        as_position_fee_snapshot,
        as_position_fee_snapshot_mut
    ),
    (Tx, Tx, as_tx, as_tx_mut),
    (LendingPair, LendingPair, as_lending_pair, as_lending_pair_mut),
    (User, User, as_user, as_user_mut),
    (Deposit, Deposit, as_deposit, as_deposit_mut),
    (Withdraw, Withdraw, as_withdraw, as_withdraw_mut),
    (BorrowAsset, BorrowAsset, as_borrow_asset, as_borrow_asset_mut),
    (RepayAsset, RepayAsset, as_repay_asset, as_repay_asset_mut),
    (
        RepayAssetWithCollateral,
        RepayAssetWithCollateral,
        as_repay_asset_with_collateral,
        as_repay_asset_with_collateral_mut
    ),
    (Collateral, Collateral, as_collateral, as_collateral_mut),
    (Liquidate, Liquidate, as_liquidate, as_liquidate_mut),
    (
        DecreaseLiquidity,
        DecreaseLiquidity,
        as_decrease_liquidity,
        as_decrease_liquidity_mut
    ),
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_and_id_roundtrip() {
        let user = Entity::from(User::new("0xabc".to_string()));
        assert_eq!(user.kind(), EntityKind::User);
        assert_eq!(user.id(), "0xabc");
        assert!(user.as_user().is_some());
        assert!(user.as_pool().is_none());
    }

    #[test]
    fn to_decimal_scales_by_token_precision() {
        assert_eq!(to_decimal(U256::from(1_500_000u64), 6), 1.5);
        assert_eq!(to_decimal(U256::ZERO, 18), 0.0);
    }

    #[test]
    fn u256_to_f64_handles_high_limbs() {
        let big = U256::from(1u64) << 200;
        assert_eq!(u256_to_f64(big), 2f64.powi(200));
    }

    #[test]
    fn event_record_ids_are_deterministic() {
        assert_eq!(event_record_id("0xdead", 7), "0xdead-7");
    }
}
