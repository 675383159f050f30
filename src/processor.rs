//! Batch driver: fold every protocol's events against one shared cache,
//! then flush the overlay to the store in dependency order.
//!
//! A batch is all-or-nothing. Any error unwinds before `flush`, leaving the
//! store at the previous batch boundary; the driver retries the whole batch.
//! Flush itself is idempotent - mutable entities are upserts and event
//! records carry deterministic ids the store ignores on re-insert - so a
//! crash between flush and checkpoint is also safe to replay.

use eyre::Result;
use tracing::{debug, info};

use crate::cache::EntityCache;
use crate::chain::BlockData;
use crate::config::Config;
use crate::mappings;
use crate::model::{Entity, EntityKind};
use crate::multicall::{CallExecutor, Multicall};
use crate::pricing::PriceTracker;
use crate::store::Store;

/// Mutable entities, upserted parents-before-children.
const SAVE_ORDER: [EntityKind; 8] = [
    EntityKind::Token,
    EntityKind::Pool,
    EntityKind::Tick,
    EntityKind::Position,
    EntityKind::PositionSnapshot,
    EntityKind::PositionFeeSnapshot,
    EntityKind::LendingPair,
    EntityKind::User,
];

/// Append-only rows with deterministic ids.
const INSERT_ORDER: [EntityKind; 9] = [
    EntityKind::Tx,
    EntityKind::Deposit,
    EntityKind::Withdraw,
    EntityKind::BorrowAsset,
    EntityKind::RepayAsset,
    EntityKind::RepayAssetWithCollateral,
    EntityKind::Collateral,
    EntityKind::Liquidate,
    EntityKind::DecreaseLiquidity,
];

pub async fn run_batch<S: Store, E: CallExecutor>(
    store: &S,
    multicall: &Multicall<E>,
    cfg: &Config,
    tracker: &PriceTracker,
    blocks: &[BlockData],
) -> Result<()> {
    if blocks.is_empty() {
        return Ok(());
    }
    let first = blocks[0].header.height;
    let last = blocks[blocks.len() - 1].header.height;
    debug!("processing batch {first}..={last}");

    let mut cache = EntityCache::new(store);
    mappings::pool::process(&mut cache, multicall, cfg, tracker, blocks).await?;
    mappings::position_manager::process(&mut cache, multicall, cfg, blocks).await?;
    mappings::lending_pair::process(&mut cache, cfg, blocks).await?;
    mappings::fee_snapshot::process(&mut cache, multicall, cfg, blocks).await?;

    flush(&cache).await?;
    info!("batch {first}..={last} flushed");
    Ok(())
}

/// Persist the whole overlay. Kinds flush in a fixed order so referenced
/// rows always land before rows that point at them.
pub async fn flush<S: Store>(cache: &EntityCache<'_, S>) -> Result<()> {
    let store = cache.store();

    for kind in SAVE_ORDER {
        let rows: Vec<Entity> = cache.values(kind).cloned().collect();
        if rows.is_empty() {
            continue;
        }
        debug!("saving {} {kind} rows", rows.len());
        store.save(kind, rows).await?;
    }

    for kind in INSERT_ORDER {
        let rows: Vec<Entity> = cache.values(kind).cloned().collect();
        if rows.is_empty() {
            continue;
        }
        debug!("inserting {} {kind} rows", rows.len());
        store.insert(kind, rows).await?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::{IMulticall3, INonfungiblePositionManager as Npm, IUniswapV3Factory, IUniswapV3Pool};
    use crate::chain::{BlockHeader, Log, TxInfo};
    use crate::errors::MulticallError;
    use crate::model::{address_id, Pool, Position, Token, User};
    use crate::store::MemoryStore;
    use alloy_primitives::{
        aliases::{I24, I56, U160, U24, U96},
        Address, B256, U256,
    };
    use alloy_sol_types::{SolCall, SolEvent, SolValue};

    const POSITIONS: Address = Address::repeat_byte(0xa1);
    const FACTORY: Address = Address::repeat_byte(0xa2);
    const POOL: Address = Address::repeat_byte(0xa3);
    const TOKEN0: Address = Address::repeat_byte(0xb0);
    const TOKEN1: Address = Address::repeat_byte(0xb1);

    fn x128(v: u64) -> U256 {
        U256::from(v) << 128
    }

    /// Answers every view call the pipeline issues from fixed fixture state.
    /// `global0_step_per_block` makes the token0 global accumulator grow with
    /// the pinned block height, so head-state reads are distinguishable from
    /// historical ones.
    struct ChainMock {
        tick_lower: i32,
        tick_upper: i32,
        fee_growth_global0: U256,
        fee_growth_global1: U256,
        global0_step_per_block: u64,
        lower_outside0: U256,
        upper_outside0: U256,
        last0: U256,
        last1: U256,
    }

    impl Default for ChainMock {
        fn default() -> Self {
            Self {
                tick_lower: -100,
                tick_upper: 100,
                fee_growth_global0: U256::ZERO,
                fee_growth_global1: U256::ZERO,
                global0_step_per_block: 0,
                lower_outside0: U256::ZERO,
                upper_outside0: U256::ZERO,
                last0: U256::ZERO,
                last1: U256::ZERO,
            }
        }
    }

    impl CallExecutor for ChainMock {
        async fn execute(
            &self,
            calls: Vec<IMulticall3::Call3>,
            block: Option<u64>,
        ) -> Result<Vec<IMulticall3::Result>, MulticallError> {
            Ok(calls
                .iter()
                .map(|call| {
                    let selector: [u8; 4] = call.callData[..4].try_into().unwrap();
                    let data: Vec<u8> = if selector == Npm::positionsCall::SELECTOR {
                        (
                            U96::ZERO,
                            Address::ZERO,
                            TOKEN0,
                            TOKEN1,
                            U24::from(3000u32),
                            I24::try_from(self.tick_lower).unwrap(),
                            I24::try_from(self.tick_upper).unwrap(),
                            0u128,
                            self.last0,
                            self.last1,
                            0u128,
                            0u128,
                        )
                            .abi_encode()
                    } else if selector == IUniswapV3Factory::getPoolCall::SELECTOR {
                        POOL.abi_encode()
                    } else if selector == IUniswapV3Pool::feeGrowthGlobal0X128Call::SELECTOR {
                        let stepped: U256 = U256::from(
                            self.global0_step_per_block * block.unwrap_or_default(),
                        ) << 128;
                        (self.fee_growth_global0 + stepped).abi_encode()
                    } else if selector == IUniswapV3Pool::feeGrowthGlobal1X128Call::SELECTOR {
                        self.fee_growth_global1.abi_encode()
                    } else if selector == IUniswapV3Pool::ticksCall::SELECTOR {
                        let decoded = IUniswapV3Pool::ticksCall::abi_decode(&call.callData).unwrap();
                        let outside0 = if decoded.tick.as_i32() == self.tick_lower {
                            self.lower_outside0
                        } else {
                            self.upper_outside0
                        };
                        (
                            0u128,
                            0i128,
                            outside0,
                            U256::ZERO,
                            I56::ZERO,
                            U160::ZERO,
                            0u32,
                            true,
                        )
                            .abi_encode()
                    } else {
                        panic!("unexpected call selector {selector:?}");
                    };
                    IMulticall3::Result {
                        success: true,
                        returnData: data.into(),
                    }
                })
                .collect())
        }
    }

    fn test_config() -> Config {
        let mut cfg = Config::default();
        cfg.positions_address = format!("{POSITIONS:?}");
        cfg.factory_address = format!("{FACTORY:?}");
        cfg.lending_pair_address = format!("{:?}", Address::repeat_byte(0xa4));
        cfg
    }

    fn tracker() -> PriceTracker {
        PriceTracker::new(vec![], vec![])
    }

    fn header(height: u64) -> BlockHeader {
        BlockHeader {
            height,
            timestamp: 1_700_000_000,
        }
    }

    fn seed_tokens(store: &MemoryStore, decimals: u8) {
        for address in [TOKEN0, TOKEN1] {
            store.put(
                Token {
                    id: address_id(address),
                    symbol: "TKN".to_string(),
                    decimals,
                }
                .into(),
            );
        }
    }

    fn seed_pool(store: &MemoryStore, tick: i32) {
        let mut pool = Pool::new(
            address_id(POOL),
            address_id(TOKEN0),
            address_id(TOKEN1),
            3000,
            &header(1),
        );
        pool.tick = tick;
        store.put(pool.into());
    }

    fn increase_log(token_id: u64, liquidity: u128, log_index: u64) -> Log {
        let body = (liquidity, U256::from(2_000u64), U256::from(4_000u64)).abi_encode();
        Log {
            address: POSITIONS,
            topics: vec![
                Npm::IncreaseLiquidity::SIGNATURE_HASH,
                B256::from(U256::from(token_id)),
            ],
            data: body.into(),
            log_index,
            transaction_index: 0,
            transaction: TxInfo {
                hash: B256::repeat_byte(0x77),
                from: Address::ZERO,
                gas_used: 21_000,
                gas_price: 30,
            },
        }
    }

    #[tokio::test]
    async fn same_block_increases_apply_in_log_index_order() {
        let store = MemoryStore::new();
        seed_tokens(&store, 3);
        seed_pool(&store, 0);

        let cfg = test_config();
        let multicall = Multicall::new(ChainMock::default());

        let blocks = vec![BlockData {
            header: header(10),
            logs: vec![increase_log(42, 500, 3), increase_log(42, 300, 7)],
        }];
        run_batch(&store, &multicall, &cfg, &tracker(), &blocks)
            .await
            .unwrap();

        let position = store.get(EntityKind::Position, "42").unwrap();
        let position = position.as_position().unwrap();
        assert_eq!(position.liquidity, 800);
        // amounts are 2000/4000 raw at 3 decimals, twice
        assert_eq!(position.deposited_token0, 4.0);
        assert_eq!(position.deposited_token1, 8.0);

        // Both events hit the same block, so exactly one snapshot exists and
        // it carries the final liquidity.
        assert_eq!(store.len(EntityKind::PositionSnapshot), 1);
        let snapshot = store
            .get(EntityKind::PositionSnapshot, "42#10")
            .unwrap();
        assert_eq!(snapshot.as_position_snapshot().unwrap().liquidity, 800);

        // Parent transaction was recorded once.
        assert_eq!(store.len(EntityKind::Tx), 1);
    }

    fn seed_open_position(store: &MemoryStore) {
        let mut position = Position::new("42".to_string());
        position.pool_id = address_id(POOL);
        position.token0_id = address_id(TOKEN0);
        position.token1_id = address_id(TOKEN1);
        position.tick_idx_lower = -100;
        position.tick_idx_upper = 100;
        position.tick_lower_id = crate::model::Tick::make_id(&address_id(POOL), -100);
        position.tick_upper_id = crate::model::Tick::make_id(&address_id(POOL), 100);
        position.liquidity = 4;
        position.created_at_block_number = 5;
        store.put(position.into());
    }

    #[tokio::test]
    async fn fee_snapshot_values_open_positions_against_chain_state() {
        let store = MemoryStore::new();
        seed_tokens(&store, 3);
        seed_pool(&store, 50);
        seed_open_position(&store);

        let cfg = test_config();
        // global 1000, outside 200 + 50, checkpoint 0: inside = 750, and
        // 4 * 750 / 1 (X128 cancels) = 3000 raw = 3.0 at 3 decimals.
        let multicall = Multicall::new(ChainMock {
            fee_growth_global0: x128(1000),
            lower_outside0: x128(200),
            upper_outside0: x128(50),
            ..ChainMock::default()
        });

        let blocks = vec![BlockData {
            header: header(10),
            logs: vec![],
        }];
        run_batch(&store, &multicall, &cfg, &tracker(), &blocks)
            .await
            .unwrap();

        let snapshot = store
            .get(EntityKind::PositionFeeSnapshot, "42#10")
            .unwrap();
        let snapshot = snapshot.as_position_fee_snapshot().unwrap();
        assert_eq!(snapshot.total_fee_token0, 3.0);
        assert_eq!(snapshot.total_fee_token1, 0.0);
        assert_eq!(snapshot.position_id, "42");

        let position = store.get(EntityKind::Position, "42").unwrap();
        assert_eq!(
            position.as_position().unwrap().last_fee_snapshot_id,
            Some("42#10".to_string())
        );
    }

    #[tokio::test]
    async fn fee_snapshots_are_valued_at_their_own_block() {
        let store = MemoryStore::new();
        seed_tokens(&store, 3);
        seed_pool(&store, 50);
        seed_open_position(&store);

        let cfg = test_config();
        // global0 grows 100 per block, so a backfilled batch only produces
        // distinct snapshots if each block's reads are pinned to that block:
        // block 10 -> inside 1000, block 11 -> inside 1100.
        let multicall = Multicall::new(ChainMock {
            global0_step_per_block: 100,
            ..ChainMock::default()
        });

        let blocks = vec![
            BlockData {
                header: header(10),
                logs: vec![],
            },
            BlockData {
                header: header(11),
                logs: vec![],
            },
        ];
        run_batch(&store, &multicall, &cfg, &tracker(), &blocks)
            .await
            .unwrap();

        // liquidity 4 at 3 decimals: 4 * 1000 / 10^3 and 4 * 1100 / 10^3.
        let at_10 = store
            .get(EntityKind::PositionFeeSnapshot, "42#10")
            .unwrap();
        assert_eq!(at_10.as_position_fee_snapshot().unwrap().total_fee_token0, 4.0);
        let at_11 = store
            .get(EntityKind::PositionFeeSnapshot, "42#11")
            .unwrap();
        assert_eq!(at_11.as_position_fee_snapshot().unwrap().total_fee_token0, 4.4);
    }

    #[tokio::test]
    async fn flush_twice_changes_nothing() {
        let store = MemoryStore::new();
        let mut cache = EntityCache::new(&store);

        let mut user = User::new("0x1".to_string());
        user.deposit_count = 3;
        cache.add(user);
        cache.add(crate::model::Deposit {
            id: "0xaaa-0".to_string(),
            caller: Address::ZERO,
            owner: Address::ZERO,
            assets: U256::from(7u64),
            shares: U256::from(7u64),
            block_number: 1,
            timestamp: header(1).time(),
        });

        flush(&cache).await.unwrap();
        flush(&cache).await.unwrap();

        assert_eq!(store.len(EntityKind::User), 1);
        assert_eq!(store.len(EntityKind::Deposit), 1);
        let user = store.get(EntityKind::User, "0x1").unwrap();
        assert_eq!(user.as_user().unwrap().deposit_count, 3);
    }

    #[tokio::test]
    async fn rerunning_a_flushed_batch_duplicates_no_records() {
        // Crash between flush and checkpoint: the same blocks fold again on
        // top of the already-flushed store. Append-only records must not
        // duplicate; this is what the deterministic ids buy.
        let store = MemoryStore::new();
        seed_tokens(&store, 3);
        seed_pool(&store, 0);

        let cfg = test_config();
        let multicall = Multicall::new(ChainMock::default());
        let blocks = vec![BlockData {
            header: header(10),
            logs: vec![increase_log(42, 500, 3)],
        }];

        run_batch(&store, &multicall, &cfg, &tracker(), &blocks)
            .await
            .unwrap();
        run_batch(&store, &multicall, &cfg, &tracker(), &blocks)
            .await
            .unwrap();

        assert_eq!(store.len(EntityKind::Tx), 1);
        assert_eq!(store.len(EntityKind::PositionSnapshot), 1);
    }
}
