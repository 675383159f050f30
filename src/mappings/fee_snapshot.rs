//! Per-block unrealized-fee snapshots for open positions.
//!
//! For every block in the batch, all open positions are revalued against
//! chain state pinned to that block: the position's own checkpoint, both
//! pool fee-growth globals, and the two boundary ticks are read in five
//! concurrent multicall fan-outs, joined, and applied synchronously in
//! position order. One `PositionFeeSnapshot` per (position, block);
//! recomputation within a batch overwrites the same id.

use alloy_primitives::{aliases::I24, Address, U256};
use alloy_sol_types::SolEvent;
use eyre::Result;
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::abi::{INonfungiblePositionManager as Npm, IUniswapV3Pool};
use crate::cache::EntityCache;
use crate::chain::BlockData;
use crate::config::Config;
use crate::fees::{fee_delta, fee_growth_inside, fee_token_amount};
use crate::model::{to_decimal, EntityKind, PositionFeeSnapshot, PositionSnapshot};
use crate::multicall::{CallExecutor, Multicall};
use crate::store::Store;

/// A swap's tick, remembered per pool so each block can be valued at the
/// last tick observed at or before it.
struct TickObservation {
    pool_id: String,
    block: u64,
    tick: i32,
}

/// Everything the fan-out needs about one position, copied out of the cache
/// so the multicall awaits hold no borrows.
struct PositionView {
    id: String,
    pool_id: String,
    pool_address: Address,
    pool_tick: i32,
    tick_idx_lower: i32,
    tick_idx_upper: i32,
    liquidity: u128,
    collected_fees_token0: f64,
    collected_fees_token1: f64,
    decimals0: u8,
    decimals1: u8,
}

pub async fn process<S: Store, E: CallExecutor>(
    cache: &mut EntityCache<'_, S>,
    multicall: &Multicall<E>,
    cfg: &Config,
    blocks: &[BlockData],
) -> Result<()> {
    let observations = collect_pool_ticks(blocks);

    if !prefetch(cache).await? {
        return Ok(());
    }

    for block in blocks {
        let header = block.header;
        let views = snapshot_views(cache, header.height)?;
        if views.is_empty() {
            continue;
        }
        debug!(
            "fee snapshots for {} positions at block {}",
            views.len(),
            header.height
        );

        let position_calls = views
            .iter()
            .map(|v| {
                Ok(Npm::positionsCall {
                    tokenId: U256::from_str_radix(&v.id, 10)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let fee0_calls = views
            .iter()
            .map(|v| (v.pool_address, IUniswapV3Pool::feeGrowthGlobal0X128Call {}))
            .collect();
        let fee1_calls = views
            .iter()
            .map(|v| (v.pool_address, IUniswapV3Pool::feeGrowthGlobal1X128Call {}))
            .collect();
        let tick_lower_calls = views
            .iter()
            .map(|v| {
                Ok((
                    v.pool_address,
                    IUniswapV3Pool::ticksCall {
                        tick: I24::try_from(v.tick_idx_lower)?,
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;
        let tick_upper_calls = views
            .iter()
            .map(|v| {
                Ok((
                    v.pool_address,
                    IUniswapV3Pool::ticksCall {
                        tick: I24::try_from(v.tick_idx_upper)?,
                    },
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        // Pinned to the snapshot's own block: a batch of historical blocks
        // must observe each block's accumulators, not the head's.
        let at = Some(header.height);
        let page = cfg.multicall_page_size;
        let (position_results, fee0_results, fee1_results, lower_results, upper_results) = futures::try_join!(
            multicall.aggregate(cfg.positions()?, position_calls, at, page),
            multicall.aggregate_multi(fee0_calls, at, page),
            multicall.aggregate_multi(fee1_calls, at, page),
            multicall.aggregate_multi(tick_lower_calls, at, page),
            multicall.aggregate_multi(tick_upper_calls, at, page),
        )?;

        for (i, view) in views.iter().enumerate() {
            let tick_current = current_tick(&observations, &view.pool_id, header.height)
                .unwrap_or(view.pool_tick);

            let inside0 = fee_growth_inside(
                fee0_results[i],
                lower_results[i].feeGrowthOutside0X128,
                upper_results[i].feeGrowthOutside0X128,
                view.tick_idx_lower,
                view.tick_idx_upper,
                tick_current,
            );
            let inside1 = fee_growth_inside(
                fee1_results[i],
                lower_results[i].feeGrowthOutside1X128,
                upper_results[i].feeGrowthOutside1X128,
                view.tick_idx_lower,
                view.tick_idx_upper,
                tick_current,
            );

            let last0 = position_results[i].feeGrowthInside0LastX128;
            let last1 = position_results[i].feeGrowthInside1LastX128;
            let skip = cfg.skip_inconsistent_fee_growth;
            let (Some(delta0), Some(delta1)) =
                (fee_delta(inside0, last0, skip), fee_delta(inside1, last1, skip))
            else {
                warn!(
                    "position {} block {}: inconsistent fee growth, snapshot skipped",
                    view.id, header.height
                );
                continue;
            };

            let unrealized0 = to_decimal(fee_token_amount(view.liquidity, delta0), view.decimals0);
            let unrealized1 = to_decimal(fee_token_amount(view.liquidity, delta1), view.decimals1);

            let snapshot_id = PositionSnapshot::make_id(&view.id, header.height);
            let Some(owner) = cache.position(&view.id)?.map(|p| p.owner) else {
                continue;
            };
            if let Some(position) = cache.position_mut(&view.id)? {
                position.fee_growth_inside0_last_x128 = last0;
                position.fee_growth_inside1_last_x128 = last1;
                position.last_fee_snapshot_id = Some(snapshot_id.clone());
            }
            cache.add(PositionFeeSnapshot {
                id: snapshot_id,
                owner,
                pool_id: view.pool_id.clone(),
                position_id: view.id.clone(),
                block_number: header.height,
                timestamp: header.time(),
                total_fee_token0: unrealized0 + view.collected_fees_token0,
                total_fee_token1: unrealized1 + view.collected_fees_token1,
            });
        }
    }

    Ok(())
}

/// Load every open position the store knows about plus the supporting pools,
/// ticks, and tokens. Returns false when there is nothing to snapshot.
async fn prefetch<S: Store>(cache: &mut EntityCache<'_, S>) -> Result<bool> {
    let open = cache.store().find_open_positions().await?;
    cache.defer_all(
        EntityKind::Position,
        open.iter().map(|e| e.id().to_string()),
    );
    cache.load(EntityKind::Position).await?;

    if cache.len(EntityKind::Position) == 0 {
        return Ok(false);
    }

    let mut pool_ids = BTreeSet::new();
    let mut tick_ids = BTreeSet::new();
    let mut token_ids = BTreeSet::new();
    for entity in cache.values(EntityKind::Position) {
        if let Some(position) = entity.as_position() {
            pool_ids.insert(position.pool_id.clone());
            tick_ids.insert(position.tick_lower_id.clone());
            tick_ids.insert(position.tick_upper_id.clone());
            token_ids.insert(position.token0_id.clone());
            token_ids.insert(position.token1_id.clone());
        }
    }
    cache.defer_all(EntityKind::Pool, pool_ids);
    cache.defer_all(EntityKind::Tick, tick_ids);
    cache.defer_all(EntityKind::Token, token_ids);
    cache.load(EntityKind::Pool).await?;
    cache.load(EntityKind::Tick).await?;
    cache.load(EntityKind::Token).await?;

    Ok(true)
}

/// Open positions eligible at `height`, flattened into owned views.
fn snapshot_views<S: Store>(
    cache: &EntityCache<'_, S>,
    height: u64,
) -> Result<Vec<PositionView>> {
    let mut views = Vec::new();

    for entity in cache.values(EntityKind::Position) {
        let Some(position) = entity.as_position() else {
            continue;
        };
        if position.liquidity == 0 || position.created_at_block_number > height {
            continue;
        }
        let Some(d0) = cache.token(&position.token0_id)?.map(|t| t.decimals) else {
            warn!("position {}: token0 unknown, skipping", position.id);
            continue;
        };
        let Some(d1) = cache.token(&position.token1_id)?.map(|t| t.decimals) else {
            warn!("position {}: token1 unknown, skipping", position.id);
            continue;
        };
        let pool_tick = cache.pool(&position.pool_id)?.map(|p| p.tick).unwrap_or(0);

        views.push(PositionView {
            id: position.id.clone(),
            pool_id: position.pool_id.clone(),
            pool_address: Address::from_str(&position.pool_id)?,
            pool_tick,
            tick_idx_lower: position.tick_idx_lower,
            tick_idx_upper: position.tick_idx_upper,
            liquidity: position.liquidity,
            collected_fees_token0: position.collected_fees_token0,
            collected_fees_token1: position.collected_fees_token1,
            decimals0: d0,
            decimals1: d1,
        });
    }

    Ok(views)
}

/// Swap ticks per pool, in batch order.
fn collect_pool_ticks(blocks: &[BlockData]) -> Vec<TickObservation> {
    let mut observations = Vec::new();
    for block in blocks {
        for log in &block.logs {
            if log.topic0() != Some(IUniswapV3Pool::Swap::SIGNATURE_HASH) {
                continue;
            }
            if let Ok(e) =
                IUniswapV3Pool::Swap::decode_raw_log(log.topics.iter().copied(), &log.data)
            {
                observations.push(TickObservation {
                    pool_id: crate::model::address_id(log.address),
                    block: block.header.height,
                    tick: e.tick.as_i32(),
                });
            }
        }
    }
    observations
}

/// Last observed tick for `pool_id` at or before `height`, if any swap in
/// the batch touched that pool.
fn current_tick(observations: &[TickObservation], pool_id: &str, height: u64) -> Option<i32> {
    observations
        .iter()
        .filter(|o| o.pool_id == pool_id && o.block <= height)
        .next_back()
        .map(|o| o.tick)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(pool: &str, block: u64, tick: i32) -> TickObservation {
        TickObservation {
            pool_id: pool.to_string(),
            block,
            tick,
        }
    }

    #[test]
    fn current_tick_is_per_pool_and_height_bounded() {
        let observations = vec![
            obs("0xaa", 10, 5),
            obs("0xbb", 11, -3),
            obs("0xaa", 12, 9),
        ];

        // Latest at-or-before each height, per pool.
        assert_eq!(current_tick(&observations, "0xaa", 10), Some(5));
        assert_eq!(current_tick(&observations, "0xaa", 11), Some(5));
        assert_eq!(current_tick(&observations, "0xaa", 12), Some(9));
        assert_eq!(current_tick(&observations, "0xbb", 12), Some(-3));

        // Other pools' swaps never leak across.
        assert_eq!(current_tick(&observations, "0xbb", 10), None);
        assert_eq!(current_tick(&observations, "0xcc", 12), None);
    }
}
