//! NonfungiblePositionManager events: position lifecycle and ownership.
//!
//! Positions referenced for the first time are backfilled from chain state in
//! the prefetch phase - a tolerant `positions(tokenId)` read (burned ids fail
//! cleanly) followed by a strict factory `getPool` resolution. The fold
//! handlers themselves never touch the network.

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolEvent;
use eyre::Result;
use std::collections::BTreeSet;
use tracing::debug;

use crate::abi::{INonfungiblePositionManager as Npm, IUniswapV3Factory};
use crate::block_map::BlockMap;
use crate::cache::EntityCache;
use crate::chain::{BlockData, BlockHeader, TxInfo};
use crate::config::Config;
use crate::model::{
    address_id, event_record_id, to_decimal, DecreaseLiquidity, EntityKind, Position,
    PositionSnapshot, Tick,
};
use crate::multicall::{CallExecutor, Multicall};
use crate::store::Store;

pub enum PositionEvent {
    Increase {
        position_id: String,
        liquidity: u128,
        amount0: U256,
        amount1: U256,
    },
    Decrease {
        position_id: String,
        liquidity: u128,
        amount0: U256,
        amount1: U256,
    },
    Collect {
        position_id: String,
        amount0: U256,
        amount1: U256,
    },
    Transfer {
        position_id: String,
        to: Address,
    },
}

/// Event plus the log context every handler needs.
pub struct PositionEventData {
    pub event: PositionEvent,
    pub transaction: TxInfo,
    pub log_index: u64,
}

impl PositionEventData {
    fn position_id(&self) -> &str {
        match &self.event {
            PositionEvent::Increase { position_id, .. } => position_id,
            PositionEvent::Decrease { position_id, .. } => position_id,
            PositionEvent::Collect { position_id, .. } => position_id,
            PositionEvent::Transfer { position_id, .. } => position_id,
        }
    }
}

pub fn collect_events(blocks: &[BlockData], positions_address: Address) -> BlockMap<PositionEventData> {
    let mut events = BlockMap::new();

    for block in blocks {
        for log in &block.logs {
            if log.address != positions_address {
                continue;
            }
            let Some(topic0) = log.topic0() else { continue };
            let topics = log.topics.iter().copied();

            let event = if topic0 == Npm::IncreaseLiquidity::SIGNATURE_HASH {
                Npm::IncreaseLiquidity::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| PositionEvent::Increase {
                        position_id: e.tokenId.to_string(),
                        liquidity: e.liquidity,
                        amount0: e.amount0,
                        amount1: e.amount1,
                    })
            } else if topic0 == Npm::DecreaseLiquidity::SIGNATURE_HASH {
                Npm::DecreaseLiquidity::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| PositionEvent::Decrease {
                        position_id: e.tokenId.to_string(),
                        liquidity: e.liquidity,
                        amount0: e.amount0,
                        amount1: e.amount1,
                    })
            } else if topic0 == Npm::Collect::SIGNATURE_HASH {
                Npm::Collect::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| PositionEvent::Collect {
                        position_id: e.tokenId.to_string(),
                        amount0: e.amount0,
                        amount1: e.amount1,
                    })
            } else if topic0 == Npm::Transfer::SIGNATURE_HASH {
                Npm::Transfer::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| PositionEvent::Transfer {
                        position_id: e.tokenId.to_string(),
                        to: e.to,
                    })
            } else {
                None
            };

            if let Some(event) = event {
                events.push(
                    block.header,
                    PositionEventData {
                        event,
                        transaction: log.transaction,
                        log_index: log.log_index,
                    },
                );
            }
        }
    }

    events
}

pub async fn process<S: Store, E: CallExecutor>(
    cache: &mut EntityCache<'_, S>,
    multicall: &Multicall<E>,
    cfg: &Config,
    blocks: &[BlockData],
) -> Result<()> {
    let events = collect_events(blocks, cfg.positions()?);
    if events.is_empty() {
        return Ok(());
    }

    let last_header = blocks[blocks.len() - 1].header;
    prefetch(cache, multicall, cfg, &events, &last_header).await?;

    for (header, block_events) in events.iter() {
        for data in block_events {
            match &data.event {
                PositionEvent::Increase {
                    position_id,
                    liquidity,
                    amount0,
                    amount1,
                } => handle_increase(cache, header, data, position_id, *liquidity, *amount0, *amount1)?,
                PositionEvent::Decrease {
                    position_id,
                    liquidity,
                    amount0,
                    amount1,
                } => handle_decrease(cache, header, data, position_id, *liquidity, *amount0, *amount1)?,
                PositionEvent::Collect {
                    position_id,
                    amount0,
                    amount1,
                } => handle_collect(cache, header, data, position_id, *amount0, *amount1)?,
                PositionEvent::Transfer { position_id, to } => {
                    handle_transfer(cache, header, data, position_id, *to)?
                }
            }
        }
    }

    Ok(())
}

// ============================================
// PREFETCH
// ============================================

async fn prefetch<S: Store, E: CallExecutor>(
    cache: &mut EntityCache<'_, S>,
    multicall: &Multicall<E>,
    cfg: &Config,
    events: &BlockMap<PositionEventData>,
    header: &BlockHeader,
) -> Result<()> {
    let mut position_ids = BTreeSet::new();
    for (_, block_events) in events.iter() {
        for data in block_events {
            position_ids.insert(data.position_id().to_string());
        }
    }
    cache.defer_all(EntityKind::Position, position_ids.iter().cloned());
    cache.load(EntityKind::Position).await?;

    let mut unknown = Vec::new();
    for id in &position_ids {
        if cache.position(id)?.is_none() {
            unknown.push(id.clone());
        }
    }
    init_positions(cache, multicall, cfg, unknown, header).await?;

    // Tokens and boundary ticks for every position the fold will touch.
    let mut token_ids = BTreeSet::new();
    let mut tick_ids = BTreeSet::new();
    for entity in cache.values(EntityKind::Position) {
        if let Some(position) = entity.as_position() {
            token_ids.insert(position.token0_id.clone());
            token_ids.insert(position.token1_id.clone());
            tick_ids.insert(position.tick_lower_id.clone());
            tick_ids.insert(position.tick_upper_id.clone());
        }
    }
    cache.defer_all(EntityKind::Token, token_ids);
    cache.defer_all(EntityKind::Tick, tick_ids);
    cache.load(EntityKind::Token).await?;
    cache.load(EntityKind::Tick).await?;

    Ok(())
}

/// Backfill never-seen positions from chain state. Ids that fail the
/// `positions()` read (burned NFTs) are dropped for the batch; everything
/// past that point is strict.
async fn init_positions<S: Store, E: CallExecutor>(
    cache: &mut EntityCache<'_, S>,
    multicall: &Multicall<E>,
    cfg: &Config,
    ids: Vec<String>,
    header: &BlockHeader,
) -> Result<()> {
    if ids.is_empty() {
        return Ok(());
    }
    debug!("backfilling {} unknown positions", ids.len());

    let calls = ids
        .iter()
        .map(|id| {
            Ok(Npm::positionsCall {
                tokenId: U256::from_str_radix(id, 10)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;
    let results = multicall
        .try_aggregate(
            cfg.positions()?,
            calls,
            Some(header.height),
            cfg.multicall_page_size,
        )
        .await?;

    // Liquidity is intentionally not taken from the chain read: it
    // accumulates from the events themselves so replays stay deterministic.
    struct Fetched {
        id: String,
        token0: Address,
        token1: Address,
        fee: u32,
        tick_lower: i32,
        tick_upper: i32,
        fee_growth_inside0_last_x128: U256,
        fee_growth_inside1_last_x128: U256,
    }

    let mut fetched = Vec::new();
    for (id, result) in ids.into_iter().zip(results) {
        let Some(value) = result.ok() else { continue };
        fetched.push(Fetched {
            id,
            token0: value.token0,
            token1: value.token1,
            fee: value.fee.to::<u32>(),
            tick_lower: value.tickLower.as_i32(),
            tick_upper: value.tickUpper.as_i32(),
            fee_growth_inside0_last_x128: value.feeGrowthInside0LastX128,
            fee_growth_inside1_last_x128: value.feeGrowthInside1LastX128,
        });
    }
    if fetched.is_empty() {
        return Ok(());
    }

    let pool_calls = fetched
        .iter()
        .map(|f| IUniswapV3Factory::getPoolCall {
            tokenA: f.token0,
            tokenB: f.token1,
            fee: alloy_primitives::aliases::U24::from(f.fee),
        })
        .collect();
    let pool_ids = multicall
        .aggregate(
            cfg.factory()?,
            pool_calls,
            Some(header.height),
            cfg.multicall_page_size,
        )
        .await?;

    let entries: Vec<(Fetched, String)> = fetched
        .into_iter()
        .zip(pool_ids)
        .map(|(f, pool)| (f, address_id(pool)))
        .collect();

    for (f, pool_id) in &entries {
        cache.defer(EntityKind::Tick, Tick::make_id(pool_id, f.tick_lower));
        cache.defer(EntityKind::Tick, Tick::make_id(pool_id, f.tick_upper));
    }
    cache.load(EntityKind::Tick).await?;

    for (f, pool_id) in entries {
        let tick_lower_id = Tick::make_id(&pool_id, f.tick_lower);
        let tick_upper_id = Tick::make_id(&pool_id, f.tick_upper);

        // Boundary ticks are created lazily on first reference.
        for (tick_id, tick_idx) in [(&tick_lower_id, f.tick_lower), (&tick_upper_id, f.tick_upper)]
        {
            if cache.get(EntityKind::Tick, tick_id)?.is_none() {
                cache.add(Tick::new(&pool_id, tick_idx, header));
            }
        }

        let mut position = Position::new(f.id);
        position.pool_id = pool_id;
        position.token0_id = address_id(f.token0);
        position.token1_id = address_id(f.token1);
        position.tick_lower_id = tick_lower_id;
        position.tick_upper_id = tick_upper_id;
        position.tick_idx_lower = f.tick_lower;
        position.tick_idx_upper = f.tick_upper;
        position.fee_growth_inside0_last_x128 = f.fee_growth_inside0_last_x128;
        position.fee_growth_inside1_last_x128 = f.fee_growth_inside1_last_x128;
        cache.add(position);
    }

    Ok(())
}

// ============================================
// FOLD HANDLERS
// ============================================

/// Decimal-scaled token amounts for a position's pair, `None` when either
/// token is unknown.
fn scaled_amounts<S: Store>(
    cache: &EntityCache<'_, S>,
    position_id: &str,
    amount0: U256,
    amount1: U256,
) -> Result<Option<(f64, f64)>> {
    let Some(position) = cache.position(position_id)? else {
        return Ok(None);
    };
    let (t0, t1) = (position.token0_id.clone(), position.token1_id.clone());
    let Some(d0) = cache.token(&t0)?.map(|t| t.decimals) else {
        return Ok(None);
    };
    let Some(d1) = cache.token(&t1)?.map(|t| t.decimals) else {
        return Ok(None);
    };
    Ok(Some((to_decimal(amount0, d0), to_decimal(amount1, d1))))
}

fn handle_increase<S: Store>(
    cache: &mut EntityCache<'_, S>,
    header: &BlockHeader,
    data: &PositionEventData,
    position_id: &str,
    liquidity: u128,
    amount0: U256,
    amount1: U256,
) -> Result<()> {
    let Some((amount0, amount1)) = scaled_amounts(cache, position_id, amount0, amount1)? else {
        return Ok(());
    };
    let tx_id = super::record_tx(cache, header, &data.transaction);

    let snapshot = cache.position_mut(position_id)?.map(|position| {
        position.liquidity += liquidity;
        position.deposited_token0 += amount0;
        position.deposited_token1 += amount1;
        if position.created_at_block_number == 0 {
            position.created_at_block_number = header.height;
            position.created_at_timestamp = header.time();
        }
        position.last_update_block_number = header.height;
        position.last_update_timestamp = header.time();
        PositionSnapshot::from_position(position, header, tx_id)
    });
    if let Some(snapshot) = snapshot {
        cache.add(snapshot);
    }
    Ok(())
}

fn handle_decrease<S: Store>(
    cache: &mut EntityCache<'_, S>,
    header: &BlockHeader,
    data: &PositionEventData,
    position_id: &str,
    liquidity: u128,
    amount0: U256,
    amount1: U256,
) -> Result<()> {
    let Some((amount0, amount1)) = scaled_amounts(cache, position_id, amount0, amount1)? else {
        return Ok(());
    };
    let tx_id = super::record_tx(cache, header, &data.transaction);

    let snapshot = cache.position_mut(position_id)?.map(|position| {
        position.liquidity = position.liquidity.saturating_sub(liquidity);
        position.withdrawn_token0 += amount0;
        position.withdrawn_token1 += amount1;
        position.last_update_block_number = header.height;
        position.last_update_timestamp = header.time();
        PositionSnapshot::from_position(position, header, tx_id.clone())
    });
    let Some(snapshot) = snapshot else {
        return Ok(());
    };
    cache.add(snapshot);

    cache.add(DecreaseLiquidity {
        id: event_record_id(&tx_id, data.log_index),
        transaction_id: tx_id,
        position_id: position_id.to_string(),
        liquidity,
        amount0,
        amount1,
        log_index: data.log_index,
        timestamp: header.time(),
    });
    Ok(())
}

fn handle_collect<S: Store>(
    cache: &mut EntityCache<'_, S>,
    header: &BlockHeader,
    data: &PositionEventData,
    position_id: &str,
    amount0: U256,
    amount1: U256,
) -> Result<()> {
    let Some((amount0, amount1)) = scaled_amounts(cache, position_id, amount0, amount1)? else {
        return Ok(());
    };
    let tx_id = super::record_tx(cache, header, &data.transaction);

    let snapshot = cache.position_mut(position_id)?.map(|position| {
        position.collected_fees_token0 += amount0;
        position.collected_fees_token1 += amount1;
        position.last_update_block_number = header.height;
        position.last_update_timestamp = header.time();
        PositionSnapshot::from_position(position, header, tx_id)
    });
    if let Some(snapshot) = snapshot {
        cache.add(snapshot);
    }
    Ok(())
}

fn handle_transfer<S: Store>(
    cache: &mut EntityCache<'_, S>,
    header: &BlockHeader,
    data: &PositionEventData,
    position_id: &str,
    to: Address,
) -> Result<()> {
    if cache.position(position_id)?.is_none() {
        return Ok(());
    }
    let tx_id = super::record_tx(cache, header, &data.transaction);

    let snapshot = cache.position_mut(position_id)?.map(|position| {
        position.owner = to;
        position.last_update_block_number = header.height;
        position.last_update_timestamp = header.time();
        PositionSnapshot::from_position(position, header, tx_id)
    });
    if let Some(snapshot) = snapshot {
        cache.add(snapshot);
    }
    Ok(())
}
