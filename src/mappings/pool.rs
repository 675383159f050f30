//! Pool lifecycle: creation, initialization, and swap-driven state.
//!
//! PoolCreated logs are accepted only from the configured factory.
//! Initialize and Swap logs are matched by topic from any address and
//! filtered against known pools during the fold, so look-alike events from
//! unrelated contracts fall through harmlessly.

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolEvent;
use eyre::Result;
use std::collections::BTreeSet;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::abi::{IERC20, IUniswapV3Factory, IUniswapV3Pool};
use crate::block_map::BlockMap;
use crate::cache::EntityCache;
use crate::chain::BlockData;
use crate::config::Config;
use crate::model::{address_id, to_decimal, EntityKind, Pool, Token};
use crate::multicall::{CallExecutor, Multicall};
use crate::pricing::{sqrt_price_x96_to_token_prices, PriceTracker};
use crate::store::Store;

pub enum PoolEvent {
    Created {
        pool: Address,
        token0: Address,
        token1: Address,
        fee: u32,
    },
    Initialize {
        pool: Address,
        sqrt_price_x96: U256,
        tick: i32,
    },
    Swap {
        pool: Address,
        amount0: U256,
        amount1: U256,
        sqrt_price_x96: U256,
        liquidity: u128,
        tick: i32,
    },
}

impl PoolEvent {
    fn pool_id(&self) -> String {
        let pool = match self {
            PoolEvent::Created { pool, .. } => pool,
            PoolEvent::Initialize { pool, .. } => pool,
            PoolEvent::Swap { pool, .. } => pool,
        };
        address_id(*pool)
    }
}

pub fn collect_events(blocks: &[BlockData], factory: Address) -> BlockMap<PoolEvent> {
    let mut events = BlockMap::new();

    for block in blocks {
        for log in &block.logs {
            let Some(topic0) = log.topic0() else { continue };

            if topic0 == IUniswapV3Factory::PoolCreated::SIGNATURE_HASH {
                if log.address != factory {
                    continue;
                }
                if let Ok(e) = IUniswapV3Factory::PoolCreated::decode_raw_log(
                    log.topics.iter().copied(),
                    &log.data,
                ) {
                    events.push(
                        block.header,
                        PoolEvent::Created {
                            pool: e.pool,
                            token0: e.token0,
                            token1: e.token1,
                            fee: e.fee.to::<u32>(),
                        },
                    );
                }
            } else if topic0 == IUniswapV3Pool::Initialize::SIGNATURE_HASH {
                if let Ok(e) = IUniswapV3Pool::Initialize::decode_raw_log(
                    log.topics.iter().copied(),
                    &log.data,
                ) {
                    events.push(
                        block.header,
                        PoolEvent::Initialize {
                            pool: log.address,
                            sqrt_price_x96: U256::from(e.sqrtPriceX96),
                            tick: e.tick.as_i32(),
                        },
                    );
                }
            } else if topic0 == IUniswapV3Pool::Swap::SIGNATURE_HASH {
                if let Ok(e) =
                    IUniswapV3Pool::Swap::decode_raw_log(log.topics.iter().copied(), &log.data)
                {
                    events.push(
                        block.header,
                        PoolEvent::Swap {
                            pool: log.address,
                            amount0: e.amount0.unsigned_abs(),
                            amount1: e.amount1.unsigned_abs(),
                            sqrt_price_x96: U256::from(e.sqrtPriceX96),
                            liquidity: e.liquidity,
                            tick: e.tick.as_i32(),
                        },
                    );
                }
            }
        }
    }

    events
}

pub async fn process<S: Store, E: CallExecutor>(
    cache: &mut EntityCache<'_, S>,
    multicall: &Multicall<E>,
    cfg: &Config,
    tracker: &PriceTracker,
    blocks: &[BlockData],
) -> Result<()> {
    let events = collect_events(blocks, cfg.factory()?);
    if events.is_empty() {
        return Ok(());
    }

    prefetch(cache, multicall, cfg, &events).await?;

    for (header, block_events) in events.iter() {
        for event in block_events {
            match event {
                PoolEvent::Created {
                    pool,
                    token0,
                    token1,
                    fee,
                } => {
                    let id = address_id(*pool);
                    if cache.pool(&id)?.is_none() {
                        cache.add(Pool::new(
                            id,
                            address_id(*token0),
                            address_id(*token1),
                            *fee,
                            header,
                        ));
                    }
                }
                PoolEvent::Initialize {
                    pool,
                    sqrt_price_x96,
                    tick,
                } => {
                    let id = address_id(*pool);
                    let Some((price0, price1)) = pool_prices(cache, &id, *sqrt_price_x96)? else {
                        continue;
                    };
                    if let Some(p) = cache.pool_mut(&id)? {
                        p.sqrt_price_x96 = *sqrt_price_x96;
                        p.tick = *tick;
                        p.token0_price = price0;
                        p.token1_price = price1;
                    }
                }
                PoolEvent::Swap {
                    pool,
                    amount0,
                    amount1,
                    sqrt_price_x96,
                    liquidity,
                    tick,
                } => {
                    let id = address_id(*pool);
                    let Some(p) = cache.pool(&id)? else { continue };
                    let (token0_id, token1_id) = (p.token0_id.clone(), p.token1_id.clone());

                    let Some(d0) = cache.token(&token0_id)?.map(|t| t.decimals) else {
                        continue;
                    };
                    let Some(d1) = cache.token(&token1_id)?.map(|t| t.decimals) else {
                        continue;
                    };

                    let (price0, price1) =
                        sqrt_price_x96_to_token_prices(*sqrt_price_x96, d0, d1);
                    let amount0 = to_decimal(*amount0, d0);
                    let amount1 = to_decimal(*amount1, d1);

                    // Stable-coin anchored USD legs: a stable leg is worth
                    // its face amount, a leg paired against a stable is worth
                    // the pool's exchange rate.
                    let price0_usd = if tracker.is_stable_coin(&token0_id) {
                        1.0
                    } else if tracker.is_stable_coin(&token1_id) {
                        price1
                    } else {
                        0.0
                    };
                    let price1_usd = if tracker.is_stable_coin(&token1_id) {
                        1.0
                    } else if tracker.is_stable_coin(&token0_id) {
                        price0
                    } else {
                        0.0
                    };
                    let volume_usd = tracker.tracked_amount_usd(
                        &token0_id,
                        amount0 * price0_usd,
                        &token1_id,
                        amount1 * price1_usd,
                    );

                    if let Some(p) = cache.pool_mut(&id)? {
                        p.sqrt_price_x96 = *sqrt_price_x96;
                        p.tick = *tick;
                        p.liquidity = *liquidity;
                        p.token0_price = price0;
                        p.token1_price = price1;
                        p.volume_token0 += amount0;
                        p.volume_token1 += amount1;
                        p.volume_usd += volume_usd;
                    }
                }
            }
        }
    }

    Ok(())
}

/// Derived prices for a known pool, `None` when the pool or a token is
/// unknown (non-factory contract emitting matching topics).
fn pool_prices<S: Store>(
    cache: &EntityCache<'_, S>,
    pool_id: &str,
    sqrt_price_x96: U256,
) -> Result<Option<(f64, f64)>> {
    let Some(pool) = cache.pool(pool_id)? else {
        return Ok(None);
    };
    let Some(d0) = cache.token(&pool.token0_id)?.map(|t| t.decimals) else {
        return Ok(None);
    };
    let Some(d1) = cache.token(&pool.token1_id)?.map(|t| t.decimals) else {
        return Ok(None);
    };
    Ok(Some(sqrt_price_x96_to_token_prices(sqrt_price_x96, d0, d1)))
}

/// Defer and load pools and their tokens, backfilling metadata for tokens the
/// store has never seen via ERC-20 reads.
async fn prefetch<S: Store, E: CallExecutor>(
    cache: &mut EntityCache<'_, S>,
    multicall: &Multicall<E>,
    cfg: &Config,
    events: &BlockMap<PoolEvent>,
) -> Result<()> {
    let mut token_ids = BTreeSet::new();

    for (_, block_events) in events.iter() {
        for event in block_events {
            cache.defer(EntityKind::Pool, event.pool_id());
            if let PoolEvent::Created { token0, token1, .. } = event {
                token_ids.insert(address_id(*token0));
                token_ids.insert(address_id(*token1));
            }
        }
    }
    cache.load(EntityKind::Pool).await?;

    for entity in cache.values(EntityKind::Pool) {
        if let Some(pool) = entity.as_pool() {
            token_ids.insert(pool.token0_id.clone());
            token_ids.insert(pool.token1_id.clone());
        }
    }
    cache.defer_all(EntityKind::Token, token_ids.iter().cloned());
    cache.load(EntityKind::Token).await?;

    let mut unknown = Vec::new();
    for id in &token_ids {
        if cache.token(id)?.is_none() {
            unknown.push(Address::from_str(id)?);
        }
    }
    if unknown.is_empty() {
        return Ok(());
    }
    debug!("backfilling metadata for {} tokens", unknown.len());

    let symbol_calls = unknown
        .iter()
        .map(|a| (*a, IERC20::symbolCall {}))
        .collect();
    let decimals_calls = unknown
        .iter()
        .map(|a| (*a, IERC20::decimalsCall {}))
        .collect();
    // Symbol and decimals are immutable, so these reads need no block pin.
    let (symbols, decimals) = futures::try_join!(
        multicall.try_aggregate_multi(symbol_calls, None, cfg.multicall_page_size),
        multicall.try_aggregate_multi(decimals_calls, None, cfg.multicall_page_size),
    )?;

    for ((address, symbol), decimals) in unknown.iter().zip(symbols).zip(decimals) {
        let Some(decimals) = decimals.ok() else {
            // Without decimals every amount conversion would be wrong;
            // leave the token unknown and let its pools sit unpriced.
            warn!("token {address:?} has no readable decimals, skipping");
            continue;
        };
        cache.add(Token {
            id: address_id(*address),
            symbol: symbol.ok().unwrap_or_else(|| "UNKNOWN".to_string()),
            decimals,
        });
    }

    Ok(())
}
