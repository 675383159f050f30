//! Lending-pair events: deposits, borrows, collateral, liquidations.
//!
//! A single pair contract is indexed, so its aggregate lives in one singleton
//! row. Users are created lazily after the prefetch load - every address an
//! event can reference is deferred up front, then the missing ones are
//! materialized with zeroed totals before the fold starts.

use alloy_primitives::{Address, U256};
use alloy_sol_types::SolEvent;
use eyre::Result;
use std::collections::BTreeSet;

use crate::abi::ILendingPair as Pair;
use crate::block_map::BlockMap;
use crate::cache::EntityCache;
use crate::chain::{BlockData, BlockHeader, TxInfo};
use crate::config::Config;
use crate::model::{
    address_id, event_record_id, BorrowAsset, Collateral, CollateralAction, Deposit, EntityKind,
    LendingPair, Liquidate, RepayAsset, RepayAssetWithCollateral, User, Withdraw,
};
use crate::store::Store;

pub enum LendingEvent {
    Deposit {
        caller: Address,
        owner: Address,
        assets: U256,
        shares: U256,
    },
    Withdraw {
        caller: Address,
        receiver: Address,
        owner: Address,
        assets: U256,
        shares: U256,
    },
    Borrow {
        borrower: Address,
        receiver: Address,
        borrow_amount: U256,
        shares_added: U256,
    },
    Repay {
        payer: Address,
        borrower: Address,
        amount_to_repay: U256,
        shares: U256,
    },
    RepayWithCollateral {
        borrower: Address,
        swapper_address: Address,
        collateral_to_swap: U256,
        amount_asset_out: U256,
        shares_repaid: U256,
    },
    Collateral {
        sender: Address,
        borrower: Address,
        amount: U256,
        action: CollateralAction,
    },
    Liquidate {
        borrower: Address,
        collateral_for_liquidator: U256,
        shares_to_liquidate: U256,
        amount_liquidator_to_repay: U256,
        fees_amount: U256,
        shares_to_adjust: U256,
        amount_to_adjust: U256,
    },
}

pub struct LendingEventData {
    pub event: LendingEvent,
    pub transaction: TxInfo,
    pub log_index: u64,
}

impl LendingEventData {
    /// Addresses this event turns into `User` rows.
    fn user_addresses(&self) -> Vec<Address> {
        match &self.event {
            LendingEvent::Deposit { caller, owner, .. } => vec![*caller, *owner],
            LendingEvent::Withdraw {
                caller,
                receiver,
                owner,
                ..
            } => vec![*caller, *receiver, *owner],
            LendingEvent::Borrow {
                borrower, receiver, ..
            } => vec![*borrower, *receiver],
            LendingEvent::Repay {
                payer, borrower, ..
            } => vec![*payer, *borrower],
            LendingEvent::RepayWithCollateral {
                borrower,
                swapper_address,
                ..
            } => vec![*borrower, *swapper_address],
            LendingEvent::Collateral {
                sender, borrower, ..
            } => vec![*sender, *borrower],
            LendingEvent::Liquidate { borrower, .. } => vec![*borrower],
        }
    }
}

pub fn collect_events(blocks: &[BlockData], pair_address: Address) -> BlockMap<LendingEventData> {
    let mut events = BlockMap::new();

    for block in blocks {
        for log in &block.logs {
            if log.address != pair_address {
                continue;
            }
            let Some(topic0) = log.topic0() else { continue };
            let topics = log.topics.iter().copied();

            let event = if topic0 == Pair::Deposit::SIGNATURE_HASH {
                Pair::Deposit::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| LendingEvent::Deposit {
                        caller: e.caller,
                        owner: e.owner,
                        assets: e.assets,
                        shares: e.shares,
                    })
            } else if topic0 == Pair::Withdraw::SIGNATURE_HASH {
                Pair::Withdraw::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| LendingEvent::Withdraw {
                        caller: e.caller,
                        receiver: e.receiver,
                        owner: e.owner,
                        assets: e.assets,
                        shares: e.shares,
                    })
            } else if topic0 == Pair::BorrowAsset::SIGNATURE_HASH {
                Pair::BorrowAsset::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| LendingEvent::Borrow {
                        borrower: e._borrower,
                        receiver: e._receiver,
                        borrow_amount: e._borrowAmount,
                        shares_added: e._sharesAdded,
                    })
            } else if topic0 == Pair::RepayAsset::SIGNATURE_HASH {
                Pair::RepayAsset::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| LendingEvent::Repay {
                        payer: e.payer,
                        borrower: e.borrower,
                        amount_to_repay: e.amountToRepay,
                        shares: e.shares,
                    })
            } else if topic0 == Pair::RepayAssetWithCollateral::SIGNATURE_HASH {
                Pair::RepayAssetWithCollateral::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| LendingEvent::RepayWithCollateral {
                        borrower: e._borrower,
                        swapper_address: e._swapperAddress,
                        collateral_to_swap: e._collateralToSwap,
                        amount_asset_out: e._amountAssetOut,
                        shares_repaid: e._sharesRepaid,
                    })
            } else if topic0 == Pair::AddCollateral::SIGNATURE_HASH {
                Pair::AddCollateral::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| LendingEvent::Collateral {
                        sender: e.sender,
                        borrower: e.borrower,
                        amount: e.collateralAmount,
                        action: CollateralAction::Add,
                    })
            } else if topic0 == Pair::RemoveCollateral::SIGNATURE_HASH {
                Pair::RemoveCollateral::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| LendingEvent::Collateral {
                        sender: e._sender,
                        borrower: e._borrower,
                        amount: e._collateralAmount,
                        action: CollateralAction::Remove,
                    })
            } else if topic0 == Pair::Liquidate::SIGNATURE_HASH {
                Pair::Liquidate::decode_raw_log(topics, &log.data)
                    .ok()
                    .map(|e| LendingEvent::Liquidate {
                        borrower: e._borrower,
                        collateral_for_liquidator: e._collateralForLiquidator,
                        shares_to_liquidate: e._sharesToLiquidate,
                        amount_liquidator_to_repay: e._amountLiquidatorToRepay,
                        fees_amount: e._feesAmount,
                        shares_to_adjust: e._sharesToAdjust,
                        amount_to_adjust: e._amountToAdjust,
                    })
            } else {
                None
            };

            if let Some(event) = event {
                events.push(
                    block.header,
                    LendingEventData {
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

pub async fn process<S: Store>(
    cache: &mut EntityCache<'_, S>,
    cfg: &Config,
    blocks: &[BlockData],
) -> Result<()> {
    let events = collect_events(blocks, cfg.lending_pair()?);
    if events.is_empty() {
        return Ok(());
    }

    prefetch(cache, &events).await?;

    for (header, block_events) in events.iter() {
        for data in block_events {
            let record_id = event_record_id(&data.transaction.id(), data.log_index);
            super::record_tx(cache, header, &data.transaction);
            match &data.event {
                LendingEvent::Deposit {
                    caller,
                    owner,
                    assets,
                    shares,
                } => {
                    cache.add(Deposit {
                        id: record_id,
                        caller: *caller,
                        owner: *owner,
                        assets: *assets,
                        shares: *shares,
                        block_number: header.height,
                        timestamp: header.time(),
                    });
                    touch_pair(cache, header, |pair| {
                        pair.total_deposits += *assets;
                        pair.deposit_count += 1;
                    })?;
                    touch_user(cache, header, *owner, |user| {
                        user.total_deposits += *assets;
                        user.deposit_count += 1;
                    })?;
                }
                LendingEvent::Withdraw {
                    caller,
                    receiver,
                    owner,
                    assets,
                    shares,
                } => {
                    cache.add(Withdraw {
                        id: record_id,
                        caller: *caller,
                        receiver: *receiver,
                        owner: *owner,
                        assets: *assets,
                        shares: *shares,
                        block_number: header.height,
                        timestamp: header.time(),
                    });
                    touch_pair(cache, header, |pair| {
                        pair.total_deposits = pair.total_deposits.saturating_sub(*assets);
                        pair.withdraw_count += 1;
                    })?;
                    touch_user(cache, header, *owner, |user| {
                        user.total_deposits = user.total_deposits.saturating_sub(*assets);
                        user.withdraw_count += 1;
                    })?;
                }
                LendingEvent::Borrow {
                    borrower,
                    receiver,
                    borrow_amount,
                    shares_added,
                } => {
                    cache.add(BorrowAsset {
                        id: record_id,
                        borrower: *borrower,
                        receiver: *receiver,
                        borrow_amount: *borrow_amount,
                        shares_added: *shares_added,
                        block_number: header.height,
                        timestamp: header.time(),
                    });
                    touch_pair(cache, header, |pair| {
                        pair.total_borrows += *borrow_amount;
                        pair.borrow_count += 1;
                    })?;
                    touch_user(cache, header, *borrower, |user| {
                        user.total_borrows += *borrow_amount;
                        user.borrow_count += 1;
                    })?;
                }
                LendingEvent::Repay {
                    payer,
                    borrower,
                    amount_to_repay,
                    shares,
                } => {
                    cache.add(RepayAsset {
                        id: record_id,
                        payer: *payer,
                        borrower: *borrower,
                        amount_to_repay: *amount_to_repay,
                        shares: *shares,
                        block_number: header.height,
                        timestamp: header.time(),
                    });
                    touch_pair(cache, header, |pair| {
                        pair.total_borrows = pair.total_borrows.saturating_sub(*amount_to_repay);
                        pair.repay_count += 1;
                    })?;
                    touch_user(cache, header, *borrower, |user| {
                        user.total_borrows = user.total_borrows.saturating_sub(*amount_to_repay);
                        user.repay_count += 1;
                    })?;
                }
                LendingEvent::RepayWithCollateral {
                    borrower,
                    swapper_address,
                    collateral_to_swap,
                    amount_asset_out,
                    shares_repaid,
                } => {
                    cache.add(RepayAssetWithCollateral {
                        id: record_id,
                        borrower: *borrower,
                        swapper_address: *swapper_address,
                        collateral_to_swap: *collateral_to_swap,
                        amount_asset_out: *amount_asset_out,
                        shares_repaid: *shares_repaid,
                        block_number: header.height,
                        timestamp: header.time(),
                    });
                    touch_pair(cache, header, |pair| {
                        pair.total_borrows = pair.total_borrows.saturating_sub(*amount_asset_out);
                        pair.repay_count += 1;
                    })?;
                    touch_user(cache, header, *borrower, |user| {
                        user.total_borrows = user.total_borrows.saturating_sub(*amount_asset_out);
                        user.repay_count += 1;
                    })?;
                }
                LendingEvent::Collateral {
                    sender,
                    borrower,
                    amount,
                    action,
                } => {
                    cache.add(Collateral {
                        id: record_id,
                        sender: *sender,
                        borrower: *borrower,
                        amount: *amount,
                        action: *action,
                        block_number: header.height,
                        timestamp: header.time(),
                    });
                    let add = *action == CollateralAction::Add;
                    touch_pair(cache, header, |pair| {
                        pair.total_collateral = if add {
                            pair.total_collateral + *amount
                        } else {
                            pair.total_collateral.saturating_sub(*amount)
                        };
                        pair.collateral_count += 1;
                    })?;
                    touch_user(cache, header, *borrower, |user| {
                        user.total_collateral = if add {
                            user.total_collateral + *amount
                        } else {
                            user.total_collateral.saturating_sub(*amount)
                        };
                        user.collateral_count += 1;
                    })?;
                }
                LendingEvent::Liquidate {
                    borrower,
                    collateral_for_liquidator,
                    shares_to_liquidate,
                    amount_liquidator_to_repay,
                    fees_amount,
                    shares_to_adjust,
                    amount_to_adjust,
                } => {
                    cache.add(Liquidate {
                        id: record_id,
                        borrower: *borrower,
                        collateral_for_liquidator: *collateral_for_liquidator,
                        shares_to_liquidate: *shares_to_liquidate,
                        amount_liquidator_to_repay: *amount_liquidator_to_repay,
                        fees_amount: *fees_amount,
                        shares_to_adjust: *shares_to_adjust,
                        amount_to_adjust: *amount_to_adjust,
                        block_number: header.height,
                        timestamp: header.time(),
                    });
                    touch_pair(cache, header, |pair| {
                        pair.total_liquidations += *amount_liquidator_to_repay;
                        pair.liquidation_count += 1;
                    })?;
                }
            }
        }
    }

    Ok(())
}

/// Defer the singleton and every referenced user, then create the rows that
/// do not exist yet so the fold can use `get_or_fail` semantics throughout.
async fn prefetch<S: Store>(
    cache: &mut EntityCache<'_, S>,
    events: &BlockMap<LendingEventData>,
) -> Result<()> {
    let mut user_ids = BTreeSet::new();
    for (_, block_events) in events.iter() {
        for data in block_events {
            for address in data.user_addresses() {
                user_ids.insert(address_id(address));
            }
        }
    }

    cache.defer_all(EntityKind::User, user_ids.iter().cloned());
    cache.defer(EntityKind::LendingPair, LendingPair::SINGLETON_ID);
    cache.load(EntityKind::User).await?;
    cache.load(EntityKind::LendingPair).await?;

    for id in user_ids {
        if cache.get(EntityKind::User, &id)?.is_none() {
            cache.add(User::new(id));
        }
    }
    if cache
        .get(EntityKind::LendingPair, LendingPair::SINGLETON_ID)?
        .is_none()
    {
        cache.add(LendingPair::new());
    }

    Ok(())
}

fn touch_pair<S: Store>(
    cache: &mut EntityCache<'_, S>,
    header: &BlockHeader,
    apply: impl FnOnce(&mut LendingPair),
) -> Result<()> {
    let pair = cache
        .lending_pair_mut()?
        .ok_or_else(|| eyre::eyre!("lending pair singleton missing after prefetch"))?;
    apply(pair);
    pair.last_update_block_number = header.height;
    pair.last_update_timestamp = header.time();
    Ok(())
}

fn touch_user<S: Store>(
    cache: &mut EntityCache<'_, S>,
    header: &BlockHeader,
    address: Address,
    apply: impl FnOnce(&mut User),
) -> Result<()> {
    let id = address_id(address);
    let user = cache
        .user_mut(&id)?
        .ok_or_else(|| eyre::eyre!("user {id} missing after prefetch"))?;
    apply(user);
    user.last_update_block_number = header.height;
    user.last_update_timestamp = header.time();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::B256;
    use alloy_sol_types::SolValue;

    fn header(height: u64) -> BlockHeader {
        BlockHeader {
            height,
            timestamp: 1_700_000_000,
        }
    }

    fn tx_info(byte: u8) -> TxInfo {
        TxInfo {
            hash: B256::repeat_byte(byte),
            from: Address::ZERO,
            gas_used: 0,
            gas_price: 0,
        }
    }

    fn deposit_log(pair: Address, owner: Address, assets: u64, log_index: u64) -> crate::chain::Log {
        let caller = Address::repeat_byte(0xca);
        let body = (U256::from(assets), U256::from(assets)).abi_encode();
        crate::chain::Log {
            address: pair,
            topics: vec![
                Pair::Deposit::SIGNATURE_HASH,
                caller.into_word(),
                owner.into_word(),
            ],
            data: body.into(),
            log_index,
            transaction_index: 0,
            transaction: tx_info(0x11),
        }
    }

    #[test]
    fn foreign_contract_logs_are_ignored() {
        let pair = Address::repeat_byte(0xee);
        let owner = Address::repeat_byte(1);
        let blocks = vec![BlockData {
            header: header(1),
            logs: vec![
                deposit_log(pair, owner, 100, 0),
                deposit_log(Address::repeat_byte(0xef), owner, 100, 1),
            ],
        }];
        assert_eq!(collect_events(&blocks, pair).item_count(), 1);
    }

    #[tokio::test]
    async fn deposits_accumulate_on_pair_and_user() {
        let store = crate::store::MemoryStore::new();
        let mut cache = EntityCache::new(&store);
        let pair = Address::repeat_byte(0xee);
        let owner = Address::repeat_byte(1);

        let mut cfg = Config::default();
        cfg.lending_pair_address = format!("{pair:?}");

        let blocks = vec![BlockData {
            header: header(10),
            logs: vec![
                deposit_log(pair, owner, 100, 0),
                deposit_log(pair, owner, 50, 1),
            ],
        }];
        process(&mut cache, &cfg, &blocks).await.unwrap();

        let pair_row = cache
            .get_or_fail(EntityKind::LendingPair, LendingPair::SINGLETON_ID)
            .unwrap();
        let pair_row = pair_row.as_lending_pair().unwrap();
        assert_eq!(pair_row.total_deposits, U256::from(150u64));
        assert_eq!(pair_row.deposit_count, 2);
        assert_eq!(pair_row.last_update_block_number, 10);

        let user_row = cache
            .get_or_fail(EntityKind::User, &address_id(owner))
            .unwrap();
        let user_row = user_row.as_user().unwrap();
        assert_eq!(user_row.total_deposits, U256::from(150u64));

        // Both deposit logs share a transaction but have distinct log
        // indexes, so both records exist.
        assert_eq!(cache.len(EntityKind::Deposit), 2);
    }

    #[tokio::test]
    async fn withdraw_saturates_rather_than_underflows() {
        let store = crate::store::MemoryStore::new();
        let mut cache = EntityCache::new(&store);
        let pair = Address::repeat_byte(0xee);
        let owner = Address::repeat_byte(1);

        let mut cfg = Config::default();
        cfg.lending_pair_address = format!("{pair:?}");

        let caller = Address::repeat_byte(0xca);
        let body = (U256::from(500u64), U256::from(500u64)).abi_encode();
        let withdraw = crate::chain::Log {
            address: pair,
            topics: vec![
                Pair::Withdraw::SIGNATURE_HASH,
                caller.into_word(),
                owner.into_word(),
                owner.into_word(),
            ],
            data: body.into(),
            log_index: 0,
            transaction_index: 0,
            transaction: tx_info(0x22),
        };
        let blocks = vec![BlockData {
            header: header(3),
            logs: vec![withdraw],
        }];
        process(&mut cache, &cfg, &blocks).await.unwrap();

        let pair_row = cache
            .get_or_fail(EntityKind::LendingPair, LendingPair::SINGLETON_ID)
            .unwrap();
        assert_eq!(
            pair_row.as_lending_pair().unwrap().total_deposits,
            U256::ZERO
        );
    }
}
