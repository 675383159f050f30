//! Chain-facing types and the log source boundary.
//!
//! The indexer core only needs ordered blocks of logs with enough transaction
//! context to build event records. Where those blocks come from (archive
//! gateway, plain RPC, a replay file) is behind the [`LogSource`] trait;
//! [`RpcLogSource`] is the plain-RPC implementation.

use alloy_primitives::{Address, Bytes, B256};
use alloy_provider::{Provider, ProviderBuilder};
use alloy_rpc_types::{BlockNumberOrTag, Filter};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::Config;

/// Height + timestamp of one block, used as the grouping key for batched
/// event processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    /// Unix timestamp in seconds.
    pub timestamp: u64,
}

impl BlockHeader {
    pub fn time(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.timestamp as i64, 0).unwrap_or_default()
    }
}

/// Parent-transaction fields carried alongside every log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxInfo {
    pub hash: B256,
    pub from: Address,
    pub gas_used: u128,
    pub gas_price: u128,
}

impl TxInfo {
    pub fn id(&self) -> String {
        format!("{:?}", self.hash)
    }
}

/// One raw log, undecoded. Event-kind dispatch happens on `topic0`.
#[derive(Debug, Clone)]
pub struct Log {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub log_index: u64,
    pub transaction_index: u64,
    pub transaction: TxInfo,
}

impl Log {
    pub fn topic0(&self) -> Option<B256> {
        self.topics.first().copied()
    }
}

/// One block's worth of matched logs, in ascending log-index order.
#[derive(Debug, Clone)]
pub struct BlockData {
    pub header: BlockHeader,
    pub logs: Vec<Log>,
}

/// Delivers ordered batches of blocks to the processor. A batch is folded and
/// flushed as one unit; on failure the whole batch is retried from its start.
#[allow(async_fn_in_trait)]
pub trait LogSource {
    /// Next batch of blocks, or `None` when the source is caught up.
    async fn next_batch(&mut self) -> Result<Option<Vec<BlockData>>>;
}

/// Log source backed by plain `eth_getLogs` against an RPC endpoint.
///
/// Pulls `batch_blocks` blocks per call, staying `finality_confirmation`
/// blocks behind the head so reorgs never reach the store.
pub struct RpcLogSource {
    rpc_url: String,
    next_block: u64,
    batch_blocks: u64,
    finality_confirmation: u64,
}

impl RpcLogSource {
    pub fn new(cfg: &Config) -> Self {
        Self {
            rpc_url: cfg.rpc_url.clone(),
            next_block: cfg.start_block,
            batch_blocks: cfg.batch_blocks,
            finality_confirmation: cfg.finality_confirmation,
        }
    }

    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    /// Skip ahead, used when resuming from a checkpoint.
    pub fn resume_from(&mut self, block: u64) {
        self.next_block = self.next_block.max(block);
    }

    /// Move back to retry a failed batch from its first block.
    pub fn rewind_to(&mut self, block: u64) {
        self.next_block = block;
    }
}

impl LogSource for RpcLogSource {
    async fn next_batch(&mut self) -> Result<Option<Vec<BlockData>>> {
        let provider = ProviderBuilder::new().connect_http(self.rpc_url.parse()?);

        let head = provider.get_block_number().await?;
        let safe_head = head.saturating_sub(self.finality_confirmation);
        if self.next_block > safe_head {
            return Ok(None);
        }

        let from = self.next_block;
        let to = safe_head.min(from + self.batch_blocks - 1);

        let filter = Filter::new().from_block(from).to_block(to);
        let logs = provider.get_logs(&filter).await?;
        debug!("fetched {} logs in blocks {}..={}", logs.len(), from, to);

        // Group by block, resolving header timestamps and per-tx gas fields
        // once per block that actually carries logs.
        let mut by_block: HashMap<u64, Vec<alloy_rpc_types::Log>> = HashMap::new();
        for log in logs {
            let number = log
                .block_number
                .ok_or_else(|| eyre!("log without block number"))?;
            by_block.entry(number).or_default().push(log);
        }

        let mut heights: Vec<u64> = by_block.keys().copied().collect();
        heights.sort_unstable();

        let mut blocks = Vec::with_capacity(heights.len());
        for height in heights {
            let block = provider
                .get_block_by_number(BlockNumberOrTag::Number(height))
                .await?
                .ok_or_else(|| eyre!("block {height} disappeared mid-batch"))?;
            let receipts = provider
                .get_block_receipts(height.into())
                .await?
                .unwrap_or_default();

            let mut tx_info: HashMap<B256, TxInfo> = HashMap::new();
            for receipt in receipts {
                tx_info.insert(
                    receipt.transaction_hash,
                    TxInfo {
                        hash: receipt.transaction_hash,
                        from: receipt.from,
                        gas_used: receipt.gas_used as u128,
                        gas_price: receipt.effective_gas_price,
                    },
                );
            }

            let header = BlockHeader {
                height,
                timestamp: block.header.timestamp,
            };

            let mut raw = by_block.remove(&height).unwrap_or_default();
            raw.sort_unstable_by_key(|l| l.log_index);

            let mut parsed = Vec::with_capacity(raw.len());
            for log in raw {
                let hash = log
                    .transaction_hash
                    .ok_or_else(|| eyre!("log without transaction hash"))?;
                let transaction = tx_info.get(&hash).copied().unwrap_or(TxInfo {
                    hash,
                    from: Address::ZERO,
                    gas_used: 0,
                    gas_price: 0,
                });
                parsed.push(Log {
                    address: log.inner.address,
                    topics: log.inner.data.topics().to_vec(),
                    data: log.inner.data.data.clone(),
                    log_index: log.log_index.unwrap_or_default(),
                    transaction_index: log.transaction_index.unwrap_or_default(),
                    transaction,
                });
            }

            blocks.push(BlockData {
                header,
                logs: parsed,
            });
        }

        info!(
            "batch {}..={}: {} blocks with logs",
            from,
            to,
            blocks.len()
        );
        self.next_block = to + 1;
        Ok(Some(blocks))
    }
}
