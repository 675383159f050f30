//! Protocol indexer - AMM positions, unrealized fees, and lending activity.
//!
//! Run with: cargo run
//!
//! Pulls finalized blocks in batches over plain RPC, folds every tracked
//! contract's events into entity state, values open positions against fresh
//! chain reads, and flushes each batch atomically. A JSON-lines checkpoint
//! file makes restarts resume at the last flushed batch.

use color_eyre::eyre::Result;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod abi;
mod block_map;
mod cache;
mod chain;
mod config;
mod errors;
mod fees;
mod mappings;
mod model;
mod multicall;
mod pricing;
mod processor;
mod store;

use chain::{LogSource, RpcLogSource};
use config::{Checkpoint, Config};
use multicall::{Multicall, RpcCallExecutor};
use pricing::PriceTracker;
use store::MemoryStore;

/// Poll interval once the source is caught up to the finalized head.
const IDLE_POLL: Duration = Duration::from_secs(12);

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tao_indexer=info".parse()?),
        )
        .init();

    let config = Config::from_env()?;
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        error!("Please check your .env file");
        return Err(e);
    }

    info!("rpc endpoint: {}", config.rpc_url);
    info!(
        "contracts: positions {} | factory {} | lending pair {}",
        config.positions_address, config.factory_address, config.lending_pair_address
    );

    let mut source = RpcLogSource::new(&config);
    if let Some(checkpoint) = Checkpoint::load_last(&config.checkpoint_path)? {
        info!(
            "resuming from checkpoint: block {} ({})",
            checkpoint.next_block, config.checkpoint_path
        );
        source.resume_from(checkpoint.next_block);
    } else {
        info!("no checkpoint found, starting at block {}", config.start_block);
    }

    let store = MemoryStore::new();
    let multicall = Multicall::new(RpcCallExecutor::new(
        config.rpc_url.clone(),
        config.multicall()?,
    ));
    let tracker = PriceTracker::new(
        config.whitelist_tokens.clone(),
        config.stable_coins.clone(),
    );

    loop {
        let from = source.next_block();
        let batch = match source.next_batch().await {
            Ok(b) => b,
            Err(e) => {
                warn!("batch fetch failed, retrying: {e:#}");
                tokio::time::sleep(IDLE_POLL).await;
                continue;
            }
        };

        let Some(blocks) = batch else {
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        };

        let start = Instant::now();
        if let Err(e) =
            processor::run_batch(&store, &multicall, &config, &tracker, &blocks).await
        {
            // The batch never flushed; rewind and retry it whole.
            error!("batch starting at {from} failed, will retry: {e:#}");
            source.rewind_to(from);
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        }

        let next_block = source.next_block();
        Checkpoint {
            timestamp: chrono::Utc::now(),
            next_block,
            blocks_processed: next_block - from,
        }
        .append_to_file(&config.checkpoint_path)?;

        info!(
            "indexed blocks {}..{} in {:?}",
            from,
            next_block - 1,
            start.elapsed()
        );
    }
}
