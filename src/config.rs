//! Indexer configuration.
//!
//! Everything is overridable from the environment (with a `.env` file picked
//! up via dotenvy) and round-trips through TOML for deployments that prefer a
//! config file.

use alloy_primitives::Address;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

/// Canonical Multicall3 deployment, same address on all EVM chains.
pub const DEFAULT_MULTICALL_ADDRESS: &str = "0xcA11bde05977b3631167028862bE2a173976CA11";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // ========== Network ==========
    /// RPC endpoint used for eth_getLogs and multicall reads.
    pub rpc_url: String,

    // ========== Contract addresses ==========
    pub multicall_address: String,
    /// NonfungiblePositionManager.
    pub positions_address: String,
    /// Pool factory, used to resolve a position's pool.
    pub factory_address: String,
    pub lending_pair_address: String,

    // ========== Ingestion ==========
    /// First block to index.
    pub start_block: u64,
    /// Blocks pulled per batch.
    pub batch_blocks: u64,
    /// Blocks to stay behind the chain head.
    pub finality_confirmation: u64,
    /// Path for the resume checkpoint, JSON lines.
    pub checkpoint_path: String,

    // ========== Multicall ==========
    /// Calls per aggregate3 page.
    pub multicall_page_size: usize,

    // ========== Pricing ==========
    pub whitelist_tokens: Vec<String>,
    pub stable_coins: Vec<String>,

    // ========== Fee accounting ==========
    /// Drop a position's fee observation when its on-chain checkpoint is
    /// ahead of the freshly computed inside value instead of recording a
    /// wrapped delta.
    pub skip_inconsistent_fee_growth: bool,
}

impl Config {
    /// Load configuration from environment variables and a `.env` file.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            rpc_url: env::var("RPC_URL").unwrap_or_else(|_| "http://localhost:8545".to_string()),

            multicall_address: env::var("MULTICALL_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_MULTICALL_ADDRESS.to_string()),
            positions_address: env::var("POSITIONS_ADDRESS").unwrap_or_default(),
            factory_address: env::var("FACTORY_ADDRESS").unwrap_or_default(),
            lending_pair_address: env::var("LENDING_PAIR_ADDRESS").unwrap_or_default(),

            start_block: env::var("START_BLOCK")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
            batch_blocks: env::var("BATCH_BLOCKS")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            finality_confirmation: env::var("FINALITY_CONFIRMATION")
                .unwrap_or_else(|_| "75".to_string())
                .parse()
                .unwrap_or(75),
            checkpoint_path: env::var("CHECKPOINT_PATH")
                .unwrap_or_else(|_| "./data/checkpoint.log".to_string()),

            multicall_page_size: env::var("MULTICALL_PAGE_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),

            whitelist_tokens: env::var("WHITELIST_TOKENS")
                .map(|s| s.split(',').map(String::from).collect())
                .unwrap_or_default(),
            stable_coins: env::var("STABLE_COINS")
                .map(|s| s.split(',').map(String::from).collect())
                .unwrap_or_default(),

            skip_inconsistent_fee_growth: env::var("SKIP_INCONSISTENT_FEE_GROWTH")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
        })
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn multicall(&self) -> Result<Address> {
        parse_address("MULTICALL_ADDRESS", &self.multicall_address)
    }

    pub fn positions(&self) -> Result<Address> {
        parse_address("POSITIONS_ADDRESS", &self.positions_address)
    }

    pub fn factory(&self) -> Result<Address> {
        parse_address("FACTORY_ADDRESS", &self.factory_address)
    }

    pub fn lending_pair(&self) -> Result<Address> {
        parse_address("LENDING_PAIR_ADDRESS", &self.lending_pair_address)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() || self.rpc_url.contains("YOUR_API_KEY") {
            return Err(eyre::eyre!("Invalid RPC_URL - set a real endpoint"));
        }
        self.multicall()?;
        self.positions()?;
        self.factory()?;
        self.lending_pair()?;

        if self.batch_blocks == 0 {
            return Err(eyre::eyre!("BATCH_BLOCKS must be at least 1"));
        }
        if self.multicall_page_size == 0 {
            return Err(eyre::eyre!("MULTICALL_PAGE_SIZE must be at least 1"));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            multicall_address: DEFAULT_MULTICALL_ADDRESS.to_string(),
            positions_address: String::new(),
            factory_address: String::new(),
            lending_pair_address: String::new(),
            start_block: 0,
            batch_blocks: 1000,
            finality_confirmation: 75,
            checkpoint_path: "./data/checkpoint.log".to_string(),
            multicall_page_size: 100,
            whitelist_tokens: vec![],
            stable_coins: vec![],
            skip_inconsistent_fee_growth: true,
        }
    }
}

fn parse_address(name: &str, value: &str) -> Result<Address> {
    Address::from_str(value).map_err(|_| eyre::eyre!("{name} is not a valid address: {value:?}"))
}

// ============================================
// CHECKPOINT LOG
// ============================================

use chrono::{DateTime, Utc};
use std::io::Write;

/// One line per flushed batch; the last line is the resume point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub timestamp: DateTime<Utc>,
    /// First block of the next batch to process.
    pub next_block: u64,
    pub blocks_processed: u64,
}

impl Checkpoint {
    /// Append this checkpoint to a JSON-lines file.
    pub fn append_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;

        let json = serde_json::to_string(self)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }

    /// Last checkpoint in the file, if any.
    pub fn load_last<P: AsRef<Path>>(path: P) -> Result<Option<Self>> {
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let last = content
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .map(serde_json::from_str)
            .transpose()?;
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_carries_canonical_multicall() {
        let config = Config::default();
        assert_eq!(config.multicall_address, DEFAULT_MULTICALL_ADDRESS);
        assert!(config.multicall().is_ok());
        assert_eq!(config.multicall_page_size, 100);
    }

    #[test]
    fn validate_rejects_missing_contract_addresses() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.positions_address = "0x1111111111111111111111111111111111111111".to_string();
        config.factory_address = "0x2222222222222222222222222222222222222222".to_string();
        config.lending_pair_address = "0x3333333333333333333333333333333333333333".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn checkpoint_roundtrip_through_file() {
        let dir = std::env::temp_dir().join("indexer-checkpoint-test");
        let path = dir.join("checkpoint.log");
        let _ = fs::remove_file(&path);

        assert!(Checkpoint::load_last(&path).unwrap().is_none());

        for next_block in [100u64, 200] {
            Checkpoint {
                timestamp: Utc::now(),
                next_block,
                blocks_processed: 100,
            }
            .append_to_file(&path)
            .unwrap();
        }

        let last = Checkpoint::load_last(&path).unwrap().unwrap();
        assert_eq!(last.next_block, 200);
        let _ = fs::remove_file(&path);
    }
}
