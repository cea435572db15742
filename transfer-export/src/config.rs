//! Runtime configuration loaded from `config.toml`.
//!
//! The wallet, token contract, RPC endpoint and ClickHouse connection are
//! mandatory; everything else has defaults tuned for public RPC rate
//! limits.

use std::path::{Path, PathBuf};

use alloy::primitives::Address;
use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::retry::RetryPolicy;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Wallet whose transfers are exported.
    pub wallet_address: Address,
    /// ERC-20 contract emitting the `Transfer` events.
    pub contract_address: Address,
    /// Block to start from when no checkpoint exists yet.
    pub initial_block: Option<u64>,
    /// Blocks per iteration; the checkpoint advances in steps of this size.
    #[serde(default = "default_batch_size")]
    pub batch_size: u64,
    /// Directory holding the checkpoint file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// RPC transport settings.
    pub rpc: RpcConfig,
    /// Backoff policy shared by all RPC calls.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// ClickHouse connection and batching settings.
    pub clickhouse: ClickHouseConfig,
    /// Steady-state loop pacing.
    #[serde(default, rename = "loop")]
    pub pacing: LoopConfig,
}

/// RPC endpoint and pacing settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    /// HTTP endpoint URL.
    pub url: String,
    /// Hard per-call block-range cap of the endpoint.
    #[serde(default = "default_max_blocks_per_query")]
    pub max_blocks_per_query: u64,
    /// Fixed delay before each log query, to stay under rate limits.
    #[serde(default = "default_call_delay_ms")]
    pub call_delay_ms: u64,
    /// Delay between consecutive sub-windows of one batch.
    #[serde(default = "default_window_delay_ms")]
    pub window_delay_ms: u64,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// ClickHouse sink settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClickHouseConfig {
    /// HTTP interface URL, e.g. `http://localhost:8123`.
    pub url: String,
    /// Target database.
    #[serde(default = "default_database")]
    pub database: String,
    /// Target table.
    #[serde(default = "default_table")]
    pub table: String,
    /// Optional user name.
    #[serde(default)]
    pub user: Option<String>,
    /// Optional password.
    #[serde(default)]
    pub password: Option<String>,
    /// Buffered rows per insert; keeps payloads well under transport limits.
    #[serde(default = "default_flush_max_rows")]
    pub flush_max_rows: usize,
}

/// Steady-state loop pacing.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    /// Sleep when the chain tip has not moved past the checkpoint.
    pub idle_delay_secs: u64,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self { idle_delay_secs: 10 }
    }
}

const fn default_batch_size() -> u64 {
    5_000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

const fn default_max_blocks_per_query() -> u64 {
    1_000
}

const fn default_call_delay_ms() -> u64 {
    500
}

const fn default_window_delay_ms() -> u64 {
    2_000
}

const fn default_request_timeout_secs() -> u64 {
    30
}

fn default_database() -> String {
    "transfers".to_owned()
}

fn default_table() -> String {
    "wallet_transfers".to_owned()
}

const fn default_flush_max_rows() -> usize {
    1_000
}

impl Config {
    /// Load and validate configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if a
    /// setting fails validation.
    pub fn load(path: &Path) -> Result<Self> {
        let text =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self =
            toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            bail!("batch_size must be positive");
        }
        if self.rpc.max_blocks_per_query == 0 {
            bail!("rpc.max_blocks_per_query must be positive");
        }
        if self.clickhouse.flush_max_rows == 0 {
            bail!("clickhouse.flush_max_rows must be positive");
        }
        Ok(())
    }
}
