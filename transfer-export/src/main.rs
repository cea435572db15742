//! Transfer export CLI.
//!
//! Archives ERC-20 `Transfer` events touching one watched wallet into
//! ClickHouse, resuming from the persisted checkpoint across restarts.
//!
//! # Usage
//!
//! ```bash
//! # Create the destination database and table
//! transfer-export init-schema --config config.toml
//!
//! # Run the export loop until interrupted
//! transfer-export run --config config.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use alloy::providers::{Provider, ProviderBuilder};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use transfer_export::config::Config;
use transfer_export::dump;
use transfer_export::pipeline::Pipeline;
use transfer_export::sink::{ClickHouseSink, EventSink};
use transfer_export::source::{ChainSource, EthereumSource};

/// Resumable token-transfer exporter.
#[derive(Debug, Parser)]
#[command(name = "transfer-export", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the export loop until interrupted.
    Run {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Create the destination database and table, then exit.
    InitSchema {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,
    },

    /// Fetch one block range and write the events to a JSON file, then
    /// exit. Touches neither the checkpoint nor ClickHouse.
    DumpJson {
        /// Path to the TOML configuration file.
        #[arg(long, default_value = "config.toml")]
        config: PathBuf,

        /// First block to scan; defaults to 2000 blocks behind the end.
        #[arg(long)]
        from_block: Option<u64>,

        /// Last block to scan; defaults to the chain tip.
        #[arg(long)]
        to_block: Option<u64>,

        /// Output file.
        #[arg(long, default_value = "transfer-events.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured logging.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { config } => cmd_run(&config).await,
        Command::InitSchema { config } => cmd_init_schema(&config).await,
        Command::DumpJson {
            config,
            from_block,
            to_block,
            output,
        } => cmd_dump_json(&config, from_block, to_block, &output).await,
    }
}

/// Build the retry-wrapped RPC gateway from configuration.
fn build_source(config: &Config) -> Result<EthereumSource<impl Provider + use<>>> {
    let provider = ProviderBuilder::new().connect_http(
        config
            .rpc
            .url
            .parse()
            .with_context(|| format!("invalid RPC URL: {}", config.rpc.url))?,
    );
    Ok(EthereumSource::new(
        provider,
        config.contract_address,
        config.retry,
        Duration::from_secs(config.rpc.request_timeout_secs),
        Duration::from_millis(config.rpc.call_delay_ms),
    ))
}

/// Execute the `run` subcommand.
async fn cmd_run(path: &Path) -> Result<()> {
    let config = Config::load(path)?;

    let source = build_source(&config)?;
    let sink = ClickHouseSink::connect(&config.clickhouse);

    tracing::info!(
        wallet = %config.wallet_address,
        contract = %config.contract_address,
        rpc = %config.rpc.url,
        table = %config.clickhouse.table,
        "starting export"
    );

    // Graceful shutdown: finish the current iteration, do not re-arm.
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested, finishing current iteration");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    let pipeline = Pipeline::new(source, sink, config);
    let checkpoint = pipeline.bootstrap().await?;
    pipeline.run(checkpoint, &shutdown).await
}

/// Execute the `init-schema` subcommand.
async fn cmd_init_schema(path: &Path) -> Result<()> {
    let config = Config::load(path)?;
    let sink = ClickHouseSink::connect(&config.clickhouse);
    sink.ensure_schema().await?;
    tracing::info!(
        database = %config.clickhouse.database,
        table = %config.clickhouse.table,
        "schema initialized"
    );
    Ok(())
}

/// Execute the `dump-json` subcommand.
async fn cmd_dump_json(
    path: &Path,
    from_block: Option<u64>,
    to_block: Option<u64>,
    output: &Path,
) -> Result<()> {
    let config = Config::load(path)?;
    let source = build_source(&config)?;

    let tip = source.chain_tip().await?;
    let range = dump::resolve_range(tip, from_block, to_block);
    tracing::info!(
        wallet = %config.wallet_address,
        from = range.from,
        to = range.to,
        tip,
        "dumping range"
    );

    let count = dump::write_events(&source, &config, range, output).await?;
    tracing::info!(events = count, output = %output.display(), "dump complete");
    Ok(())
}
