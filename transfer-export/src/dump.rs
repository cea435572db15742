//! One-shot export of a block range to a JSON file.
//!
//! Spot-check companion to the streaming pipeline: fetches one bounded
//! range through the regular fetcher and writes the enriched events,
//! preceded by a small metadata header, as pretty-printed JSON. Touches
//! neither the checkpoint nor the sink.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use alloy::primitives::Address;
use anyhow::{Context, Result};
use serde::Serialize;

use crate::config::Config;
use crate::fetcher::EventFetcher;
use crate::source::ChainSource;
use crate::types::{BlockRange, TransferEvent};

/// Blocks scanned when no explicit start block is given.
const DEFAULT_LOOKBACK: u64 = 2_000;

/// Header describing one dump.
#[derive(Debug, Serialize)]
struct Metadata {
    total_events: usize,
    wallet_address: Address,
    contract_address: Address,
    from_block: u64,
    to_block: u64,
    /// Unix timestamp (seconds) of the export.
    exported_at: u64,
}

/// On-disk document layout.
#[derive(Debug, Serialize)]
struct Document {
    metadata: Metadata,
    events: Vec<TransferEvent>,
}

/// Resolve the requested bounds against the chain tip.
///
/// Bounds past the tip are clamped to it; a missing start defaults to
/// [`DEFAULT_LOOKBACK`] blocks behind the resolved end, saturating at
/// genesis.
#[must_use]
pub fn resolve_range(tip: u64, from: Option<u64>, to: Option<u64>) -> BlockRange {
    let to = to.unwrap_or(tip).min(tip);
    let from = from.unwrap_or_else(|| to.saturating_sub(DEFAULT_LOOKBACK)).min(to);
    BlockRange::new(from, to)
}

/// Fetch `range` once and write the events to `path`.
///
/// Returns the number of exported events.
///
/// # Errors
///
/// Returns an error if a log query fails after all retries, or if the
/// document cannot be serialized or written.
pub async fn write_events<S: ChainSource>(
    source: &S,
    config: &Config,
    range: BlockRange,
    path: &Path,
) -> Result<usize> {
    let fetcher = EventFetcher::new(
        source,
        config.wallet_address,
        config.rpc.max_blocks_per_query,
        Duration::from_millis(config.rpc.window_delay_ms),
    );
    let events = fetcher.fetch(range).await.context("fetching events for dump")?;

    let document = Document {
        metadata: Metadata {
            total_events: events.len(),
            wallet_address: config.wallet_address,
            contract_address: config.contract_address,
            from_block: range.from,
            to_block: range.to,
            exported_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        },
        events,
    };

    let json = serde_json::to_vec_pretty(&document).context("serializing dump")?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;

    let count = document.metadata.total_events;
    tracing::info!(events = count, path = %path.display(), "wrote JSON dump");
    Ok(count)
}
