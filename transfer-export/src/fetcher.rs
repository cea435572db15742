//! Event fetching: directional log queries, merge, dedup, enrichment.
//!
//! For one scheduled block range the fetcher produces the deduplicated,
//! enriched [`TransferEvent`] sequence for the watched wallet. The range
//! is transparently subdivided into windows no wider than the RPC's
//! per-call cap; within each window the two directional queries run
//! concurrently since they are independent reads.

use std::collections::HashSet;
use std::time::Duration;

use alloy::primitives::Address;

use crate::source::{ChainSource, SourceError};
use crate::types::{BlockRange, Direction, TransferEvent, TransferLog};

/// Fetches and enriches transfer events for one wallet.
#[derive(Debug)]
pub struct EventFetcher<'a, S> {
    source: &'a S,
    wallet: Address,
    rpc_window: u64,
    window_delay: Duration,
}

impl<'a, S: ChainSource> EventFetcher<'a, S> {
    /// Create a fetcher querying `source` for `wallet`.
    ///
    /// `rpc_window` is the endpoint's hard per-call block cap;
    /// `window_delay` paces consecutive windows.
    pub const fn new(source: &'a S, wallet: Address, rpc_window: u64, window_delay: Duration) -> Self {
        Self {
            source,
            wallet,
            rpc_window,
            window_delay,
        }
    }

    /// Produce all unique transfer events for `range`.
    ///
    /// A single record that cannot be enriched is logged and dropped so it
    /// cannot block checkpoint progress. A failed log query, by contrast,
    /// propagates: silently skipping a whole window would leave a gap the
    /// checkpoint then seals over.
    ///
    /// # Errors
    ///
    /// Returns an error if a log query fails after all retries.
    pub async fn fetch(&self, range: BlockRange) -> Result<Vec<TransferEvent>, SourceError> {
        let mut events = Vec::new();

        for (i, window) in windows(range, self.rpc_window).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.window_delay).await;
            }
            tracing::debug!(from = window.from, to = window.to, "querying window");

            let (outgoing, incoming) = tokio::join!(
                self.source.transfer_logs(self.wallet, Direction::Outgoing, window),
                self.source.transfer_logs(self.wallet, Direction::Incoming, window),
            );

            for log in merge_unique(outgoing?, incoming?) {
                match self.enrich(&log).await {
                    Ok(Some(event)) => events.push(event),
                    // Receipt missing after retries; already logged.
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            tx = %log.transaction_hash,
                            block = log.block_number,
                            error = %e,
                            "failed to enrich event, skipping"
                        );
                    }
                }
            }
        }

        Ok(events)
    }

    /// Attach block timestamp and receipt fields to one decoded log.
    ///
    /// Returns `Ok(None)` when the receipt stayed missing after retries.
    async fn enrich(&self, log: &TransferLog) -> Result<Option<TransferEvent>, SourceError> {
        let timestamp = self.source.block_timestamp(log.block_number).await?;

        let Some(receipt) = self.source.transaction_receipt(log.transaction_hash).await? else {
            tracing::warn!(
                tx = %log.transaction_hash,
                block = log.block_number,
                "receipt not found after retries, dropping event"
            );
            return Ok(None);
        };

        Ok(Some(TransferEvent {
            block_number: log.block_number,
            transaction_hash: log.transaction_hash,
            from: log.from,
            to: log.to,
            value: log.value,
            timestamp,
            receipt,
        }))
    }
}

/// Split `range` into inclusive windows of at most `step` blocks.
fn windows(range: BlockRange, step: u64) -> impl Iterator<Item = BlockRange> {
    let mut current = range.from;
    std::iter::from_fn(move || {
        if current > range.to {
            return None;
        }
        let end = range.to.min(current.saturating_add(step - 1));
        let window = BlockRange::new(current, end);
        current = end + 1;
        Some(window)
    })
}

/// Merge both directional result sets, keeping one log per transaction
/// hash. A self-transfer matches both filters and collapses to one entry;
/// the shared fields are identical, so the first occurrence wins.
fn merge_unique(outgoing: Vec<TransferLog>, incoming: Vec<TransferLog>) -> Vec<TransferLog> {
    let mut seen = HashSet::new();
    outgoing
        .into_iter()
        .chain(incoming)
        .filter(|log| seen.insert(log.transaction_hash))
        .collect()
}
