//! Orchestration: range scheduling, the iteration body, and the
//! supervisory re-arm loop.
//!
//! The loop's entire resumable state is one small checkpoint record
//! passed explicitly into every pass — never read back from the sink.
//! Each pass fetches one bounded range, streams it through the buffered
//! writer, and advances the checkpoint only after the final flush has
//! returned. A batch-level error is logged and the unchanged checkpoint
//! is re-armed, so the same range is retried on the next pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::checkpoint::Checkpoint;
use crate::config::Config;
use crate::fetcher::EventFetcher;
use crate::sink::{EventSink, SinkWriter};
use crate::source::ChainSource;
use crate::types::BlockRange;

/// Next bounded sub-range to process, or `None` when the chain tip has
/// not moved past the checkpoint.
///
/// The returned width is a checkpoint-advance granularity; the fetcher
/// further subdivides it to respect the RPC's own per-call cap.
#[must_use]
pub fn next_range(last_processed: u64, chain_tip: u64, max_batch_width: u64) -> Option<BlockRange> {
    if last_processed >= chain_tip {
        return None;
    }
    Some(BlockRange::new(
        last_processed,
        chain_tip.min(last_processed.saturating_add(max_batch_width)),
    ))
}

/// The resumable export pipeline for one watched wallet.
#[derive(Debug)]
pub struct Pipeline<S, K> {
    source: S,
    sink: K,
    config: Config,
}

impl<S: ChainSource, K: EventSink> Pipeline<S, K> {
    /// Assemble a pipeline from its collaborators.
    pub const fn new(source: S, sink: K, config: Config) -> Self {
        Self {
            source,
            sink,
            config,
        }
    }

    /// One-time startup: ensure the destination schema exists and resolve
    /// the starting checkpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if schema creation fails, or if there is neither a
    /// stored checkpoint nor a configured `initial_block` — resuming from
    /// an unknown position would either re-export history or leave a gap.
    pub async fn bootstrap(&self) -> Result<Checkpoint> {
        self.sink.ensure_schema().await.context("ensuring sink schema")?;

        if let Some(checkpoint) =
            Checkpoint::load(&self.config.data_dir, self.config.wallet_address)?
        {
            tracing::info!(
                wallet = %checkpoint.address,
                last_processed_block = checkpoint.last_processed_block,
                "resuming from stored checkpoint"
            );
            return Ok(checkpoint);
        }

        match self.config.initial_block {
            Some(block) => {
                tracing::info!(wallet = %self.config.wallet_address, block, "first run, starting from initial block");
                Ok(Checkpoint::new(self.config.wallet_address, block))
            }
            None => bail!("no stored checkpoint and no initial_block configured"),
        }
    }

    /// Run until `shutdown` is set, re-arming each pass with the carried
    /// checkpoint as its sole input state.
    ///
    /// The shutdown flag is only checked between iterations; an iteration
    /// in flight always completes.
    ///
    /// # Errors
    ///
    /// Never returns an error from a batch; the signature allows future
    /// fatal conditions to surface.
    pub async fn run(&self, mut checkpoint: Checkpoint, shutdown: &AtomicBool) -> Result<()> {
        while !shutdown.load(Ordering::SeqCst) {
            checkpoint = match self.iterate(checkpoint).await {
                Ok(next) => next,
                Err(e) => {
                    tracing::error!(
                        last_processed_block = checkpoint.last_processed_block,
                        error = %e,
                        "batch failed, will retry the same range"
                    );
                    tokio::time::sleep(self.idle_delay()).await;
                    checkpoint
                }
            };
        }
        tracing::info!(
            last_processed_block = checkpoint.last_processed_block,
            "shutdown requested, not re-arming"
        );
        Ok(())
    }

    /// One pass: schedule, fetch, flush, then advance the checkpoint.
    async fn iterate(&self, checkpoint: Checkpoint) -> Result<Checkpoint> {
        let tip = self.source.chain_tip().await.context("reading chain tip")?;

        let Some(range) = next_range(checkpoint.last_processed_block, tip, self.config.batch_size)
        else {
            tracing::info!(
                last_processed_block = checkpoint.last_processed_block,
                tip,
                "no new blocks, idling"
            );
            tokio::time::sleep(self.idle_delay()).await;
            return Ok(checkpoint);
        };

        tracing::info!(from = range.from, to = range.to, tip, "processing range");

        let fetcher = EventFetcher::new(
            &self.source,
            self.config.wallet_address,
            self.config.rpc.max_blocks_per_query,
            Duration::from_millis(self.config.rpc.window_delay_ms),
        );
        let events = fetcher.fetch(range).await?;
        let count = events.len();

        let mut writer = SinkWriter::new(&self.sink, self.config.clickhouse.flush_max_rows);
        for event in events {
            writer.append(event).await?;
        }
        writer.flush_remaining().await?;

        // The flush calls above have returned; only now may the
        // checkpoint move.
        let advanced = checkpoint.advanced(range.to);
        advanced.save(&self.config.data_dir)?;
        tracing::info!(
            events = count,
            last_processed_block = advanced.last_processed_block,
            "checkpoint advanced"
        );
        Ok(advanced)
    }

    fn idle_delay(&self) -> Duration {
        Duration::from_secs(self.config.pacing.idle_delay_secs)
    }
}
