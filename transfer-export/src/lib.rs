//! Resumable token-transfer export pipeline library.
//!
//! Continuously archives ERC-20 `Transfer` events touching one watched
//! wallet into a ClickHouse table, advancing a persisted block checkpoint
//! only after each batch has been durably flushed. The sink table's
//! merge-time deduplication makes redelivery after a retried batch
//! harmless, so the pipeline is exactly-once-effective under restarts.

pub mod checkpoint;
pub mod config;
pub mod dump;
pub mod fetcher;
pub mod pipeline;
pub mod retry;
pub mod sink;
pub mod source;
pub mod types;

#[cfg(test)]
mod testutil;
