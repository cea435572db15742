//! Domain types shared between the RPC source, the fetcher and the sink.

use alloy::primitives::{Address, B256, Bloom, U256};
use serde::Serialize;

/// Inclusive block interval processed as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    /// First block of the interval.
    pub from: u64,
    /// Last block of the interval (inclusive).
    pub to: u64,
}

impl BlockRange {
    /// Create a range, clamping `to` so that `from <= to` always holds.
    #[must_use]
    pub const fn new(from: u64, to: u64) -> Self {
        Self {
            from,
            to: if to < from { from } else { to },
        }
    }

    /// Number of blocks covered by the range.
    #[must_use]
    pub const fn width(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Which indexed argument of the `Transfer` event a log query filters on.
///
/// The watched wallet can appear as sender or receiver in distinct log
/// entries, so each window is queried once per direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Filter `topic1` (the `from` argument).
    Outgoing,
    /// Filter `topic2` (the `to` argument).
    Incoming,
}

/// A decoded `Transfer` log before enrichment.
///
/// Ephemeral: lives only within one fetch, deduplicated by
/// [`transaction_hash`](Self::transaction_hash).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    /// Block the log was emitted in.
    pub block_number: u64,
    /// Hash of the transaction that emitted the log.
    pub transaction_hash: B256,
    /// Token sender.
    pub from: Address,
    /// Token receiver.
    pub to: Address,
    /// Transferred amount in the token's base units.
    pub value: U256,
}

/// Receipt-derived fields carried on every exported event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReceiptFields {
    /// Hash of the block containing the transaction.
    pub block_hash: B256,
    /// Block number from the receipt.
    pub block_number: u64,
    /// Deployed contract address, if the transaction was a deployment.
    pub contract_address: Option<Address>,
    /// Gas used by the block up to and including this transaction.
    pub cumulative_gas_used: u64,
    /// Effective gas price paid.
    pub effective_gas_price: u128,
    /// Transaction sender.
    pub from: Address,
    /// Gas used by this transaction alone.
    pub gas_used: u64,
    /// Execution status (`true` = success).
    pub status: bool,
    /// Transaction recipient, `None` for deployments.
    pub to: Option<Address>,
    /// Position of the transaction within its block.
    pub transaction_index: u64,
    /// Bloom filter over the receipt's logs.
    pub logs_bloom: Bloom,
    /// Receipt logs serialized as a JSON array.
    pub logs_json: String,
}

/// Canonical exported record, unique per `(transaction_hash, block_number)`.
///
/// Immutable once constructed; the sink's merge-time deduplication on the
/// same key makes repeated delivery harmless.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferEvent {
    /// Block the transfer was mined in.
    pub block_number: u64,
    /// Hash of the transaction carrying the transfer.
    pub transaction_hash: B256,
    /// Token sender.
    pub from: Address,
    /// Token receiver.
    pub to: Address,
    /// Transferred amount in the token's base units.
    pub value: U256,
    /// Unix timestamp (seconds) of the containing block.
    pub timestamp: u64,
    /// Fields copied from the transaction receipt.
    pub receipt: ReceiptFields,
}
