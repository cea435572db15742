//! Retry-wrapped gateway over the blockchain read API.
//!
//! [`ChainSource`] is the seam the fetcher and the orchestration loop
//! depend on; [`EthereumSource`] implements it over an alloy provider,
//! wrapping every call in the shared backoff policy. All calls are
//! idempotent reads.

use std::time::Duration;

use alloy::consensus::TxReceipt;
use alloy::primitives::{Address, B256};
use alloy::providers::Provider;
use alloy::rpc::types::{Filter, Log, TransactionReceipt};
use alloy::sol;
use alloy::sol_types::SolEvent;
use thiserror::Error;

use crate::retry::{RetryPolicy, with_retry};
use crate::types::{BlockRange, Direction, ReceiptFields, TransferLog};

sol! {
    /// ERC-20 `Transfer` event.
    #[derive(Debug)]
    event Transfer(address indexed from, address indexed to, uint256 value);
}

/// Errors surfaced by the RPC source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Network-level failure reported by the transport.
    #[error("transport error: {0}")]
    Transport(String),
    /// The request exceeded the configured timeout.
    #[error("request timed out")]
    Timeout,
    /// The receipt for a transaction is not (yet) known to the node.
    #[error("receipt not found for transaction {0:#x}")]
    ReceiptNotFound(B256),
    /// The block is not (yet) known to the node.
    #[error("block {0} not found")]
    BlockNotFound(u64),
    /// The response could not be converted into domain types.
    #[error("decoding response: {0}")]
    Decode(String),
}

impl SourceError {
    /// Whether the retry wrapper should attempt the call again.
    ///
    /// Missing receipts and blocks count as transient: the node may simply
    /// not have indexed them yet.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout | Self::ReceiptNotFound(_) | Self::BlockNotFound(_) => {
                true
            }
            Self::Decode(_) => false,
        }
    }
}

/// Read-only view of the chain consumed by the pipeline.
pub trait ChainSource {
    /// Current chain-tip block number.
    fn chain_tip(&self) -> impl Future<Output = Result<u64, SourceError>>;

    /// Decoded `Transfer` logs for `wallet` in `range`, filtered on one
    /// indexed argument. `range` must respect the RPC per-call cap.
    fn transfer_logs(
        &self,
        wallet: Address,
        direction: Direction,
        range: BlockRange,
    ) -> impl Future<Output = Result<Vec<TransferLog>, SourceError>>;

    /// Unix timestamp of a block.
    fn block_timestamp(&self, number: u64) -> impl Future<Output = Result<u64, SourceError>>;

    /// Receipt for a transaction, or `None` when the node still reports it
    /// missing after all retries.
    fn transaction_receipt(
        &self,
        hash: B256,
    ) -> impl Future<Output = Result<Option<ReceiptFields>, SourceError>>;
}

/// [`ChainSource`] backed by an alloy HTTP provider.
#[derive(Debug)]
pub struct EthereumSource<P> {
    provider: P,
    contract: Address,
    policy: RetryPolicy,
    request_timeout: Duration,
    call_delay: Duration,
}

impl<P: Provider> EthereumSource<P> {
    /// Create a gateway for `contract` over `provider`.
    pub const fn new(
        provider: P,
        contract: Address,
        policy: RetryPolicy,
        request_timeout: Duration,
        call_delay: Duration,
    ) -> Self {
        Self {
            provider,
            contract,
            policy,
            request_timeout,
            call_delay,
        }
    }

    /// Apply the per-request timeout and map transport errors.
    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, alloy::transports::TransportError>>,
    ) -> Result<T, SourceError> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result.map_err(|e| SourceError::Transport(e.to_string())),
            Err(_) => Err(SourceError::Timeout),
        }
    }
}

impl<P: Provider> ChainSource for EthereumSource<P> {
    async fn chain_tip(&self) -> Result<u64, SourceError> {
        with_retry(&self.policy, "get_block_number", SourceError::is_retryable, || {
            self.call(async { self.provider.get_block_number().await })
        })
        .await
    }

    async fn transfer_logs(
        &self,
        wallet: Address,
        direction: Direction,
        range: BlockRange,
    ) -> Result<Vec<TransferLog>, SourceError> {
        // Fixed pacing delay before each log query to stay under the
        // endpoint's rate limit.
        tokio::time::sleep(self.call_delay).await;

        let filter = Filter::new()
            .address(self.contract)
            .event_signature(Transfer::SIGNATURE_HASH)
            .from_block(range.from)
            .to_block(range.to);
        let filter = match direction {
            Direction::Outgoing => filter.topic1(wallet.into_word()),
            Direction::Incoming => filter.topic2(wallet.into_word()),
        };

        let logs = with_retry(&self.policy, "get_logs", SourceError::is_retryable, || {
            self.call(async { self.provider.get_logs(&filter).await })
        })
        .await?;

        Ok(logs.iter().filter_map(decode_transfer).collect())
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64, SourceError> {
        let block = with_retry(
            &self.policy,
            "get_block_by_number",
            SourceError::is_retryable,
            || async {
                self.call(async { self.provider.get_block_by_number(number.into()).await })
                    .await?
                    .ok_or(SourceError::BlockNotFound(number))
            },
        )
        .await?;
        Ok(block.header.timestamp)
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptFields>, SourceError> {
        let result = with_retry(
            &self.policy,
            "get_transaction_receipt",
            SourceError::is_retryable,
            || async {
                self.call(async { self.provider.get_transaction_receipt(hash).await })
                    .await?
                    .ok_or(SourceError::ReceiptNotFound(hash))
            },
        )
        .await;

        match result {
            Ok(receipt) => Ok(Some(receipt_fields(&receipt)?)),
            // Not escalated: the log may reference a pruned or
            // not-yet-indexed transaction; the caller drops the record.
            Err(SourceError::ReceiptNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Decode one raw log into a [`TransferLog`].
///
/// Logs with missing block metadata or an undecodable payload are skipped
/// with a warning; a single malformed log must not fail the query.
fn decode_transfer(log: &Log) -> Option<TransferLog> {
    let (Some(block_number), Some(transaction_hash)) = (log.block_number, log.transaction_hash)
    else {
        tracing::warn!(?log, "log without block metadata, skipping");
        return None;
    };

    match log.log_decode::<Transfer>() {
        Ok(decoded) => {
            let event = decoded.inner.data;
            Some(TransferLog {
                block_number,
                transaction_hash,
                from: event.from,
                to: event.to,
                value: event.value,
            })
        }
        Err(e) => {
            tracing::warn!(tx = %transaction_hash, error = %e, "undecodable Transfer log, skipping");
            None
        }
    }
}

/// Copy the receipt fields the export schema carries.
fn receipt_fields(receipt: &TransactionReceipt) -> Result<ReceiptFields, SourceError> {
    let logs_json =
        serde_json::to_string(receipt.inner.logs()).map_err(|e| SourceError::Decode(e.to_string()))?;

    Ok(ReceiptFields {
        block_hash: receipt.block_hash.unwrap_or_default(),
        block_number: receipt.block_number.unwrap_or_default(),
        contract_address: receipt.contract_address,
        cumulative_gas_used: receipt.inner.cumulative_gas_used(),
        effective_gas_price: receipt.effective_gas_price,
        from: receipt.from,
        gas_used: receipt.gas_used,
        status: receipt.status(),
        to: receipt.to,
        transaction_index: receipt.transaction_index.unwrap_or_default(),
        logs_bloom: receipt.inner.bloom(),
        logs_json,
    })
}

#[cfg(test)]
mod tests {
    use alloy::primitives::B256;

    use super::SourceError;

    #[test]
    fn retry_classification() {
        assert!(SourceError::Transport("reset".into()).is_retryable(), "transport is transient");
        assert!(SourceError::Timeout.is_retryable(), "timeout is transient");
        assert!(
            SourceError::ReceiptNotFound(B256::ZERO).is_retryable(),
            "missing receipt is retried before being downgraded"
        );
        assert!(SourceError::BlockNotFound(1).is_retryable(), "missing block is transient");
        assert!(!SourceError::Decode("bad".into()).is_retryable(), "decode errors are final");
    }
}
