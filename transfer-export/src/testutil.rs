//! Hand-rolled test doubles for the chain source and the sink.

use std::collections::HashSet;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloy::primitives::{Address, B256, Bloom, U256};
use anyhow::{Result, bail};

use crate::sink::EventSink;
use crate::source::{ChainSource, SourceError};
use crate::types::{BlockRange, Direction, ReceiptFields, TransferEvent, TransferLog};

/// In-memory chain with canned logs and per-transaction receipt behavior.
#[derive(Debug, Default)]
pub(crate) struct MockSource {
    tip: u64,
    outgoing: Vec<TransferLog>,
    incoming: Vec<TransferLog>,
    missing_receipts: HashSet<B256>,
    failing_receipts: HashSet<B256>,
    fail_logs: bool,
    /// Number of `transfer_logs` calls issued.
    pub(crate) log_queries: AtomicU32,
}

impl MockSource {
    /// Watched wallet used by all fixtures.
    pub(crate) const WALLET: Address = Address::repeat_byte(0x11);

    pub(crate) fn new(tip: u64) -> Self {
        Self {
            tip,
            ..Self::default()
        }
    }

    pub(crate) fn with_outgoing(mut self, logs: Vec<TransferLog>) -> Self {
        self.outgoing = logs;
        self
    }

    pub(crate) fn with_incoming(mut self, logs: Vec<TransferLog>) -> Self {
        self.incoming = logs;
        self
    }

    pub(crate) fn with_missing_receipt(mut self, hash: B256) -> Self {
        self.missing_receipts.insert(hash);
        self
    }

    pub(crate) fn with_failing_receipt(mut self, hash: B256) -> Self {
        self.failing_receipts.insert(hash);
        self
    }

    pub(crate) fn with_failing_logs(mut self) -> Self {
        self.fail_logs = true;
        self
    }

    /// Deterministic block timestamp used by the mock.
    pub(crate) const fn timestamp_of(block: u64) -> u64 {
        block * 10
    }
}

impl ChainSource for MockSource {
    async fn chain_tip(&self) -> Result<u64, SourceError> {
        Ok(self.tip)
    }

    async fn transfer_logs(
        &self,
        _wallet: Address,
        direction: Direction,
        range: BlockRange,
    ) -> Result<Vec<TransferLog>, SourceError> {
        self.log_queries.fetch_add(1, Ordering::SeqCst);
        if self.fail_logs {
            return Err(SourceError::Transport("mock log query failure".into()));
        }
        let logs = match direction {
            Direction::Outgoing => &self.outgoing,
            Direction::Incoming => &self.incoming,
        };
        Ok(logs
            .iter()
            .filter(|log| log.block_number >= range.from && log.block_number <= range.to)
            .cloned()
            .collect())
    }

    async fn block_timestamp(&self, number: u64) -> Result<u64, SourceError> {
        Ok(Self::timestamp_of(number))
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<ReceiptFields>, SourceError> {
        if self.failing_receipts.contains(&hash) {
            return Err(SourceError::Transport("mock receipt failure".into()));
        }
        if self.missing_receipts.contains(&hash) {
            return Ok(None);
        }
        Ok(Some(receipt_fields(hash)))
    }
}

/// Sink recording insert sizes and deduplicating rows on the same key the
/// real table's merge would, `(transaction_hash, block_number)`.
#[derive(Debug, Default)]
pub(crate) struct MockSink {
    inserts: Mutex<Vec<usize>>,
    rows: Mutex<HashSet<(B256, u64)>>,
    fail_next: AtomicBool,
}

impl MockSink {
    /// Make the next insert fail without recording anything.
    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Row counts of the insert calls seen so far, in order.
    pub(crate) fn insert_sizes(&self) -> Vec<usize> {
        self.inserts.lock().expect("inserts lock").clone()
    }

    /// Logical row count after merge-time deduplication.
    pub(crate) fn unique_rows(&self) -> usize {
        self.rows.lock().expect("rows lock").len()
    }
}

impl EventSink for MockSink {
    async fn ensure_schema(&self) -> Result<()> {
        Ok(())
    }

    async fn insert(&self, events: &[TransferEvent]) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("mock sink insert failure");
        }
        self.inserts.lock().expect("inserts lock").push(events.len());
        let mut rows = self.rows.lock().expect("rows lock");
        for event in events {
            rows.insert((event.transaction_hash, event.block_number));
        }
        Ok(())
    }
}

/// A decoded log at `block` with a hash derived from `seed`.
pub(crate) fn transfer_log(block: u64, seed: u8) -> TransferLog {
    TransferLog {
        block_number: block,
        transaction_hash: B256::repeat_byte(seed),
        from: MockSource::WALLET,
        to: Address::repeat_byte(0x22),
        value: U256::from(1_000_u64),
    }
}

/// A fully enriched event at `block` with a hash derived from `seed`.
pub(crate) fn transfer_event(block: u64, seed: u8) -> TransferEvent {
    let log = transfer_log(block, seed);
    TransferEvent {
        block_number: log.block_number,
        transaction_hash: log.transaction_hash,
        from: log.from,
        to: log.to,
        value: log.value,
        timestamp: MockSource::timestamp_of(block),
        receipt: receipt_fields(log.transaction_hash),
    }
}

fn receipt_fields(hash: B256) -> ReceiptFields {
    ReceiptFields {
        block_hash: B256::repeat_byte(0x33),
        block_number: 0,
        contract_address: None,
        cumulative_gas_used: 21_000,
        effective_gas_price: 1_000_000_000,
        from: MockSource::WALLET,
        gas_used: 21_000,
        status: true,
        to: Some(Address::repeat_byte(0x22)),
        transaction_index: 0,
        logs_bloom: Bloom::ZERO,
        logs_json: format!(r#"[{{"transactionHash":"{hash:#x}"}}]"#),
    }
}
