//! ClickHouse sink and the size-bounded buffered writer.
//!
//! The destination table is a `ReplacingMergeTree` ordered by
//! `(transaction_hash, block_number)`: background merges collapse
//! duplicate rows, which is what makes redelivery of a retried batch
//! harmless. The writer never retries a flush itself; write idempotency
//! is entirely the engine's dedup-on-merge.

use std::fmt;

use anyhow::{Context, Result};
use clickhouse::{Client, Row};
use serde::Serialize;
use time::OffsetDateTime;

use crate::config::ClickHouseConfig;
use crate::types::TransferEvent;

/// Destination store for enriched transfer events.
pub trait EventSink {
    /// Create the destination database and table if missing.
    fn ensure_schema(&self) -> impl Future<Output = Result<()>>;

    /// Bulk-insert one batch of events.
    fn insert(&self, events: &[TransferEvent]) -> impl Future<Output = Result<()>>;
}

/// Row layout of the export table; field names match the DDL columns.
#[derive(Debug, Row, Serialize)]
struct TransferRow {
    block_number: u64,
    transaction_hash: String,
    from_address: String,
    to_address: String,
    value: String,
    #[serde(with = "clickhouse::serde::time::datetime")]
    timestamp: OffsetDateTime,
    receipt_block_hash: String,
    receipt_block_number: u64,
    receipt_contract_address: Option<String>,
    receipt_cumulative_gas_used: u64,
    receipt_effective_gas_price: String,
    receipt_from: String,
    receipt_gas_used: u64,
    receipt_logs_bloom: String,
    receipt_status: u8,
    receipt_to: Option<String>,
    receipt_transaction_index: u32,
    receipt_logs: String,
}

impl From<&TransferEvent> for TransferRow {
    fn from(event: &TransferEvent) -> Self {
        let receipt = &event.receipt;
        #[allow(
            clippy::cast_possible_truncation,
            reason = "transaction indices fit u32; a block holds nowhere near 2^32 transactions"
        )]
        let transaction_index = receipt.transaction_index as u32;
        Self {
            block_number: event.block_number,
            transaction_hash: format!("{:#x}", event.transaction_hash),
            from_address: format!("{:#x}", event.from),
            to_address: format!("{:#x}", event.to),
            value: event.value.to_string(),
            timestamp: i64::try_from(event.timestamp)
                .ok()
                .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
                .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            receipt_block_hash: format!("{:#x}", receipt.block_hash),
            receipt_block_number: receipt.block_number,
            receipt_contract_address: receipt.contract_address.map(|a| format!("{a:#x}")),
            receipt_cumulative_gas_used: receipt.cumulative_gas_used,
            receipt_effective_gas_price: receipt.effective_gas_price.to_string(),
            receipt_from: format!("{:#x}", receipt.from),
            receipt_gas_used: receipt.gas_used,
            receipt_logs_bloom: format!("{:#x}", receipt.logs_bloom),
            receipt_status: u8::from(receipt.status),
            receipt_to: receipt.to.map(|a| format!("{a:#x}")),
            receipt_transaction_index: transaction_index,
            receipt_logs: receipt.logs_json.clone(),
        }
    }
}

/// [`EventSink`] backed by the ClickHouse HTTP interface.
#[derive(Clone)]
pub struct ClickHouseSink {
    client: Client,
    database: String,
    table: String,
}

// Manual impl: `clickhouse::Client` is not `Debug`, and its connection
// settings carry credentials anyway.
impl fmt::Debug for ClickHouseSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClickHouseSink")
            .field("database", &self.database)
            .field("table", &self.table)
            .finish_non_exhaustive()
    }
}

impl ClickHouseSink {
    /// Connect a sink from configuration; the connection is reused across
    /// iterations for the whole process lifetime.
    #[must_use]
    pub fn connect(config: &ClickHouseConfig) -> Self {
        let mut client = Client::default().with_url(&config.url);
        if let Some(user) = &config.user {
            client = client.with_user(user);
        }
        if let Some(password) = &config.password {
            client = client.with_password(password);
        }
        Self {
            client,
            database: config.database.clone(),
            table: config.table.clone(),
        }
    }

    fn qualified_table(&self) -> String {
        format!("{}.{}", self.database, self.table)
    }

    fn table_ddl(&self) -> String {
        format!(
            r"CREATE TABLE IF NOT EXISTS {table} (
    block_number UInt64,
    transaction_hash String,
    from_address String,
    to_address String,
    value String,
    timestamp DateTime,
    receipt_block_hash String,
    receipt_block_number UInt64,
    receipt_contract_address Nullable(String),
    receipt_cumulative_gas_used UInt64,
    receipt_effective_gas_price String,
    receipt_from String,
    receipt_gas_used UInt64,
    receipt_logs_bloom String,
    receipt_status UInt8,
    receipt_to Nullable(String),
    receipt_transaction_index UInt32,
    receipt_logs String,
    updated_at DateTime DEFAULT now()
) ENGINE = ReplacingMergeTree(updated_at)
ORDER BY (transaction_hash, block_number)
PARTITION BY intDiv(block_number, 100000)
SETTINGS index_granularity = 8192",
            table = self.qualified_table()
        )
    }

    fn index_ddl(&self) -> Vec<String> {
        let table = self.qualified_table();
        vec![
            format!(
                "ALTER TABLE {table} ADD INDEX IF NOT EXISTS idx_timestamp timestamp TYPE minmax GRANULARITY 4"
            ),
            format!(
                "ALTER TABLE {table} ADD INDEX IF NOT EXISTS idx_from_address from_address TYPE bloom_filter GRANULARITY 1"
            ),
            format!(
                "ALTER TABLE {table} ADD INDEX IF NOT EXISTS idx_to_address to_address TYPE bloom_filter GRANULARITY 1"
            ),
            format!(
                "ALTER TABLE {table} ADD INDEX IF NOT EXISTS idx_block_number block_number TYPE minmax GRANULARITY 4"
            ),
        ]
    }
}

impl EventSink for ClickHouseSink {
    async fn ensure_schema(&self) -> Result<()> {
        self.client
            .query(&format!("CREATE DATABASE IF NOT EXISTS {}", self.database))
            .execute()
            .await
            .with_context(|| format!("creating database {}", self.database))?;

        self.client
            .query(&self.table_ddl())
            .execute()
            .await
            .with_context(|| format!("creating table {}", self.qualified_table()))?;

        for ddl in self.index_ddl() {
            self.client
                .query(&ddl)
                .execute()
                .await
                .with_context(|| format!("adding skip index on {}", self.qualified_table()))?;
        }

        tracing::info!(table = %self.qualified_table(), "schema ready");
        Ok(())
    }

    async fn insert(&self, events: &[TransferEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let table = self.qualified_table();
        let mut insert = self
            .client
            .insert::<TransferRow>(&table)
            .with_context(|| format!("opening insert into {table}"))?;
        for event in events {
            insert
                .write(&TransferRow::from(event))
                .await
                .with_context(|| format!("writing row {:#x}", event.transaction_hash))?;
        }
        insert
            .end()
            .await
            .with_context(|| format!("committing insert into {table}"))?;

        tracing::debug!(rows = events.len(), table = %table, "inserted");
        Ok(())
    }
}

/// Size-bounded buffer between the fetcher and the sink.
///
/// Owned exclusively by one iteration; flushes whenever the threshold is
/// reached and once more for any remainder at iteration end, keeping each
/// insert well under transport payload limits.
#[derive(Debug)]
pub struct SinkWriter<'a, S> {
    sink: &'a S,
    buffer: Vec<TransferEvent>,
    max_rows: usize,
}

impl<'a, S: EventSink> SinkWriter<'a, S> {
    /// Create a writer flushing to `sink` every `max_rows` events.
    #[must_use]
    pub const fn new(sink: &'a S, max_rows: usize) -> Self {
        Self {
            sink,
            buffer: Vec::new(),
            max_rows,
        }
    }

    /// Buffer one event, flushing first if the buffer is full.
    ///
    /// # Errors
    ///
    /// Returns an error if a triggered flush fails; the buffer keeps its
    /// contents so the caller can abandon the iteration without advancing
    /// the checkpoint.
    pub async fn append(&mut self, event: TransferEvent) -> Result<()> {
        self.buffer.push(event);
        self.flush_if_full().await
    }

    /// Flush if the configured threshold is reached.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink insert fails.
    pub async fn flush_if_full(&mut self) -> Result<()> {
        if self.buffer.len() >= self.max_rows {
            self.flush().await?;
        }
        Ok(())
    }

    /// Flush whatever is left, regardless of threshold. Consumes the
    /// writer; a buffer is never carried across iterations.
    ///
    /// # Errors
    ///
    /// Returns an error if the sink insert fails.
    pub async fn flush_remaining(mut self) -> Result<()> {
        if !self.buffer.is_empty() {
            self.flush().await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.sink.insert(&self.buffer).await?;
        tracing::info!(rows = self.buffer.len(), "flushed batch to sink");
        self.buffer.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ClickHouseConfig;
    use crate::testutil::{MockSink, transfer_event};

    use super::{ClickHouseSink, EventSink, SinkWriter};

    #[test]
    fn sink_debug_reports_the_destination_without_the_client() {
        let sink = ClickHouseSink::connect(&ClickHouseConfig {
            url: "http://localhost:8123".to_owned(),
            database: "transfers".to_owned(),
            table: "wallet_transfers".to_owned(),
            user: None,
            password: Some("secret".to_owned()),
            flush_max_rows: 1_000,
        });

        let dump = format!("{sink:?}");
        assert!(dump.contains("transfers"), "database is visible: {dump}");
        assert!(dump.contains("wallet_transfers"), "table is visible: {dump}");
        assert!(!dump.contains("secret"), "credentials never leak into debug output: {dump}");
    }

    #[tokio::test]
    async fn threshold_triggers_exactly_one_full_flush() {
        let sink = MockSink::default();
        let mut writer = SinkWriter::new(&sink, 3);

        for i in 0..3u8 {
            writer.append(transfer_event(100 + u64::from(i), i)).await.expect("append");
        }
        assert_eq!(sink.insert_sizes(), vec![3], "one flush with exactly the threshold count");

        writer.append(transfer_event(200, 9)).await.expect("append past threshold");
        assert_eq!(sink.insert_sizes(), vec![3], "partial buffer does not flush early");

        writer.flush_remaining().await.expect("final flush");
        assert_eq!(sink.insert_sizes(), vec![3, 1], "remainder flushes exactly once");
    }

    #[tokio::test]
    async fn empty_remainder_does_not_flush() {
        let sink = MockSink::default();
        let writer = SinkWriter::new(&sink, 3);

        writer.flush_remaining().await.expect("empty flush is a no-op");
        assert!(sink.insert_sizes().is_empty(), "no insert call for an empty buffer");
    }

    #[tokio::test]
    async fn redelivery_is_idempotent_under_dedup_keys() {
        let sink = MockSink::default();
        let batch = vec![transfer_event(100, 1), transfer_event(101, 2)];

        sink.insert(&batch).await.expect("first delivery");
        sink.insert(&batch).await.expect("redelivery");

        assert_eq!(sink.insert_sizes(), vec![2, 2], "both deliveries reach the sink");
        assert_eq!(sink.unique_rows(), 2, "merge-time dedup keeps one logical row per key");
    }

    #[tokio::test]
    async fn failed_flush_keeps_the_buffer() {
        let sink = MockSink::default();
        sink.fail_next();
        let mut writer = SinkWriter::new(&sink, 1);

        let result = writer.append(transfer_event(100, 1)).await;
        assert!(result.is_err(), "flush failure propagates");
        assert_eq!(sink.unique_rows(), 0, "nothing was recorded by the failed insert");

        writer.flush_remaining().await.expect("retry after recovery");
        assert_eq!(sink.unique_rows(), 1, "buffered event survives a failed flush");
    }
}
