//! Tier Writer (§4.5): turns a drained batch into an `INSERT`, retrying
//! transient failures with backoff and isolating poison rows so one bad
//! record doesn't block an entire batch.
//!
//! Grounded on the donor's `scrapers::dome_websocket` reconnect loop for
//! the exponential-backoff shape (`delay * multiplier`, capped), and on
//! `signals::db_storage::store_batch`'s drain-then-insert-then-retry
//! structure for the batch write itself.

use crate::config::RetrySettings;
use crate::error::StorageError;
use crate::metrics;
use crate::model::{DataType, Record};
use crate::store::{ConnectionPool, InsertFormat, Row};
use futures_util::future::BoxFuture;
use serde_json::Value;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use tracing::{error, warn};

/// Rolling error-window circuit breaker (§7): once `threshold` consecutive
/// failures accumulate, writes short-circuit without hitting the store,
/// giving it room to recover. Clears on the next success.
struct CircuitBreaker {
    consecutive_failures: AtomicU32,
    threshold: u32,
}

impl CircuitBreaker {
    fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold,
        }
    }

    fn is_open(&self) -> bool {
        self.consecutive_failures.load(Ordering::Relaxed) >= self.threshold
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) -> u32 {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct TierWriter {
    pool: ConnectionPool,
    retry: RetrySettings,
    breaker: CircuitBreaker,
    table_prefix: &'static str,
    written_total: AtomicU64,
    failed_batches_total: AtomicU64,
    retries_total: AtomicU64,
}

impl TierWriter {
    pub fn new(pool: ConnectionPool, retry: RetrySettings, table_prefix: &'static str) -> Self {
        Self {
            pool,
            retry,
            breaker: CircuitBreaker::new(5),
            table_prefix,
            written_total: AtomicU64::new(0),
            failed_batches_total: AtomicU64::new(0),
            retries_total: AtomicU64::new(0),
        }
    }

    pub fn written_total(&self) -> u64 {
        self.written_total.load(Ordering::Relaxed)
    }

    pub fn failed_batches_total(&self) -> u64 {
        self.failed_batches_total.load(Ordering::Relaxed)
    }

    pub fn retries_total(&self) -> u64 {
        self.retries_total.load(Ordering::Relaxed)
    }

    pub fn is_degraded(&self) -> bool {
        self.breaker.is_open()
    }

    /// Writes `records` (all the same `data_type`), returning the number of
    /// rows actually written. Retries the whole batch on transient errors;
    /// on a permanent per-row rejection, isolates and drops just that row
    /// (recorded as an error metric) and retries the remainder once.
    pub async fn write(&self, data_type: DataType, records: Vec<Record>) -> Result<usize, StorageError> {
        if self.breaker.is_open() {
            return Err(StorageError::StoreTransient(
                "circuit breaker open; skipping write attempt".into(),
            ));
        }

        let table = format!("{}_{}", self.table_prefix, data_type.table_name());
        let columns = columns_for(data_type);

        let mut pending = records;
        let mut attempt = 0u32;
        loop {
            let rows: Vec<Row> = pending.iter().map(|r| row_for(r)).collect();

            let result = self.attempt_insert(&table, &columns, &rows).await;
            match result {
                Ok(()) => {
                    self.breaker.record_success();
                    metrics::record_message_stored(data_type.table_name(), pending.len() as u64);
                    self.written_total.fetch_add(pending.len() as u64, Ordering::Relaxed);
                    return Ok(pending.len());
                }
                Err(e) if e.is_batch_poison() && pending.len() > 1 => {
                    // Can't tell which row is poison from a rejected batch;
                    // isolate by bisection, narrowing until the faulty row
                    // is identified or the remainder succeeds.
                    warn!(table, error = %e, "batch rejected; isolating poison rows");
                    return self.write_isolating(&table, &columns, pending).await;
                }
                Err(e) if e.is_batch_poison() => {
                    error!(table, error = %e, digest = %payload_digest(&rows[0]), "single record rejected permanently; dropping");
                    metrics::record_error(data_type.table_name(), "poison_row");
                    self.breaker.record_success();
                    return Ok(0);
                }
                Err(e) if e.is_retryable() && attempt < self.retry.max_retries => {
                    let failures = self.breaker.record_failure();
                    attempt += 1;
                    let delay = self.retry.delay_for_attempt_with_base(attempt, e.base_delay_secs());
                    metrics::record_retry(data_type.table_name());
                    self.retries_total.fetch_add(1, Ordering::Relaxed);
                    warn!(table, attempt, failures, delay_ms = delay.as_millis() as u64, error = %e, "retrying write");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    self.breaker.record_failure();
                    self.failed_batches_total.fetch_add(1, Ordering::Relaxed);
                    return Err(e);
                }
            }
        }
    }

    async fn attempt_insert(&self, table: &str, columns: &[&str], rows: &[Row]) -> Result<(), StorageError> {
        let client = self.pool.acquire().await?;
        let start = Instant::now();
        let result = client.insert(table, columns, rows, InsertFormat::JsonEachRow).await;
        let _ = start.elapsed();
        result
    }

    /// Splits `records` in half and retries each half independently,
    /// recursing until rejected halves bottom out at a single row (which is
    /// then dropped as poison) or succeed. Boxed because async fns can't
    /// recurse directly (their future would have infinite size).
    fn write_isolating<'a>(
        &'a self,
        table: &'a str,
        columns: &'a [&'static str],
        records: Vec<Record>,
    ) -> BoxFuture<'a, Result<usize, StorageError>> {
        Box::pin(async move {
            if records.len() == 1 {
                let rows = vec![row_for(&records[0])];
                return match self.attempt_insert(table, columns, &rows).await {
                    Ok(()) => Ok(1),
                    Err(_) => {
                        error!(table, digest = %payload_digest(&rows[0]), "isolated row rejected; dropping as poison");
                        Ok(0)
                    }
                };
            }

            let mid = records.len() / 2;
            let (left, right) = records.split_at(mid);
            let left = left.to_vec();
            let right = right.to_vec();

            let mut written = 0;
            for half in [left, right] {
                let rows: Vec<Row> = half.iter().map(|r| row_for(r)).collect();
                match self.attempt_insert(table, columns, &rows).await {
                    Ok(()) => written += half.len(),
                    Err(_) => written += self.write_isolating(table, columns, half).await?,
                }
            }
            Ok(written)
        })
    }
}

fn columns_for(data_type: DataType) -> Vec<&'static str> {
    let mut cols = vec!["exchange", "market_type", "symbol", "timestamp"];
    let payload: &[&str] = match data_type {
        DataType::Trade => &["trade_id", "price", "quantity", "side", "is_maker"],
        DataType::Orderbook => &["bids", "asks", "depth"],
        DataType::Ticker => &["last_price", "bid_price", "ask_price", "volume_24h", "price_change_pct"],
        DataType::FundingRate => &["funding_rate", "next_funding_time"],
        DataType::OpenInterest => &["open_interest_value", "open_interest_amount"],
        DataType::Liquidation => &["side", "price", "quantity"],
        DataType::VolatilityIndex => &["vol_index_value", "index_name"],
        DataType::LsrTopPosition | DataType::LsrAllAccount => {
            &["long_account_ratio", "short_account_ratio", "long_short_ratio"]
        }
    };
    cols.extend_from_slice(payload);
    cols
}

fn row_for(record: &Record) -> Row {
    use crate::model::Payload;

    let mut row: Row = vec![
        Value::String(record.envelope.exchange.clone()),
        Value::String(format!("{:?}", record.envelope.market_type).to_lowercase()),
        Value::String(record.envelope.symbol.clone()),
        Value::String(record.envelope.timestamp.to_rfc3339()),
    ];

    let payload: Vec<Value> = match &record.payload {
        Payload::Trade(t) => vec![
            Value::String(t.trade_id.clone()),
            Value::String(t.price.to_string()),
            Value::String(t.quantity.to_string()),
            Value::String(t.side.clone()),
            t.is_maker.map(|b| Value::Bool(b)).unwrap_or(Value::Null),
        ],
        Payload::Orderbook(ob) => vec![
            Value::String(serde_json::to_string(&ob.bids).unwrap_or_default()),
            Value::String(serde_json::to_string(&ob.asks).unwrap_or_default()),
            ob.depth.map(|d| Value::Number(d.into())).unwrap_or(Value::Null),
        ],
        Payload::Ticker(t) => vec![
            Value::String(t.last_price.to_string()),
            opt_decimal(t.bid_price.as_ref()),
            opt_decimal(t.ask_price.as_ref()),
            opt_decimal(t.volume_24h.as_ref()),
            opt_decimal(t.price_change_pct.as_ref()),
        ],
        Payload::FundingRate(f) => vec![
            Value::String(f.funding_rate.to_string()),
            f.next_funding_time
                .map(|t| Value::String(t.to_rfc3339()))
                .unwrap_or(Value::Null),
        ],
        Payload::OpenInterest(o) => vec![
            Value::String(o.open_interest_value.to_string()),
            opt_decimal(o.open_interest_amount.as_ref()),
        ],
        Payload::Liquidation(l) => vec![
            Value::String(l.side.clone()),
            Value::String(l.price.to_string()),
            Value::String(l.quantity.to_string()),
        ],
        Payload::VolatilityIndex(v) => vec![
            Value::String(v.vol_index_value.to_string()),
            v.index_name.clone().map(Value::String).unwrap_or(Value::Null),
        ],
        Payload::LsrTopPosition(l) | Payload::LsrAllAccount(l) => vec![
            Value::String(l.long_account_ratio.to_string()),
            Value::String(l.short_account_ratio.to_string()),
            Value::String(l.long_short_ratio.to_string()),
        ],
    };

    row.extend(payload);
    row
}

fn opt_decimal(value: Option<&rust_decimal::Decimal>) -> Value {
    value.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null)
}

/// A short, non-cryptographic fingerprint of a rendered row, for logging
/// dropped poison rows without dumping the full payload.
fn payload_digest(row: &Row) -> String {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    serde_json::to_string(row).unwrap_or_default().hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
