//! Bus Subscriber (§4.6): one durable JetStream consumer per data type,
//! normalizing field aliases before handing records to the Batch Queue
//! Manager.
//!
//! The reconnect-with-backoff shape is grounded on
//! `scrapers::dome_websocket::DomeWebSocketClient::run`'s exponential
//! backoff loop, retargeted at a JetStream pull consumer instead of a raw
//! websocket.

use crate::config::BusConfig;
use crate::error::StorageError;
use crate::metrics;
use crate::model::{DataType, Envelope, MarketType, Payload, Record};
use crate::queue::BatchQueueManager;
use async_nats::jetstream::{self, consumer::AckPolicy, consumer::DeliverPolicy};
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Counters the Admin Facade reads for `/stats`, shared across every
/// per-type consumer task.
#[derive(Default)]
pub struct SubscriberStats {
    messages_received: AtomicU64,
    reconnects: AtomicU64,
}

impl SubscriberStats {
    pub fn messages_received(&self) -> u64 {
        self.messages_received.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }
}

pub struct BusSubscriber {
    config: BusConfig,
    queue: Arc<BatchQueueManager>,
    stats: Arc<SubscriberStats>,
}

impl BusSubscriber {
    pub fn new(config: BusConfig, queue: Arc<BatchQueueManager>, stats: Arc<SubscriberStats>) -> Self {
        Self { config, queue, stats }
    }

    /// Runs one durable consumer per data type concurrently, each with its
    /// own reconnect loop; returns only if every consumer task exits (which
    /// happens only on cancellation).
    pub async fn run_all(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut handles = Vec::with_capacity(DataType::ALL.len());
        for data_type in DataType::ALL {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                this.run_one_with_backoff(data_type, &mut shutdown).await;
            }));
        }
        let _ = shutdown.changed().await;
        for handle in handles {
            handle.abort();
        }
    }

    async fn run_one_with_backoff(&self, data_type: DataType, shutdown: &mut tokio::sync::watch::Receiver<bool>) {
        let mut reconnect_delay = Duration::from_secs(1);
        let max_reconnect_delay = Duration::from_secs(30);

        loop {
            if *shutdown.borrow() {
                return;
            }
            let connect_start = Instant::now();
            match self.connect_and_consume(data_type, shutdown).await {
                Ok(()) => {
                    info!(data_type = data_type.table_name(), "consumer stopped cleanly");
                    return;
                }
                Err(e) => {
                    metrics::record_error(data_type.table_name(), "bus_disconnect");
                    self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        data_type = data_type.table_name(),
                        error = %e,
                        uptime_secs = connect_start.elapsed().as_secs(),
                        delay_secs = reconnect_delay.as_secs(),
                        "bus consumer disconnected; reconnecting"
                    );
                    tokio::time::sleep(reconnect_delay).await;
                    reconnect_delay = (reconnect_delay * 2).min(max_reconnect_delay);
                }
            }
        }
    }

    async fn connect_and_consume(
        &self,
        data_type: DataType,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), StorageError> {
        let client = async_nats::connect(&self.config.urls.join(","))
            .await
            .map_err(|e| StorageError::BusTransient(e.to_string()))?;
        let context = jetstream::new(client);

        let stream = context
            .get_stream(&self.config.stream_name)
            .await
            .map_err(|e| StorageError::BusTransient(e.to_string()))?;

        let consumer_name = format!("{}-{}-consumer", self.config.durable_prefix, data_type.table_name());
        let ack_after_flush = self
            .config
            .ack_after_flush
            .iter()
            .any(|t| t == data_type.table_name());

        let consumer: jetstream::consumer::PullConsumer = stream
            .get_or_create_consumer(
                &consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(consumer_name.clone()),
                    ack_policy: AckPolicy::Explicit,
                    deliver_policy: DeliverPolicy::Last,
                    max_ack_pending: self.config.max_unacked as i64,
                    ack_wait: Duration::from_secs(self.config.ack_wait_secs),
                    filter_subject: data_type.subject_wildcard(),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| StorageError::BusTransient(e.to_string()))?;

        info!(data_type = data_type.table_name(), consumer = consumer_name, "consumer bound");

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| StorageError::BusTransient(e.to_string()))?;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return Ok(());
                    }
                }
                next = messages.next() => {
                    let Some(message) = next else { return Ok(()) };
                    let message = message.map_err(|e| StorageError::BusTransient(e.to_string()))?;

                    metrics::record_message_received(data_type.table_name());
                    self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
                    match parse_record(data_type, message.payload.as_ref()) {
                        Ok(record) => {
                            if ack_after_flush {
                                let (tx, rx) = tokio::sync::oneshot::channel();
                                self.queue.enqueue_with_ack(record, Some(tx)).await;
                                tokio::spawn(async move {
                                    if rx.await.is_ok() {
                                        if let Err(e) = message.ack().await {
                                            error!(error = %e, "failed to ack after flush");
                                        }
                                    }
                                });
                            } else {
                                self.queue.enqueue(record).await;
                                if let Err(e) = message.ack().await {
                                    error!(error = %e, "failed to ack after enqueue");
                                }
                            }
                        }
                        Err(e) => {
                            metrics::record_error(data_type.table_name(), "deserialize_failed");
                            debug!(error = %e, "rejecting non-conforming message");
                            if let Err(e) = message.ack_with(jetstream::AckKind::Term).await {
                                error!(error = %e, "failed to terminate poison message");
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Deserializes a raw bus payload into a `Record`, applying the field-alias
/// normalization the upstream collector's publishers are known to need.
fn parse_record(data_type: DataType, bytes: &[u8]) -> Result<Record, StorageError> {
    let mut raw: Value =
        serde_json::from_slice(bytes).map_err(|e| StorageError::StoreReject(format!("non-JSON payload: {e}")))?;
    let object = raw
        .as_object_mut()
        .ok_or_else(|| StorageError::StoreReject("payload is not a JSON object".into()))?;

    normalize_aliases(data_type, object);

    let exchange = object
        .remove("exchange")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| StorageError::StoreReject("missing exchange".into()))?;
    let symbol = object
        .remove("symbol")
        .and_then(|v| v.as_str().map(str::to_string))
        .ok_or_else(|| StorageError::StoreReject("missing symbol".into()))?;
    let timestamp = object
        .remove("timestamp")
        .ok_or_else(|| StorageError::StoreReject("missing timestamp".into()))
        .and_then(|v| {
            serde_json::from_value(v).map_err(|e| StorageError::StoreReject(format!("bad timestamp: {e}")))
        })?;

    let default_market_type = if data_type == DataType::VolatilityIndex {
        "options"
    } else {
        "spot"
    };
    let market_type = object
        .remove("market_type")
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| default_market_type.to_string());
    let market_type: MarketType = serde_json::from_value(Value::String(market_type))
        .map_err(|e| StorageError::StoreReject(format!("bad market_type: {e}")))?;

    let envelope = Envelope {
        exchange,
        market_type,
        symbol,
        timestamp,
    };

    let remainder = Value::Object(object.clone());
    let payload = decode_payload(data_type, remainder)?;

    Ok(Record {
        envelope,
        payload,
        enqueued_at: chrono::Utc::now(),
    })
}

fn decode_payload(data_type: DataType, value: Value) -> Result<Payload, StorageError> {
    let reject = |e: serde_json::Error| StorageError::StoreReject(format!("payload shape mismatch: {e}"));
    Ok(match data_type {
        DataType::Trade => Payload::Trade(serde_json::from_value(value).map_err(reject)?),
        DataType::Orderbook => Payload::Orderbook(serde_json::from_value(value).map_err(reject)?),
        DataType::Ticker => Payload::Ticker(serde_json::from_value(value).map_err(reject)?),
        DataType::FundingRate => Payload::FundingRate(serde_json::from_value(value).map_err(reject)?),
        DataType::OpenInterest => Payload::OpenInterest(serde_json::from_value(value).map_err(reject)?),
        DataType::Liquidation => Payload::Liquidation(serde_json::from_value(value).map_err(reject)?),
        DataType::VolatilityIndex => Payload::VolatilityIndex(serde_json::from_value(value).map_err(reject)?),
        DataType::LsrTopPosition => Payload::LsrTopPosition(serde_json::from_value(value).map_err(reject)?),
        DataType::LsrAllAccount => Payload::LsrAllAccount(serde_json::from_value(value).map_err(reject)?),
    })
}

/// Renames known upstream field aliases to the names our payload structs
/// expect, in place, before struct deserialization.
fn normalize_aliases(data_type: DataType, object: &mut serde_json::Map<String, Value>) {
    if data_type == DataType::FundingRate {
        if let Some(v) = object.remove("current_funding_rate") {
            object.entry("funding_rate").or_insert(v);
        }
    }
    if data_type == DataType::VolatilityIndex {
        if let Some(v) = object.remove("volatility_index") {
            object.entry("vol_index_value").or_insert(v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_trade_with_standard_fields() {
        let json = br#"{"exchange":"binance","market_type":"spot","symbol":"BTCUSDT","trade_id":"t1","price":"50000","quantity":"0.1","side":"buy","timestamp":"2025-01-01T00:00:00.000Z"}"#;
        let record = parse_record(DataType::Trade, json).unwrap();
        assert_eq!(record.envelope.exchange, "binance");
        assert_eq!(record.data_type(), DataType::Trade);
    }

    #[test]
    fn normalizes_funding_rate_alias() {
        let json = br#"{"exchange":"okx","market_type":"perpetual","symbol":"BTC-PERP","current_funding_rate":"0.0001","timestamp":"2025-01-01T00:00:00.000Z"}"#;
        let record = parse_record(DataType::FundingRate, json).unwrap();
        match record.payload {
            Payload::FundingRate(f) => assert_eq!(f.funding_rate.to_string(), "0.0001"),
            _ => panic!("expected funding rate payload"),
        }
    }

    #[test]
    fn defaults_market_type_to_options_for_volatility_index() {
        let json = br#"{"exchange":"deribit","symbol":"BTC-VOL","volatility_index":"55.2","timestamp":"2025-01-01T00:00:00.000Z"}"#;
        let record = parse_record(DataType::VolatilityIndex, json).unwrap();
        assert_eq!(record.envelope.market_type, MarketType::Options);
    }

    #[test]
    fn rejects_non_json_payload() {
        let result = parse_record(DataType::Trade, b"not json");
        assert!(result.is_err());
    }
}
