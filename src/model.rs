//! Record envelope, per-data-type payloads, and the static table-spec
//! catalog driving batch policy, ordering key, and partition grain.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The eight data-type streams the core recognizes. Each has its own hot
/// and cold table and its own batch queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Trade,
    Orderbook,
    Ticker,
    FundingRate,
    OpenInterest,
    Liquidation,
    VolatilityIndex,
    LsrTopPosition,
    LsrAllAccount,
}

impl DataType {
    pub const ALL: [DataType; 9] = [
        DataType::Trade,
        DataType::Orderbook,
        DataType::Ticker,
        DataType::FundingRate,
        DataType::OpenInterest,
        DataType::Liquidation,
        DataType::VolatilityIndex,
        DataType::LsrTopPosition,
        DataType::LsrAllAccount,
    ];

    /// Canonical persisted table name. Always singular, per the source's
    /// open question: some configs publish a plural variant on the wire,
    /// but the table name is always singular.
    pub fn table_name(&self) -> &'static str {
        match self {
            DataType::Trade => "trade",
            DataType::Orderbook => "orderbook",
            DataType::Ticker => "ticker",
            DataType::FundingRate => "funding_rate",
            DataType::OpenInterest => "open_interest",
            DataType::Liquidation => "liquidation",
            DataType::VolatilityIndex => "volatility_index",
            DataType::LsrTopPosition => "lsr_top_position",
            DataType::LsrAllAccount => "lsr_all_account",
        }
    }

    /// Bus subject prefix, e.g. `trade.>`.
    pub fn subject_wildcard(&self) -> String {
        format!("{}.>", self.wire_name())
    }

    /// Wire name used in bus subjects, which matches the table name for
    /// every type except the `orderbook`/`orderbooks` ambiguity noted in
    /// the source; subjects are always emitted in singular form too.
    pub fn wire_name(&self) -> &'static str {
        self.table_name()
    }

    /// Accepts both singular and plural spellings on input (the upstream
    /// collector has been observed to publish `orderbooks` in some
    /// configs); the canonical table name is always singular.
    pub fn parse(raw: &str) -> Option<DataType> {
        let normalized = raw.trim().to_ascii_lowercase();
        let singular = normalized.strip_suffix('s').unwrap_or(&normalized);
        match singular {
            "trade" => Some(DataType::Trade),
            "orderbook" => Some(DataType::Orderbook),
            "ticker" => Some(DataType::Ticker),
            "funding_rate" | "funding_rates" => Some(DataType::FundingRate),
            "open_interest" => Some(DataType::OpenInterest),
            "liquidation" => Some(DataType::Liquidation),
            "volatility_index" => Some(DataType::VolatilityIndex),
            "lsr_top_position" => Some(DataType::LsrTopPosition),
            "lsr_all_account" => Some(DataType::LsrAllAccount),
            _ => None,
        }
    }
}

/// Batching policy for one data type: size/age/hard-cap triggers.
#[derive(Debug, Clone, Copy)]
pub struct BatchPolicy {
    pub batch_size: usize,
    pub timeout: Duration,
    pub max_queue: usize,
}

/// Per-tier table layout (partition grain only differs hot vs. cold;
/// ordering key and codec choice are shared).
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub data_type: DataType,
    pub batch: BatchPolicy,
}

pub fn table_spec(data_type: DataType) -> TableSpec {
    let batch = match data_type {
        DataType::Trade => BatchPolicy {
            batch_size: 500,
            timeout: Duration::from_millis(1500),
            max_queue: 5000,
        },
        DataType::Orderbook => BatchPolicy {
            batch_size: 1000,
            timeout: Duration::from_millis(2000),
            max_queue: 10000,
        },
        DataType::Ticker => BatchPolicy {
            batch_size: 500,
            timeout: Duration::from_millis(2000),
            max_queue: 5000,
        },
        DataType::FundingRate => BatchPolicy {
            batch_size: 10,
            timeout: Duration::from_millis(2000),
            max_queue: 500,
        },
        DataType::OpenInterest => BatchPolicy {
            batch_size: 50,
            timeout: Duration::from_secs(10),
            max_queue: 500,
        },
        DataType::Liquidation => BatchPolicy {
            batch_size: 5,
            timeout: Duration::from_secs(10),
            max_queue: 200,
        },
        DataType::VolatilityIndex => BatchPolicy {
            batch_size: 1,
            timeout: Duration::from_secs(1),
            max_queue: 50,
        },
        DataType::LsrTopPosition | DataType::LsrAllAccount => BatchPolicy {
            batch_size: 1,
            timeout: Duration::from_secs(1),
            max_queue: 50,
        },
    };
    TableSpec { data_type, batch }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketType {
    Spot,
    Perpetual,
    Options,
}

/// Fields common to every record, regardless of data type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub exchange: String,
    pub market_type: MarketType,
    pub symbol: String,
    /// Millisecond-precise event time in UTC, as delivered by the source.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub trade_id: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub side: String,
    #[serde(default)]
    pub is_maker: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceLevel {
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBookSnapshot {
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
    #[serde(default)]
    pub depth: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub last_price: Decimal,
    #[serde(default)]
    pub bid_price: Option<Decimal>,
    #[serde(default)]
    pub ask_price: Option<Decimal>,
    #[serde(default)]
    pub volume_24h: Option<Decimal>,
    #[serde(default)]
    pub price_change_pct: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingRate {
    pub funding_rate: Decimal,
    #[serde(default)]
    pub next_funding_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenInterest {
    pub open_interest_value: Decimal,
    #[serde(default)]
    pub open_interest_amount: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Liquidation {
    pub side: String,
    pub price: Decimal,
    pub quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolatilityIndex {
    pub vol_index_value: Decimal,
    #[serde(default)]
    pub index_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsrRecord {
    pub long_account_ratio: Decimal,
    pub short_account_ratio: Decimal,
    pub long_short_ratio: Decimal,
}

/// A typed payload tagged with the data type it belongs to, carried
/// alongside its envelope through the batch queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "data_type", rename_all = "snake_case")]
pub enum Payload {
    Trade(Trade),
    Orderbook(OrderBookSnapshot),
    Ticker(Ticker),
    FundingRate(FundingRate),
    OpenInterest(OpenInterest),
    Liquidation(Liquidation),
    VolatilityIndex(VolatilityIndex),
    LsrTopPosition(LsrRecord),
    LsrAllAccount(LsrRecord),
}

impl Payload {
    pub fn data_type(&self) -> DataType {
        match self {
            Payload::Trade(_) => DataType::Trade,
            Payload::Orderbook(_) => DataType::Orderbook,
            Payload::Ticker(_) => DataType::Ticker,
            Payload::FundingRate(_) => DataType::FundingRate,
            Payload::OpenInterest(_) => DataType::OpenInterest,
            Payload::Liquidation(_) => DataType::Liquidation,
            Payload::VolatilityIndex(_) => DataType::VolatilityIndex,
            Payload::LsrTopPosition(_) => DataType::LsrTopPosition,
            Payload::LsrAllAccount(_) => DataType::LsrAllAccount,
        }
    }
}

/// A fully parsed record awaiting persistence: envelope + payload, plus
/// the bus-ack handle needed to acknowledge (or not) once enqueued/flushed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub envelope: Envelope,
    pub payload: Payload,
    /// Wall-clock time this record entered the batch queue; used for
    /// age-based flush triggers and is independent of `envelope.timestamp`.
    #[serde(skip, default = "Utc::now")]
    pub enqueued_at: DateTime<Utc>,
}

impl Record {
    pub fn data_type(&self) -> DataType {
        self.payload.data_type()
    }

    /// Natural key under which the hot-tier replacing merge collapses
    /// redelivered duplicates.
    pub fn natural_key(&self) -> String {
        match &self.payload {
            Payload::Trade(t) => format!(
                "{}|{}|{}|{}",
                self.envelope.exchange,
                self.envelope.symbol,
                self.envelope.timestamp.timestamp_millis(),
                t.trade_id
            ),
            _ => format!(
                "{}|{}|{}",
                self.envelope.exchange,
                self.envelope.symbol,
                self.envelope.timestamp.timestamp_millis()
            ),
        }
    }

    /// Hot-tier partition id: day granularity + exchange.
    pub fn hot_partition(&self) -> String {
        format!(
            "{}_{}",
            self.envelope.timestamp.format("%Y%m%d"),
            self.envelope.exchange
        )
    }

    /// Cold-tier partition id: month granularity + exchange.
    pub fn cold_partition(&self) -> String {
        format!(
            "{}_{}",
            self.envelope.timestamp.format("%Y%m"),
            self.envelope.exchange
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plural_and_singular_data_types() {
        assert_eq!(DataType::parse("orderbook"), Some(DataType::Orderbook));
        assert_eq!(DataType::parse("orderbooks"), Some(DataType::Orderbook));
        assert_eq!(DataType::parse("Trade"), Some(DataType::Trade));
        assert_eq!(DataType::parse("bogus"), None);
    }

    #[test]
    fn table_name_is_always_singular() {
        assert_eq!(DataType::Orderbook.table_name(), "orderbook");
    }

    #[test]
    fn natural_key_includes_trade_id_for_trades() {
        let rec = Record {
            envelope: Envelope {
                exchange: "binance".into(),
                market_type: MarketType::Spot,
                symbol: "BTCUSDT".into(),
                timestamp: DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                    .unwrap()
                    .with_timezone(&Utc),
            },
            payload: Payload::Trade(Trade {
                trade_id: "t1".into(),
                price: Decimal::new(50000, 0),
                quantity: Decimal::new(1, 1),
                side: "buy".into(),
                is_maker: None,
            }),
            enqueued_at: Utc::now(),
        };
        assert!(rec.natural_key().ends_with("|t1"));
    }
}
