//! Schema Manager (§4.3): idempotently creates the hot and cold databases
//! and per-data-type tables on process start.
//!
//! The DDL-as-one-string idiom mirrors the donor's `SCHEMA_SQL` constant in
//! `signals::db_storage`, translated from SQLite pragmas to the
//! ClickHouse-style `ENGINE=`/`PARTITION BY`/`TTL` clauses required by
//! §3.3: fast codec + day+exchange partitioning for hot, high-ratio codec +
//! month+exchange partitioning for cold.
use crate::model::DataType;
use crate::store::client::StoreClient;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Hot,
    Cold,
}

impl Tier {
    fn partition_by(&self) -> &'static str {
        match self {
            Tier::Hot => "toYYYYMMDD(timestamp), exchange",
            Tier::Cold => "toYYYYMM(timestamp), exchange",
        }
    }

    fn codec(&self) -> &'static str {
        match self {
            Tier::Hot => "CODEC(LZ4)",
            Tier::Cold => "CODEC(ZSTD(9))",
        }
    }

    fn database_suffix(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Cold => "cold",
        }
    }
}

/// Report of one table's create-or-confirm outcome.
#[derive(Debug, Clone)]
pub struct TableReport {
    pub data_type: DataType,
    pub ok: bool,
    pub error: Option<String>,
}

pub struct SchemaManager {
    client: StoreClient,
    tier: Tier,
    ttl_days: u32,
}

impl SchemaManager {
    pub fn new(client: StoreClient, tier: Tier, ttl_days: u32) -> Self {
        Self {
            client,
            tier,
            ttl_days,
        }
    }

    /// Creates the database, then one table per data type. A table-creation
    /// error is logged and that data type is disabled, not fatal, unless
    /// every table failed to create.
    pub async fn initialize(&self) -> Result<Vec<TableReport>, crate::error::StorageError> {
        let create_db = format!(
            "CREATE DATABASE IF NOT EXISTS {}",
            self.client.database()
        );
        self.client.execute(&create_db).await?;

        let mut reports = Vec::with_capacity(DataType::ALL.len());
        for data_type in DataType::ALL {
            let ddl = self.table_ddl(data_type);
            match self.client.execute(&ddl).await {
                Ok(()) => {
                    info!(table = data_type.table_name(), tier = ?self.tier, "table ready");
                    reports.push(TableReport {
                        data_type,
                        ok: true,
                        error: None,
                    });
                }
                Err(e) => {
                    error!(table = data_type.table_name(), tier = ?self.tier, error = %e, "table creation failed; data type disabled");
                    reports.push(TableReport {
                        data_type,
                        ok: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if reports.iter().all(|r| !r.ok) {
            return Err(crate::error::StorageError::ConfigInvalid(format!(
                "all {} table(s) failed to create in {:?} tier",
                reports.len(),
                self.tier
            )));
        }
        if reports.iter().any(|r| !r.ok) {
            warn!(tier = ?self.tier, "some tables failed to create; affected data types are disabled");
        }

        Ok(reports)
    }

    fn table_ddl(&self, data_type: DataType) -> String {
        let table = format!("{}_{}", self.tier.database_suffix(), data_type.table_name());
        let payload_columns = payload_columns(data_type);

        format!(
            r#"CREATE TABLE IF NOT EXISTS {database}.{table} (
    exchange LowCardinality(String),
    market_type LowCardinality(String),
    symbol LowCardinality(String),
    timestamp DateTime64(3) {codec},
    insert_time DateTime DEFAULT now(),
{payload_columns}
    INDEX idx_ts timestamp TYPE minmax GRANULARITY 4,
    INDEX idx_symbol symbol TYPE bloom_filter GRANULARITY 4
)
ENGINE = ReplacingMergeTree(insert_time)
PARTITION BY ({partition_by})
ORDER BY (exchange, symbol, timestamp{trade_id_order})
TTL insert_time + INTERVAL {ttl_days} DAY
SETTINGS index_granularity = 8192"#,
            database = self.client.database(),
            table = table,
            codec = self.tier.codec(),
            payload_columns = payload_columns,
            partition_by = self.tier.partition_by(),
            ttl_days = self.ttl_days,
            trade_id_order = if data_type == DataType::Trade {
                ", trade_id"
            } else {
                ""
            },
        )
    }
}

fn payload_columns(data_type: DataType) -> String {
    let columns: &[&str] = match data_type {
        DataType::Trade => &[
            "trade_id String",
            "price Decimal(38, 18)",
            "quantity Decimal(38, 18)",
            "side LowCardinality(String)",
            "is_maker Nullable(UInt8)",
        ],
        DataType::Orderbook => &["bids String", "asks String", "depth Nullable(UInt32)"],
        DataType::Ticker => &[
            "last_price Decimal(38, 18)",
            "bid_price Nullable(Decimal(38, 18))",
            "ask_price Nullable(Decimal(38, 18))",
            "volume_24h Nullable(Decimal(38, 18))",
            "price_change_pct Nullable(Decimal(38, 18))",
        ],
        DataType::FundingRate => &[
            "funding_rate Decimal(38, 18)",
            "next_funding_time Nullable(DateTime64(3))",
        ],
        DataType::OpenInterest => &[
            "open_interest_value Decimal(38, 18)",
            "open_interest_amount Nullable(Decimal(38, 18))",
        ],
        DataType::Liquidation => &[
            "side LowCardinality(String)",
            "price Decimal(38, 18)",
            "quantity Decimal(38, 18)",
        ],
        DataType::VolatilityIndex => &[
            "vol_index_value Decimal(38, 18)",
            "index_name Nullable(String)",
        ],
        DataType::LsrTopPosition | DataType::LsrAllAccount => &[
            "long_account_ratio Decimal(38, 18)",
            "short_account_ratio Decimal(38, 18)",
            "long_short_ratio Decimal(38, 18)",
        ],
    };
    columns
        .iter()
        .map(|c| format!("    {c},\n"))
        .collect::<String>()
}
