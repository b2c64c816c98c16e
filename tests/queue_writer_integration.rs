//! End-to-end exercise of the batch queue -> tier writer pipeline against
//! a mocked columnar store HTTP surface.

use chrono::Utc;
use marketprism_storage::config::{PoolConfig, RetrySettings, StoreEndpoint};
use marketprism_storage::model::{DataType, Envelope, MarketType, Payload, Record, Trade};
use marketprism_storage::queue::{BatchQueueManager, TierWriter};
use marketprism_storage::store::{ConnectionPool, StoreClient};
use rust_decimal::Decimal;
use std::sync::Arc;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

fn endpoint_for(server: &MockServer) -> StoreEndpoint {
    let addr = server.address();
    StoreEndpoint {
        host: addr.ip().to_string(),
        port: addr.port(),
        user: "default".into(),
        password: String::new(),
        database: "marketprism_hot".into(),
        use_https: false,
    }
}

fn trade_record(id: &str) -> Record {
    Record {
        envelope: Envelope {
            exchange: "binance".into(),
            market_type: MarketType::Spot,
            symbol: "BTCUSDT".into(),
            timestamp: Utc::now(),
        },
        payload: Payload::Trade(Trade {
            trade_id: id.into(),
            price: Decimal::new(50_000, 0),
            quantity: Decimal::new(1, 1),
            side: "buy".into(),
            is_maker: None,
        }),
        enqueued_at: Utc::now(),
    }
}

#[tokio::test]
async fn successful_insert_marks_records_written() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;

    let client = StoreClient::new(&endpoint_for(&server)).unwrap();
    let pool = ConnectionPool::new(client, &PoolConfig::default());
    let writer = Arc::new(TierWriter::new(pool, RetrySettings::default(), "hot"));

    let written = writer
        .write(DataType::Trade, vec![trade_record("t1"), trade_record("t2")])
        .await
        .unwrap();

    assert_eq!(written, 2);
    assert_eq!(writer.written_total(), 2);
    assert_eq!(writer.failed_batches_total(), 0);
}

#[tokio::test]
async fn transient_failure_is_retried_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;

    let client = StoreClient::new(&endpoint_for(&server)).unwrap();
    let pool = ConnectionPool::new(client, &PoolConfig::default());
    let retry = RetrySettings {
        max_retries: 3,
        base_delay_secs: 0,
        multiplier: 1,
        max_delay_secs: 1,
    };
    let writer = Arc::new(TierWriter::new(pool, retry, "hot"));

    let written = writer.write(DataType::Trade, vec![trade_record("t1")]).await.unwrap();

    assert_eq!(written, 1);
    assert_eq!(writer.retries_total(), 1);
}

#[tokio::test]
async fn enqueue_triggers_flush_once_batch_size_reached() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&server)
        .await;

    let client = StoreClient::new(&endpoint_for(&server)).unwrap();
    let pool = ConnectionPool::new(client, &PoolConfig::default());
    let writer = Arc::new(TierWriter::new(pool, RetrySettings::default(), "hot"));
    let queue = BatchQueueManager::new(writer.clone());

    // LSR records batch at size 1, so a single enqueue should flush promptly.
    let record = Record {
        envelope: Envelope {
            exchange: "okx".into(),
            market_type: MarketType::Perpetual,
            symbol: "BTC-PERP".into(),
            timestamp: Utc::now(),
        },
        payload: Payload::LsrTopPosition(marketprism_storage::model::LsrRecord {
            long_account_ratio: Decimal::new(6, 1),
            short_account_ratio: Decimal::new(4, 1),
            long_short_ratio: Decimal::new(15, 1),
        }),
        enqueued_at: Utc::now(),
    };

    queue.enqueue(record).await;

    for _ in 0..20 {
        if queue.queue_depth(DataType::LsrTopPosition) == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    assert_eq!(queue.queue_depth(DataType::LsrTopPosition), 0);
    assert_eq!(writer.written_total(), 1);
}
