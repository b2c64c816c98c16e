//! End-to-end exercise of the migration engine's task discovery, and its
//! copy -> verify -> drop pipeline, against a mocked columnar store
//! boundary.

use marketprism_storage::config::{MigrationConfig, StoreEndpoint};
use marketprism_storage::migration::{MigrationEngine, TaskOutcome};
use marketprism_storage::store::StoreClient;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

/// Matches when the POST body (the rendered SQL statement) contains `needle`
/// — used to route the mocked store's single HTTP endpoint to a different
/// canned response depending on which query the engine issued, since the
/// store has no per-statement routes of its own.
struct BodyContains(&'static str);

impl wiremock::Match for BodyContains {
    fn matches(&self, request: &Request) -> bool {
        String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

struct BodyNotContains(&'static str);

impl wiremock::Match for BodyNotContains {
    fn matches(&self, request: &Request) -> bool {
        !String::from_utf8_lossy(&request.body).contains(self.0)
    }
}

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

#[tokio::test]
async fn empty_catalog_yields_an_empty_cycle_report() {
    let hot_server = MockServer::start().await;
    let cold_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&hot_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&cold_server)
        .await;

    let hot = StoreClient::new(&endpoint_for(&hot_server)).unwrap();
    let cold = StoreClient::new(&endpoint_for(&cold_server)).unwrap();
    let engine = MigrationEngine::new(hot, cold, MigrationConfig::default());

    let report = engine.run_cycle().await;

    assert_eq!(report.total_tasks, 0);
    assert_eq!(report.successful, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.records_migrated, 0);
    assert!(report.results.is_empty());
}

#[tokio::test]
async fn catalog_query_failure_is_skipped_not_fatal() {
    let hot_server = MockServer::start().await;
    let cold_server = MockServer::start().await;

    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("internal error"))
        .mount(&hot_server)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&cold_server)
        .await;

    let hot = StoreClient::new(&endpoint_for(&hot_server)).unwrap();
    let cold = StoreClient::new(&endpoint_for(&cold_server)).unwrap();
    let engine = MigrationEngine::new(hot, cold, MigrationConfig::default());

    // Discovery failures on every data type degrade to an empty task list
    // rather than propagating an error out of run_cycle.
    let report = engine.run_cycle().await;

    assert_eq!(report.total_tasks, 0);
}

/// Mounts the discovery response for every data type other than `trade`
/// (an empty catalog) plus a one-partition discovery response for `trade`,
/// so `run_cycle` has exactly one task to execute.
async fn mount_single_trade_partition_discovery(hot_server: &MockServer) {
    Mock::given(method("POST"))
        .and(BodyContains("system.parts_catalog"))
        .and(BodyContains("table = 'hot_trade'"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"partition":"p1","max_time":"2025-01-01T00:00:00Z","rows":2,"bytes":1024}"#,
        ))
        .mount(hot_server)
        .await;

    Mock::given(method("POST"))
        .and(BodyContains("system.parts_catalog"))
        .and(BodyNotContains("hot_trade"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(hot_server)
        .await;
}

fn trade_rows_body() -> &'static str {
    "{\"exchange\":\"binance\",\"market_type\":\"spot\",\"symbol\":\"BTCUSDT\",\"timestamp\":\"2025-01-01T00:00:00Z\",\"trade_id\":\"t1\",\"price\":\"100\",\"quantity\":\"1\",\"side\":\"buy\"}\n\
     {\"exchange\":\"binance\",\"market_type\":\"spot\",\"symbol\":\"BTCUSDT\",\"timestamp\":\"2025-01-01T00:00:01Z\",\"trade_id\":\"t2\",\"price\":\"101\",\"quantity\":\"2\",\"side\":\"sell\"}"
}

#[tokio::test]
async fn migration_cycle_copies_verifies_and_drops_partition() {
    let hot_server = MockServer::start().await;
    let cold_server = MockServer::start().await;

    mount_single_trade_partition_discovery(&hot_server).await;

    // copy_partition's cursor page: two rows, fewer than batch_size, so the
    // read loop terminates after this single page.
    Mock::given(method("POST"))
        .and(BodyContains("SELECT *"))
        .and(BodyContains("FROM hot_trade WHERE partition = 'p1'"))
        .respond_with(ResponseTemplate::new(200).set_body_string(trade_rows_body()))
        .mount(&hot_server)
        .await;

    // verify(): hot side reports the same count the partition started with.
    Mock::given(method("POST"))
        .and(BodyContains("SELECT count() AS c FROM hot_trade WHERE partition = 'p1'"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"c":2}"#))
        .mount(&hot_server)
        .await;

    // drop_partition(): the only ALTER TABLE statement issued once
    // verification passes.
    Mock::given(method("POST"))
        .and(BodyContains("ALTER TABLE hot_trade DROP PARTITION 'p1'"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&hot_server)
        .await;

    // cold insert: accepts the copied page.
    Mock::given(method("POST"))
        .and(BodyContains("INSERT INTO cold_trade"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&cold_server)
        .await;

    // verify(): cold side reports parity.
    Mock::given(method("POST"))
        .and(BodyContains("SELECT count() AS c FROM cold_trade WHERE partition = 'p1'"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"c":2}"#))
        .mount(&cold_server)
        .await;

    let hot = StoreClient::new(&endpoint_for(&hot_server)).unwrap();
    let cold = StoreClient::new(&endpoint_for(&cold_server)).unwrap();
    let engine = MigrationEngine::new(hot, cold, MigrationConfig::default());

    let report = engine.run_cycle().await;

    assert_eq!(report.total_tasks, 1);
    assert_eq!(report.successful, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.records_migrated, 2);
    match &report.results[0].outcome {
        TaskOutcome::Migrated { records_migrated } => assert_eq!(*records_migrated, 2),
        other => panic!("expected Migrated, got {other:?}"),
    }
}

#[tokio::test]
async fn migration_cycle_detects_verification_mismatch_and_skips_drop() {
    let hot_server = MockServer::start().await;
    let cold_server = MockServer::start().await;

    mount_single_trade_partition_discovery(&hot_server).await;

    Mock::given(method("POST"))
        .and(BodyContains("SELECT *"))
        .and(BodyContains("FROM hot_trade WHERE partition = 'p1'"))
        .respond_with(ResponseTemplate::new(200).set_body_string(trade_rows_body()))
        .mount(&hot_server)
        .await;

    Mock::given(method("POST"))
        .and(BodyContains("SELECT count() AS c FROM hot_trade WHERE partition = 'p1'"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"c":2}"#))
        .mount(&hot_server)
        .await;

    Mock::given(method("POST"))
        .and(BodyContains("INSERT INTO cold_trade"))
        .respond_with(ResponseTemplate::new(200).set_body_string(""))
        .mount(&cold_server)
        .await;

    // cold side only sees 1 of the 2 rows land (simulated partial write) —
    // verification must catch this and must not drop the hot partition.
    Mock::given(method("POST"))
        .and(BodyContains("SELECT count() AS c FROM cold_trade WHERE partition = 'p1'"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"c":1}"#))
        .mount(&cold_server)
        .await;

    let hot = StoreClient::new(&endpoint_for(&hot_server)).unwrap();
    let cold = StoreClient::new(&endpoint_for(&cold_server)).unwrap();
    let engine = MigrationEngine::new(hot, cold, MigrationConfig::default());

    let report = engine.run_cycle().await;

    assert_eq!(report.total_tasks, 1);
    assert_eq!(report.successful, 0);
    assert_eq!(report.failed, 1);
    assert_eq!(report.records_migrated, 0);
    match &report.results[0].outcome {
        TaskOutcome::VerificationMismatch { hot, cold } => {
            assert_eq!(*hot, 2);
            assert_eq!(*cold, 1);
        }
        other => panic!("expected VerificationMismatch, got {other:?}"),
    }
    // No ALTER TABLE ... DROP PARTITION mock was mounted on hot_server for
    // this test; if drop_partition were reached, classify_response would
    // surface an unmatched-request error and the task's outcome would not
    // be VerificationMismatch, so the match above already proves the drop
    // was skipped.
}
