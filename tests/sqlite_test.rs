//! End-to-end tests on a real SQLite file with the built-in drivers and
//! schema service.

mod common;

use chat_db_orchestrator::config::ManagerConfig;
use chat_db_orchestrator::error::ErrorCode;
use chat_db_orchestrator::manager::Manager;
use chat_db_orchestrator::models::{ConnectionConfig, ExecuteQueryRequest};
use chat_db_orchestrator::stream::{BroadcastStreamHandler, StreamMessage};
use common::{next_message, quiet_config};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

/// Counts far enough that it outlives every deadline used here. SQLite
/// cannot interrupt it, so its connection stays busy until it finishes.
const RUNAWAY: &str = "WITH RECURSIVE c(x) AS (SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 50000000) SELECT count(*) FROM c";
const WAIT: Duration = Duration::from_secs(5);

fn bounded_config() -> ManagerConfig {
    let mut config = quiet_config();
    config.rollback_timeout = Duration::from_millis(200);
    config.close_timeout = Duration::from_millis(300);
    config
}

async fn wait_until_executing(manager: &Manager, stream_id: &str) {
    let started = tokio::time::timeout(WAIT, async {
        while !manager.is_executing(stream_id) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_ok!(started);
}

struct Fixture {
    manager: Manager,
    stream: Arc<BroadcastStreamHandler>,
    config: ConnectionConfig,
    _dir: TempDir,
}

fn fixture(config: ManagerConfig) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chat.db");
    let stream = Arc::new(BroadcastStreamHandler::new(256));
    let manager = Manager::with_defaults(config, 100, stream.clone());
    Fixture {
        manager,
        stream,
        config: ConnectionConfig::sqlite(path.to_string_lossy().to_string()),
        _dir: dir,
    }
}

async fn run(manager: &Manager, query: &str) -> chat_db_orchestrator::models::QueryExecutionResult {
    manager
        .execute_query(ExecuteQueryRequest::new("chat", "s", query))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_create_insert_select() {
    let f = fixture(quiet_config());
    f.manager
        .connect("chat", "u", "s", f.config.clone())
        .await
        .unwrap();

    assert!(run(&f.manager, "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL)").await.is_success());
    let inserted = run(&f.manager, "INSERT INTO items (name) VALUES ('a'), ('b'), ('c')").await;
    assert_eq!(inserted.result.unwrap().rows_affected, Some(3));

    let selected = f
        .manager
        .execute_query(
            ExecuteQueryRequest::new("chat", "s", "SELECT id, name FROM items ORDER BY id")
                .with_find_count(),
        )
        .await
        .unwrap();
    let result = selected.result.unwrap();
    assert_eq!(result.columns, vec!["id", "name"]);
    assert_eq!(result.rows.len(), 3);
    assert_eq!(result.rows[1]["name"], "b");
    assert_eq!(result.count, Some(3));

    f.manager.stop().await;
}

#[tokio::test]
async fn test_dry_run_is_not_persisted() {
    let f = fixture(quiet_config());
    f.manager
        .connect("chat", "u", "s", f.config.clone())
        .await
        .unwrap();
    run(&f.manager, "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT)").await;

    let dry = f
        .manager
        .execute_query(
            ExecuteQueryRequest::new("chat", "s", "INSERT INTO items (name) VALUES ('ghost')")
                .dry_run(),
        )
        .await
        .unwrap();
    assert!(dry.is_success());
    assert_eq!(dry.result.unwrap().rows_affected, Some(1));

    let count = run(&f.manager, "SELECT COUNT(*) AS n FROM items").await;
    assert_eq!(count.result.unwrap().rows[0]["n"], 0);

    f.manager.stop().await;
}

#[tokio::test]
async fn test_statement_failure_is_reported_in_result() {
    let f = fixture(quiet_config());
    f.manager
        .connect("chat", "u", "s", f.config.clone())
        .await
        .unwrap();

    let outcome = run(&f.manager, "SELECT * FROM missing_table").await;
    assert!(!outcome.is_success());
    assert_eq!(outcome.error_code(), Some(ErrorCode::ExecutionError));
    assert!(f.manager.active_executions().is_empty());

    assert!(run(&f.manager, "SELECT 1 AS one").await.is_success());
    f.manager.stop().await;
}

#[tokio::test]
async fn test_create_table_pushes_schema_change() {
    let mut config = quiet_config();
    config.schema_settle_delay = Duration::from_millis(10);
    config.schema_recheck_delay = Duration::from_millis(20);
    let f = fixture(config);
    let mut rx = f.stream.subscribe();

    f.manager
        .connect("chat", "u", "s", f.config.clone())
        .await
        .unwrap();
    // Let the first check cache the empty schema.
    tokio::time::sleep(Duration::from_millis(150)).await;

    run(&f.manager, "CREATE TABLE orders (id INTEGER PRIMARY KEY, total REAL)").await;

    let message = next_message(&mut rx, Duration::from_secs(5), |m| {
        matches!(m, StreamMessage::SchemaChange { .. })
    })
    .await;
    let Some(StreamMessage::SchemaChange { diff, stream_id, .. }) = message else {
        panic!("no schema change pushed");
    };
    assert_eq!(stream_id, "s");
    assert_eq!(diff.added_tables.len(), 1);
    assert_eq!(diff.added_tables[0].name, "orders");

    f.manager.stop().await;
}

#[tokio::test]
async fn test_two_chats_share_one_sqlite_pool() {
    let f = fixture(quiet_config());
    let first = f
        .manager
        .connect("chat", "u", "s1", f.config.clone())
        .await
        .unwrap();
    let second = f
        .manager
        .connect("other", "u", "s2", f.config.clone())
        .await
        .unwrap();

    assert!(second.shared_pool);
    assert_eq!(f.manager.pool_count().await, 1);
    assert_eq!(f.manager.pool_ref_count(&first.fingerprint).await, Some(2));

    run(&f.manager, "CREATE TABLE notes (body TEXT)").await;
    f.manager
        .execute_query(ExecuteQueryRequest::new("other", "s2", "INSERT INTO notes VALUES ('hi')"))
        .await
        .unwrap();
    let read = run(&f.manager, "SELECT body FROM notes").await;
    assert_eq!(read.result.unwrap().rows[0]["body"], "hi");

    assert!(f.manager.is_connected("chat").await);
    f.manager.stop().await;
}

#[tokio::test]
async fn test_read_only_open_does_not_adopt_writable_pool() {
    let f = fixture(quiet_config());
    let writable = f
        .manager
        .connect("a", "u", "s1", f.config.clone())
        .await
        .unwrap();

    let read_only = f.config.clone().with_option("mode", "ro");
    assert_eq!(read_only.fingerprint(), writable.fingerprint);
    let err = f
        .manager
        .connect("b", "u", "s2", read_only)
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::ConnectionError);
    assert_eq!(f.manager.pool_ref_count(&writable.fingerprint).await, Some(1));
    assert!(f.manager.get_connection("b").await.is_err());
    f.manager.stop().await;
}

#[tokio::test]
async fn test_runaway_statement_times_out_without_waiting_for_it() {
    let f = fixture(bounded_config());
    f.manager
        .connect("chat", "u", "s", f.config.clone())
        .await
        .unwrap();

    let started = Instant::now();
    let err = f
        .manager
        .execute_query(ExecuteQueryRequest::new("chat", "s", RUNAWAY).with_timeout_ms(300))
        .await
        .unwrap_err();

    assert_eq!(err.code(), ErrorCode::QueryExecutionTimedOut);
    assert!(started.elapsed() < Duration::from_secs(3), "took {:?}", started.elapsed());
    assert!(f.manager.active_executions().is_empty());
    assert!(!f.manager.is_executing("s"));

    assert_ok!(tokio::time::timeout(WAIT, f.manager.stop()).await);
    assert_eq!(f.manager.pool_count().await, 0);
}

#[tokio::test]
async fn test_runaway_statement_cancel_returns_promptly() {
    let f = fixture(bounded_config());
    f.manager
        .connect("chat", "u", "s", f.config.clone())
        .await
        .unwrap();

    let running = {
        let manager = f.manager.clone();
        tokio::spawn(async move {
            manager
                .execute_query(ExecuteQueryRequest::new("chat", "s", RUNAWAY))
                .await
        })
    };
    wait_until_executing(&f.manager, "s").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    f.manager.cancel_query_execution("s");
    let joined = tokio::time::timeout(WAIT, running)
        .await
        .expect("cancelled query never returned");
    let err = assert_err!(joined.unwrap());

    assert_eq!(err.code(), ErrorCode::QueryExecutionCancelled);
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    assert!(f.manager.active_executions().is_empty());

    assert_ok!(tokio::time::timeout(WAIT, f.manager.stop()).await);
}

#[tokio::test]
async fn test_stop_is_bounded_with_runaway_statement() {
    let f = fixture(bounded_config());
    f.manager.start();
    f.manager
        .connect("chat", "u", "s", f.config.clone())
        .await
        .unwrap();

    let running = {
        let manager = f.manager.clone();
        tokio::spawn(async move {
            manager
                .execute_query(ExecuteQueryRequest::new("chat", "s", RUNAWAY))
                .await
        })
    };
    wait_until_executing(&f.manager, "s").await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_ok!(tokio::time::timeout(WAIT, f.manager.stop()).await);
    assert_eq!(f.manager.pool_count().await, 0);
    assert!(f.manager.list_sessions().await.is_empty());

    let joined = tokio::time::timeout(WAIT, running)
        .await
        .expect("query outlived shutdown");
    let err = assert_err!(joined.unwrap());
    assert_eq!(err.code(), ErrorCode::QueryExecutionCancelled);
}

#[tokio::test]
async fn test_postgres_when_configured() {
    let Ok(url) = std::env::var("TEST_POSTGRES_URL") else {
        return;
    };
    let f = fixture(quiet_config());
    let config = ConnectionConfig::from_url(&url).unwrap();
    f.manager.connect("chat", "u", "s", config).await.unwrap();

    let outcome = run(&f.manager, "SELECT 1 AS one").await;
    assert!(outcome.is_success());
    f.manager.stop().await;
}

#[tokio::test]
async fn test_postgres_timeout_interrupts_statement_when_configured() {
    let Ok(url) = std::env::var("TEST_POSTGRES_URL") else {
        return;
    };
    let f = fixture(bounded_config());
    let config = ConnectionConfig::from_url(&url).unwrap();
    f.manager.connect("chat", "u", "s", config).await.unwrap();

    let err = f
        .manager
        .execute_query(ExecuteQueryRequest::new("chat", "s", "SELECT pg_sleep(30)").with_timeout_ms(300))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::QueryExecutionTimedOut);

    // The interrupted backend is free again well before pg_sleep would end.
    let started = Instant::now();
    assert!(run(&f.manager, "SELECT 1 AS one").await.is_success());
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_ok!(tokio::time::timeout(WAIT, f.manager.stop()).await);
}
