//! Integration tests for idle eviction and shutdown.

mod common;

use chat_db_orchestrator::liveness::{LivenessStore, connection_key};
use common::{Harness, pg_config, quiet_config};
use std::time::Duration;
use tokio_test::assert_ok;

fn short_idle(idle_ms: u64) -> Harness {
    let mut config = quiet_config();
    config.idle_timeout = Duration::from_millis(idle_ms);
    Harness::new(config)
}

#[tokio::test]
async fn test_idle_session_and_pool_are_reclaimed() {
    let h = short_idle(20);
    h.manager
        .connect("chat", "u", "s", pg_config("app"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = h.manager.evict_idle().await;

    assert_eq!(report.sessions, 1);
    assert_eq!(report.pools, 1);
    assert_eq!(h.stats.closes(), 1);
    assert!(h.manager.list_sessions().await.is_empty());
    assert!(h.liveness.get(&connection_key("chat")).await.is_none());
}

#[tokio::test]
async fn test_fresh_session_is_retained() {
    let h = Harness::quiet();
    h.manager
        .connect("chat", "u", "s", pg_config("app"))
        .await
        .unwrap();

    let report = h.manager.evict_idle().await;

    assert!(report.is_empty());
    assert_eq!(h.manager.pool_count().await, 1);
    assert_eq!(h.stats.closes(), 0);
}

#[tokio::test]
async fn test_referenced_pool_survives_sibling_eviction() {
    let h = short_idle(60);
    let info = h
        .manager
        .connect("idle-chat", "u", "s1", pg_config("app"))
        .await
        .unwrap();
    h.manager
        .connect("busy-chat", "u", "s2", pg_config("app"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(90)).await;
    h.manager.get_connection("busy-chat").await.unwrap();

    let report = h.manager.evict_idle().await;
    assert_eq!(report.sessions, 1);
    assert_eq!(report.pools, 0);
    assert_eq!(h.manager.pool_ref_count(&info.fingerprint).await, Some(1));
    assert_eq!(h.stats.closes(), 0);
    assert_ok!(h.manager.get_connection("busy-chat").await);
}

#[tokio::test]
async fn test_unreferenced_pool_waits_for_idle_threshold() {
    let h = short_idle(200);
    let info = h
        .manager
        .connect("chat", "u", "s", pg_config("app"))
        .await
        .unwrap();
    h.manager.disconnect("chat", "u", false).await.unwrap();

    let report = h.manager.evict_idle().await;
    assert_eq!(report.pools, 0);
    assert_eq!(h.manager.pool_ref_count(&info.fingerprint).await, Some(0));
}

#[tokio::test]
async fn test_background_loop_reclaims() {
    let mut config = quiet_config();
    config.idle_timeout = Duration::from_millis(10);
    config.cleanup_interval = Duration::from_millis(20);
    let h = Harness::new(config);
    h.manager.start();

    h.manager
        .connect("chat", "u", "s", pg_config("app"))
        .await
        .unwrap();

    let reclaimed = tokio::time::timeout(Duration::from_secs(2), async {
        while h.manager.pool_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert_ok!(reclaimed);
    assert_eq!(h.stats.closes(), 1);

    h.manager.stop().await;
}

#[tokio::test]
async fn test_stop_closes_each_pool_once() {
    let h = Harness::quiet();
    h.manager.start();
    for (chat, db) in [("a", "app"), ("b", "app"), ("c", "analytics")] {
        h.manager
            .connect(chat, "u", "s", pg_config(db))
            .await
            .unwrap();
    }

    h.manager.stop().await;
    assert_eq!(h.stats.closes(), 2);
    assert_eq!(h.manager.pool_count().await, 0);
    assert!(h.manager.list_sessions().await.is_empty());

    h.manager.stop().await;
    assert_eq!(h.stats.closes(), 2);
}
