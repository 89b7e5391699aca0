// Hive client resilience: a session that dies with a broken pipe is
// replaced exactly once and the statement still lands.

mod common;

use std::sync::Arc;

use chargeback::clients::{HiveClient, HiveConnectionFactory, QueryLogger};
use common::ScriptedHiveFactory;
use tokio::sync::watch;

#[tokio::test]
async fn test_broken_pipe_reconnects_and_retries() {
    let factory = ScriptedHiveFactory::new();
    factory.fail_next_execute();
    let (_stop_tx, stop_rx) = watch::channel(false);

    let client = HiveClient::new(
        Arc::clone(&factory) as Arc<dyn HiveConnectionFactory>,
        QueryLogger::default(),
        stop_rx,
    );

    client
        .query("CREATE TABLE IF NOT EXISTS report_metering_r (`amount` double)")
        .await
        .expect("query should succeed after reconnect");

    assert_eq!(factory.connect_count(), 2, "exactly one reconnect");
    assert_eq!(
        factory.recorded(),
        vec!["CREATE TABLE IF NOT EXISTS report_metering_r (`amount` double)".to_string()],
        "statement executed once on the fresh session"
    );
}

#[tokio::test]
async fn test_healthy_session_is_reused() {
    let factory = ScriptedHiveFactory::new();
    let (_stop_tx, stop_rx) = watch::channel(false);
    let client = HiveClient::new(
        Arc::clone(&factory) as Arc<dyn HiveConnectionFactory>,
        QueryLogger::default(),
        stop_rx,
    );

    client.query("CREATE TABLE a (`x` double)").await.unwrap();
    client.query("CREATE TABLE b (`x` double)").await.unwrap();

    assert_eq!(factory.connect_count(), 1, "single session for both statements");
    assert_eq!(factory.recorded().len(), 2);
}
