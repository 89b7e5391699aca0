// # Chargeback Operator
//
// Main entry point. Initializes structured logging, loads configuration
// from the environment, wires the external clients, and runs the operator
// until interrupted.

use std::sync::Arc;

use async_trait::async_trait;
use chargeback::clients::hive::{HiveConnection, HiveConnectionFactory};
use chargeback::clients::presto::{HttpPrestoConnection, HttpPrestoConnectionFactory, PrestoConnection};
use chargeback::clients::PrometheusClient;
use chargeback::clock::SystemClock;
use chargeback::operator::{Operator, OperatorDeps};
use chargeback::{OperatorConfig, Result, VERSION};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    info!("starting chargeback operator");
    info!("version: {}", VERSION);

    let config = OperatorConfig::from_env();
    info!(
        namespace = %config.namespace,
        hive = %config.hive_host,
        presto = %config.presto_host,
        prometheus = %config.prometheus_host,
        promsum = !config.disable_promsum,
        "configuration loaded"
    );

    let presto_url = normalize_url(&config.presto_host);
    let deps = OperatorDeps {
        hive_factory: Arc::new(StatementHiveFactory::new(presto_url.clone())),
        presto_factory: Arc::new(HttpPrestoConnectionFactory::new(presto_url)),
        prom: Arc::new(PrometheusClient::new(normalize_url(&config.prometheus_host))),
        clock: Arc::new(SystemClock),
    };

    let operator = Arc::new(Operator::new(config, deps));

    let signal_target = Arc::clone(&operator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, beginning shutdown");
            signal_target.shutdown();
        }
    });

    if let Err(err) = operator.run().await {
        error!(%err, "operator exited with error");
        return Err(err);
    }
    Ok(())
}

fn normalize_url(host: &str) -> String {
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{host}")
    }
}

/// Hive DDL routed through the coordinator's statement API. The thrift
/// driver is an external collaborator; deployments carrying one implement
/// `HiveConnectionFactory` against it instead.
struct StatementHiveSession {
    conn: HttpPrestoConnection,
}

#[async_trait]
impl HiveConnection for StatementHiveSession {
    async fn execute(&mut self, sql: &str) -> chargeback::Result<()> {
        self.conn.query(sql).await.map(|_| ())
    }

    async fn close(&mut self) {}
}

struct StatementHiveFactory {
    base_url: String,
}

impl StatementHiveFactory {
    fn new(base_url: String) -> Self {
        Self { base_url }
    }
}

#[async_trait]
impl HiveConnectionFactory for StatementHiveFactory {
    async fn connect(&self) -> chargeback::Result<Box<dyn HiveConnection>> {
        Ok(Box::new(StatementHiveSession {
            conn: HttpPrestoConnection::new(self.base_url.clone()),
        }))
    }
}
