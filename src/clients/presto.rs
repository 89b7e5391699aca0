// # Presto Query Client
//
// Row-returning SQL executor. Unlike the Hive session there is no
// reconnect-on-pipe logic here; the driver pools connections internally.
// The client may be called concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::{wait_for_connection, QueryLogger};
use crate::error::{MeteringError, Result};

/// A result row: dynamically typed column map.
pub type Row = HashMap<String, serde_json::Value>;

/// One Presto endpoint. Injected so tests can supply recording fakes.
#[async_trait]
pub trait PrestoConnection: Send + Sync {
    async fn query(&self, sql: &str) -> Result<Vec<Row>>;
}

#[async_trait]
pub trait PrestoConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn PrestoConnection>>;
}

pub struct PrestoClient {
    conn: Arc<dyn PrestoConnection>,
    logger: QueryLogger,
}

impl PrestoClient {
    /// Acquire a connection under the startup backoff discipline.
    pub async fn connect(
        factory: Arc<dyn PrestoConnectionFactory>,
        logger: QueryLogger,
        stop: &watch::Receiver<bool>,
    ) -> Result<Self> {
        let conn = wait_for_connection("presto", stop, || {
            let factory = Arc::clone(&factory);
            async move { factory.connect().await }
        })
        .await?;
        Ok(Self { conn, logger })
    }

    /// Wrap an already-open connection. Used by tests and by the scheduled
    /// runner, which shares the orchestrator's connection.
    pub fn from_connection(conn: Arc<dyn PrestoConnection>, logger: QueryLogger) -> Self {
        Self { conn, logger }
    }

    /// Execute a row-returning statement (DML gate).
    pub async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.logger.dml(sql);
        self.conn.query(sql).await
    }

    /// Execute a statement for effect only (DDL gate).
    pub async fn execute(&self, sql: &str) -> Result<()> {
        self.logger.ddl(sql);
        self.conn.query(sql).await.map(|_| ())
    }

    /// Write-readiness probe: Hive may have accepted catalog registration
    /// while Presto still cannot plan writes against it. Poll a trivial
    /// create/drop cycle until it succeeds.
    pub async fn wait_until_writable(&self, stop: &watch::Receiver<bool>) -> Result<()> {
        const PROBE_INTERVAL: Duration = Duration::from_secs(5);
        const PROBE_TABLE: &str = "chargeback_write_probe";

        let mut stop = stop.clone();
        if *stop.borrow() {
            return Err(MeteringError::Shutdown);
        }

        loop {
            let probe = async {
                self.execute(&format!("CREATE TABLE IF NOT EXISTS {PROBE_TABLE} (probe bigint)"))
                    .await?;
                self.execute(&format!("DROP TABLE IF EXISTS {PROBE_TABLE}")).await
            };
            match probe.await {
                Ok(()) => {
                    debug!("presto accepts writes");
                    return Ok(());
                }
                Err(err) => warn!(%err, "presto not yet writable"),
            }

            tokio::select! {
                _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                _ = stop.changed() => return Err(MeteringError::Shutdown),
            }
        }
    }
}

/// Presto timestamp literal: `timestamp 'YYYY-MM-DD HH:MM:SS.mmm'`.
pub fn timestamp_literal(t: chrono::DateTime<chrono::Utc>) -> String {
    format!("timestamp '{}'", t.format("%Y-%m-%d %H:%M:%S%.3f"))
}

// ---------------------------------------------------------------------------
// HTTP statement protocol
// ---------------------------------------------------------------------------

/// Connection over the coordinator's v1 statement API. The full SQL driver
/// is an external concern; this speaks just enough of the protocol for
/// DDL/DML and row fetches: POST the statement, then follow `nextUri` until
/// the result set is exhausted.
pub struct HttpPrestoConnection {
    http: reqwest::Client,
    base_url: String,
    user: String,
    catalog: String,
    schema: String,
}

impl HttpPrestoConnection {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            user: "chargeback".to_string(),
            catalog: "hive".to_string(),
            schema: "default".to_string(),
        }
    }
}

#[derive(serde::Deserialize)]
struct StatementResponse {
    #[serde(rename = "nextUri")]
    next_uri: Option<String>,
    columns: Option<Vec<StatementColumn>>,
    data: Option<Vec<Vec<serde_json::Value>>>,
    error: Option<StatementError>,
}

#[derive(serde::Deserialize)]
struct StatementColumn {
    name: String,
}

#[derive(serde::Deserialize)]
struct StatementError {
    message: String,
}

#[async_trait]
impl PrestoConnection for HttpPrestoConnection {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        let mut response: StatementResponse = self
            .http
            .post(format!("{}/v1/statement", self.base_url))
            .header("X-Presto-User", &self.user)
            .header("X-Presto-Catalog", &self.catalog)
            .header("X-Presto-Schema", &self.schema)
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| MeteringError::Connect(format!("presto statement failed: {e}")))?
            .json()
            .await
            .map_err(|e| MeteringError::Query(format!("malformed presto response: {e}")))?;

        let mut columns: Vec<String> = Vec::new();
        let mut rows: Vec<Row> = Vec::new();
        loop {
            if let Some(error) = response.error {
                return Err(MeteringError::Query(error.message));
            }
            if let Some(cols) = response.columns.take() {
                columns = cols.into_iter().map(|c| c.name).collect();
            }
            if let Some(data) = response.data.take() {
                for values in data {
                    rows.push(columns.iter().cloned().zip(values).collect());
                }
            }
            let Some(uri) = response.next_uri.take() else {
                break;
            };
            response = self
                .http
                .get(uri)
                .header("X-Presto-User", &self.user)
                .send()
                .await
                .map_err(|e| MeteringError::Connect(format!("presto fetch failed: {e}")))?
                .json()
                .await
                .map_err(|e| MeteringError::Query(format!("malformed presto response: {e}")))?;
        }
        Ok(rows)
    }
}

pub struct HttpPrestoConnectionFactory {
    base_url: String,
}

impl HttpPrestoConnectionFactory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl PrestoConnectionFactory for HttpPrestoConnectionFactory {
    async fn connect(&self) -> Result<Arc<dyn PrestoConnection>> {
        let conn = Arc::new(HttpPrestoConnection::new(self.base_url.clone()));
        // A trivial round trip verifies the coordinator answers queries.
        conn.query("SELECT 1").await?;
        Ok(conn)
    }
}
