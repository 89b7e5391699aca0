// # Hive Query Client
//
// Single-session DDL executor. The client holds one lazily-opened connection
// behind a mutex; callers serialize. End-of-stream and broken-pipe failures
// close the session and retry the same statement on a fresh connection, up
// to three attempts total. Other errors propagate without touching the
// connection.

use std::io::ErrorKind;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::warn;

use super::{wait_for_connection, QueryLogger};
use crate::error::{MeteringError, Result};
use crate::resources::Column;

/// One open Hive session.
#[async_trait]
pub trait HiveConnection: Send {
    async fn execute(&mut self, sql: &str) -> Result<()>;

    /// Tear the session down. Errors during close are ignored upstream.
    async fn close(&mut self);
}

/// Opens Hive sessions. Injected so tests can supply scripted connections.
#[async_trait]
pub trait HiveConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn HiveConnection>>;
}

pub struct HiveClient {
    factory: Arc<dyn HiveConnectionFactory>,
    conn: Mutex<Option<Box<dyn HiveConnection>>>,
    logger: QueryLogger,
    stop: watch::Receiver<bool>,
}

const QUERY_ATTEMPTS: u32 = 3;

impl HiveClient {
    pub fn new(
        factory: Arc<dyn HiveConnectionFactory>,
        logger: QueryLogger,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            factory,
            conn: Mutex::new(None),
            logger,
            stop,
        }
    }

    /// Open the initial connection eagerly, honoring the startup backoff
    /// discipline. `query` would otherwise open it on first use.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        Ok(())
    }

    /// Execute a statement, reconnecting on a dead session.
    pub async fn query(&self, sql: &str) -> Result<()> {
        let mut guard = self.conn.lock().await;

        for attempt in 1..=QUERY_ATTEMPTS {
            if guard.is_none() {
                *guard = Some(self.open().await?);
            }
            let conn = guard
                .as_mut()
                .ok_or_else(|| MeteringError::Internal("hive connection missing".into()))?;

            self.logger.ddl(sql);
            match conn.execute(sql).await {
                Ok(()) => return Ok(()),
                Err(err) if is_pipe_failure(&err) => {
                    warn!(%err, attempt, "hive session died, reconnecting");
                    if let Some(mut dead) = guard.take() {
                        dead.close().await;
                    }
                    if attempt == QUERY_ATTEMPTS {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(MeteringError::Internal("hive retry loop exhausted".into()))
    }

    pub async fn close(&self) {
        if let Some(mut conn) = self.conn.lock().await.take() {
            conn.close().await;
        }
    }

    async fn open(&self) -> Result<Box<dyn HiveConnection>> {
        let factory = Arc::clone(&self.factory);
        wait_for_connection("hive", &self.stop, || {
            let factory = Arc::clone(&factory);
            async move { factory.connect().await }
        })
        .await
    }
}

/// A dead session shows up as end-of-stream or a broken pipe.
fn is_pipe_failure(err: &MeteringError) -> bool {
    match err {
        MeteringError::BrokenPipe(_) => true,
        MeteringError::Io(io) => matches!(
            io.kind(),
            ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof | ErrorKind::ConnectionReset
        ),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// DDL builders
// ---------------------------------------------------------------------------

/// `CREATE EXTERNAL TABLE ... STORED AS PARQUET LOCATION ...` with optional
/// string-typed partition columns.
pub fn create_external_table_ddl(
    table: &str,
    columns: &[Column],
    partitions: &[Column],
    location: &str,
) -> String {
    let mut ddl = format!(
        "CREATE EXTERNAL TABLE IF NOT EXISTS {} ({})",
        table,
        column_list(columns)
    );
    if !partitions.is_empty() {
        ddl.push_str(&format!(" PARTITIONED BY ({})", column_list(partitions)));
    }
    ddl.push_str(&format!(" STORED AS PARQUET LOCATION '{location}'"));
    ddl
}

/// Plain managed table, used for report output tables.
pub fn create_table_ddl(table: &str, columns: &[Column]) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS {} ({})",
        table,
        column_list(columns)
    )
}

/// `ALTER TABLE ... ADD IF NOT EXISTS PARTITION (...)`. Partition values are
/// string-typed `YYYYMMDD`.
pub fn add_partition_ddl(table: &str, partition: &[(String, String)], location: &str) -> String {
    let spec = partition
        .iter()
        .map(|(name, value)| format!("`{name}`='{value}'"))
        .collect::<Vec<_>>()
        .join(", ");
    format!("ALTER TABLE {table} ADD IF NOT EXISTS PARTITION ({spec}) LOCATION '{location}'")
}

pub fn drop_table_ddl(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {table}")
}

fn column_list(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| format!("`{}` {}", c.name, c.data_type))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_table_ddl() {
        let columns = vec![
            Column::new("amount", "double"),
            Column::new("labels", "map<string,string>"),
        ];
        let partitions = vec![
            Column::new("billing_period_start", "string"),
            Column::new("billing_period_end", "string"),
        ];
        let ddl = create_external_table_ddl(
            "hive.metering.datasource_cpu",
            &columns,
            &partitions,
            "hdfs://hdfs-namenode:9820/metering/cpu",
        );
        assert_eq!(
            ddl,
            "CREATE EXTERNAL TABLE IF NOT EXISTS hive.metering.datasource_cpu \
             (`amount` double, `labels` map<string,string>) \
             PARTITIONED BY (`billing_period_start` string, `billing_period_end` string) \
             STORED AS PARQUET LOCATION 'hdfs://hdfs-namenode:9820/metering/cpu'"
        );
    }

    #[test]
    fn test_add_partition_ddl() {
        let ddl = add_partition_ddl(
            "datasource_cpu",
            &[
                ("billing_period_start".to_string(), "20190101".to_string()),
                ("billing_period_end".to_string(), "20190201".to_string()),
            ],
            "hdfs://hdfs-namenode:9820/metering/cpu/20190101_20190201",
        );
        assert_eq!(
            ddl,
            "ALTER TABLE datasource_cpu ADD IF NOT EXISTS PARTITION \
             (`billing_period_start`='20190101', `billing_period_end`='20190201') \
             LOCATION 'hdfs://hdfs-namenode:9820/metering/cpu/20190101_20190201'"
        );
    }

    #[test]
    fn test_pipe_failure_classification() {
        assert!(is_pipe_failure(&MeteringError::BrokenPipe("eof".into())));
        assert!(is_pipe_failure(&MeteringError::Io(std::io::Error::new(
            ErrorKind::UnexpectedEof,
            "eof"
        ))));
        assert!(!is_pipe_failure(&MeteringError::Query("syntax".into())));
    }
}
