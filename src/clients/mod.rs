// # Data-Plane Clients
//
// Query clients for the external data plane: Hive (DDL over a single
// reconnecting session), Presto (row-returning SQL), and Prometheus (range
// queries). Connection acquisition at startup shares one retry discipline:
// fixed 15 s backoff under a 3 minute ceiling, aborted promptly by the
// shutdown signal.

pub mod hive;
pub mod presto;
pub mod prometheus;

pub use hive::{HiveClient, HiveConnection, HiveConnectionFactory};
pub use presto::{PrestoClient, PrestoConnection, PrestoConnectionFactory, Row};
pub use prometheus::{PromQuerier, PromSample, PrometheusClient};

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{MeteringError, Result};

/// Fixed delay between connection attempts at startup.
pub const STARTUP_BACKOFF: Duration = Duration::from_secs(15);
/// Overall ceiling on startup connection waits before surfacing failure.
pub const STARTUP_CEILING: Duration = Duration::from_secs(180);

/// Conditional SQL echoing. Flags are immutable for the life of a client.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryLogger {
    log_ddl: bool,
    log_dml: bool,
}

impl QueryLogger {
    pub fn new(log_ddl: bool, log_dml: bool) -> Self {
        Self { log_ddl, log_dml }
    }

    pub fn ddl(&self, sql: &str) {
        if self.log_ddl {
            info!(%sql, "executing DDL");
        } else {
            debug!("executing DDL");
        }
    }

    pub fn dml(&self, sql: &str) {
        if self.log_dml {
            info!(%sql, "executing DML");
        } else {
            debug!("executing DML");
        }
    }
}

/// Retry `connect` every [`STARTUP_BACKOFF`] until it succeeds, the
/// [`STARTUP_CEILING`] elapses, or the stop signal fires.
pub(crate) async fn wait_for_connection<T, F, Fut>(
    target: &str,
    stop: &watch::Receiver<bool>,
    mut connect: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut stop = stop.clone();
    if *stop.borrow() {
        return Err(MeteringError::Shutdown);
    }

    let deadline = tokio::time::Instant::now() + STARTUP_CEILING;
    loop {
        match connect().await {
            Ok(conn) => {
                info!(endpoint = target, "connection established");
                return Ok(conn);
            }
            Err(err) => {
                warn!(endpoint = target, %err, "connection attempt failed");
            }
        }

        if tokio::time::Instant::now() + STARTUP_BACKOFF > deadline {
            return Err(MeteringError::Connect(format!(
                "gave up connecting to {target} after {}s",
                STARTUP_CEILING.as_secs()
            )));
        }

        tokio::select! {
            _ = tokio::time::sleep(STARTUP_BACKOFF) => {}
            _ = stop.changed() => return Err(MeteringError::Shutdown),
        }
    }
}
