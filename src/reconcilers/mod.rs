// # Reconciler Set
//
// Per-resource-kind sync handlers. A worker loop pops keys off a work
// queue, looks up the current resource, and drives external state toward
// the declared state. All reconcilers are idempotent: re-invocation with
// the same resource version is a no-op modulo status patches.
//
// Error policy: a retriable error requeues the key with exponential
// backoff until the requeue budget is spent, then the key is forgotten and
// the failure logged. Terminal errors are absorbed by the reconcilers
// themselves as `Failed` status patches.

mod datasource;
mod deps;
mod generation_query;
mod presto_table;
mod report;
mod scheduled_report;

pub use datasource::{promsum_schema, promsum_partitions, DataSourceReconciler};
pub use deps::{resolve_dependencies, ResolvedDependencies};
pub use generation_query::GenerationQueryReconciler;
pub use presto_table::PrestoTableReconciler;
pub use report::{ReportExecutor, ReportReconciler};
pub use scheduled_report::ScheduledReportReconciler;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::queue::WorkQueue;
use crate::resources::ResourceKind;

#[async_trait]
pub trait Reconciler: Send + Sync {
    fn kind(&self) -> ResourceKind;

    /// Drive the resource named by `key` toward its declared state.
    async fn sync(&self, key: &str) -> Result<()>;
}

/// Worker loop: pop, sync, settle. Exits when the queue shuts down.
pub async fn run_worker(queue: Arc<WorkQueue>, reconciler: Arc<dyn Reconciler>, max_requeues: u32) {
    while let Some(key) = queue.get().await {
        match reconciler.sync(&key).await {
            Ok(()) => queue.forget(&key),
            Err(err) if err.is_retriable() && queue.num_requeues(&key) < max_requeues => {
                warn!(kind = %reconciler.kind(), %key, %err, "sync failed, requeueing");
                queue.add_rate_limited(&key);
            }
            Err(err) => {
                error!(kind = %reconciler.kind(), %key, %err, "sync failed, dropping key");
                queue.forget(&key);
            }
        }
        queue.done(&key);
    }
    debug!(kind = %reconciler.kind(), "worker exiting");
}

/// A sync handler for kinds that carry no reconciliation work of their own
/// (ReportPrometheusQuery, StorageLocation). Keys are accepted and dropped.
pub struct NoopReconciler {
    kind: ResourceKind,
}

impl NoopReconciler {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Reconciler for NoopReconciler {
    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn sync(&self, key: &str) -> Result<()> {
        debug!(kind = %self.kind, key, "nothing to reconcile");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Identifier naming
// ---------------------------------------------------------------------------

/// Table backing a ReportDataSource.
pub fn datasource_table(namespace: &str, name: &str) -> String {
    format!("datasource_{}_{}", sanitize(namespace), sanitize(name))
}

/// Output table of a Report or ScheduledReport.
pub fn report_table(namespace: &str, name: &str) -> String {
    format!("report_{}_{}", sanitize(namespace), sanitize(name))
}

/// Presto view identifier of a materialized ReportGenerationQuery.
pub fn view_identifier(namespace: &str, name: &str) -> String {
    format!("view_{}_{}", sanitize(namespace), sanitize(name))
}

/// SQL identifiers cannot carry the dashes and dots resource names can.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_sanitization() {
        assert_eq!(
            datasource_table("metering", "node-cpu.usage"),
            "datasource_metering_node_cpu_usage"
        );
        assert_eq!(report_table("metering", "monthly"), "report_metering_monthly");
        assert_eq!(view_identifier("metering", "raw"), "view_metering_raw");
    }
}
