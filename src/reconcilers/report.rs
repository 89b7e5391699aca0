// # Report Reconciler
//
// Drives the Report state machine:
//
// ```text
// Unset ──validate──▶ Pending ──deps ready, table created──▶ Started
// Started ──render + INSERT INTO──▶ Finished
// any ──terminal error──▶ Failed
// ```
//
// `Finished` and `Failed` are terminal; a finished report re-synced is a
// no-op, so no duplicate Presto writes are ever issued. The execution path
// itself lives in `ReportExecutor`, shared with the scheduled runner.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::{report_table, resolve_dependencies, Reconciler};
use crate::clients::hive::create_table_ddl;
use crate::clients::{HiveClient, PrestoClient};
use crate::error::{MeteringError, Result};
use crate::render::{resolve_inputs, QueryRenderer, ReportContext};
use crate::resources::{
    Metadata, PrestoTable, PrestoTableSpec, PrestoTableStatus, Report, ReportDataSource,
    ReportGenerationQuery, ReportPhase, ResourceKind,
};
use crate::store::ResourceStore;

/// Validation, dependency resolution, output-table creation, and insertion
/// for one report over one window. The Report reconciler walks these steps
/// one state transition at a time; the scheduled runner walks them
/// back-to-back per window.
pub struct ReportExecutor {
    queries: Arc<ResourceStore<ReportGenerationQuery>>,
    datasources: Arc<ResourceStore<ReportDataSource>>,
    presto_tables: Arc<ResourceStore<PrestoTable>>,
    presto: Arc<PrestoClient>,
    hive: Arc<HiveClient>,
    renderer: Arc<QueryRenderer>,
}

impl ReportExecutor {
    pub fn new(
        queries: Arc<ResourceStore<ReportGenerationQuery>>,
        datasources: Arc<ResourceStore<ReportDataSource>>,
        presto_tables: Arc<ResourceStore<PrestoTable>>,
        presto: Arc<PrestoClient>,
        hive: Arc<HiveClient>,
        renderer: Arc<QueryRenderer>,
    ) -> Self {
        Self {
            queries,
            datasources,
            presto_tables,
            presto,
            hive,
            renderer,
        }
    }

    /// Spec validation: the window must be well-formed and the query must
    /// resolve. Failures here are terminal.
    pub fn validate(&self, report: &Report) -> Result<Arc<ReportGenerationQuery>> {
        if !report.window_valid() {
            return Err(MeteringError::Validation(format!(
                "reporting window is empty: start {} is not before end {}",
                report.spec.reporting_start, report.spec.reporting_end
            )));
        }
        self.queries
            .get(&report.metadata.namespace, &report.spec.generation_query)
            .map_err(|_| {
                MeteringError::Validation(format!(
                    "unknown generation query: {}",
                    report.spec.generation_query
                ))
            })
    }

    /// The full transitive closure must be ready before execution.
    pub fn check_dependencies(&self, report: &Report, query: &ReportGenerationQuery) -> Result<()> {
        let resolved = resolve_dependencies(
            &self.queries,
            &self.datasources,
            &report.metadata.namespace,
            query,
        )?;
        resolved.ready()
    }

    /// Create the output table once, keyed off the recorded table name so
    /// restarts never re-issue the DDL.
    pub async fn ensure_output_table(
        &self,
        report: &Report,
        query: &ReportGenerationQuery,
    ) -> Result<String> {
        if let Some(table) = &report.status.table_name {
            return Ok(table.clone());
        }

        let table = report_table(&report.metadata.namespace, &report.metadata.name);
        let ddl = create_table_ddl(&table, &query.spec.columns);
        self.hive.query(&ddl).await?;

        self.presto_tables.apply(PrestoTable {
            metadata: Metadata::new(report.metadata.namespace.clone(), table.clone()),
            spec: PrestoTableSpec {
                table_name: table.clone(),
                columns: query.spec.columns.clone(),
                partitions: Vec::new(),
                storage_location: None,
                location: None,
            },
            status: PrestoTableStatus {
                columns: query.spec.columns.clone(),
            },
        });
        debug!(report = %report.metadata, %table, "created report output table");
        Ok(table)
    }

    /// Render the query over the report's window and insert into the output
    /// table.
    pub async fn execute(
        &self,
        report: &Report,
        query: &ReportGenerationQuery,
        table: &str,
    ) -> Result<()> {
        let inputs = resolve_inputs(&query.spec.inputs, &report.spec.inputs)?;
        let context = ReportContext::new(
            report.spec.reporting_start,
            report.spec.reporting_end,
            inputs,
        );
        let sql = self.renderer.render(&query.spec.query, &context)?;
        self.presto
            .query(&format!("INSERT INTO {table} {sql}"))
            .await?;
        Ok(())
    }
}

pub struct ReportReconciler {
    reports: Arc<ResourceStore<Report>>,
    executor: Arc<ReportExecutor>,
}

impl ReportReconciler {
    pub fn new(reports: Arc<ResourceStore<Report>>, executor: Arc<ReportExecutor>) -> Self {
        Self { reports, executor }
    }

    fn fail(&self, key: &str, err: &MeteringError) -> Result<()> {
        warn!(key, %err, "report failed terminally");
        self.reports.update(key, |r| {
            r.status.phase = ReportPhase::Failed;
            r.status.message = Some(err.to_string());
        })?;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for ReportReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::Report
    }

    async fn sync(&self, key: &str) -> Result<()> {
        let report = match self.reports.get_key(key) {
            Ok(report) => report,
            // Deleted; output tables are preserved.
            Err(_) => return Ok(()),
        };

        match report.status.phase {
            ReportPhase::Finished | ReportPhase::Failed => Ok(()),

            ReportPhase::Unset => match self.executor.validate(&report) {
                Ok(_) => {
                    self.reports.update(key, |r| {
                        r.status.phase = ReportPhase::Pending;
                    })?;
                    Ok(())
                }
                Err(err) if err.is_terminal() => self.fail(key, &err),
                Err(err) => Err(err),
            },

            ReportPhase::Pending => {
                let query = match self.executor.validate(&report) {
                    Ok(query) => query,
                    Err(err) if err.is_terminal() => return self.fail(key, &err),
                    Err(err) => return Err(err),
                };
                match self.executor.check_dependencies(&report, &query) {
                    Ok(()) => {}
                    Err(err) if err.is_terminal() => return self.fail(key, &err),
                    // Dependency not ready: requeue with backoff.
                    Err(err) => return Err(err),
                }
                let table = self.executor.ensure_output_table(&report, &query).await?;
                self.reports.update(key, |r| {
                    r.status.phase = ReportPhase::Started;
                    r.status.table_name = Some(table.clone());
                })?;
                info!(report = %report.metadata, %table, "report started");
                Ok(())
            }

            ReportPhase::Started => {
                let query = match self.executor.validate(&report) {
                    Ok(query) => query,
                    Err(err) if err.is_terminal() => return self.fail(key, &err),
                    Err(err) => return Err(err),
                };
                let table = report
                    .status
                    .table_name
                    .clone()
                    .ok_or_else(|| {
                        MeteringError::Internal(format!("started report {key} has no output table"))
                    })?;
                match self.executor.execute(&report, &query, &table).await {
                    Ok(()) => {
                        self.reports.update(key, |r| {
                            r.status.phase = ReportPhase::Finished;
                        })?;
                        info!(report = %report.metadata, "report finished");
                        Ok(())
                    }
                    Err(err) if err.is_terminal() => self.fail(key, &err),
                    Err(err) => Err(err),
                }
            }
        }
    }
}
