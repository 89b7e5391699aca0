// # ReportGenerationQuery Reconciler
//
// Materializes queries as Presto views once their direct dependencies are
// satisfied. Views render with an empty report context: view bodies must
// not reference reporting-window inputs. Deleted queries have their views
// dropped so stale definitions cannot satisfy future dependency checks.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{view_identifier, Reconciler};
use crate::clients::PrestoClient;
use crate::error::{MeteringError, Result};
use crate::render::QueryRenderer;
use crate::resources::{split_key, ReportDataSource, ReportGenerationQuery, ResourceKind};
use crate::store::ResourceStore;

pub struct GenerationQueryReconciler {
    queries: Arc<ResourceStore<ReportGenerationQuery>>,
    datasources: Arc<ResourceStore<ReportDataSource>>,
    presto: Arc<PrestoClient>,
    renderer: Arc<QueryRenderer>,
}

impl GenerationQueryReconciler {
    pub fn new(
        queries: Arc<ResourceStore<ReportGenerationQuery>>,
        datasources: Arc<ResourceStore<ReportDataSource>>,
        presto: Arc<PrestoClient>,
        renderer: Arc<QueryRenderer>,
    ) -> Self {
        Self {
            queries,
            datasources,
            presto,
            renderer,
        }
    }

    /// Direct dependencies only; transitive readiness is enforced by the
    /// Report path before execution.
    fn check_dependencies(&self, query: &ReportGenerationQuery) -> Result<()> {
        let namespace = &query.metadata.namespace;
        for name in &query.spec.report_queries {
            let dep = self.queries.get(namespace, name).map_err(|_| {
                MeteringError::DependencyNotReady(format!("generation query {name} not found"))
            })?;
            if !dep.spec.view.disabled && !dep.view_materialized() {
                return Err(MeteringError::DependencyNotReady(format!(
                    "view for query {name} is not materialized"
                )));
            }
        }
        for name in &query.spec.report_data_sources {
            let dep = self.datasources.get(namespace, name).map_err(|_| {
                MeteringError::DependencyNotReady(format!("datasource {name} not found"))
            })?;
            if dep.status.table_name.is_none() {
                return Err(MeteringError::DependencyNotReady(format!(
                    "datasource {name} has no backing table"
                )));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for GenerationQueryReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ReportGenerationQuery
    }

    async fn sync(&self, key: &str) -> Result<()> {
        let (namespace, name) = split_key(key)?;
        let query = match self.queries.get_key(key) {
            Ok(query) => query,
            Err(_) => {
                // Deleted: drop the view so dependents fail fast instead of
                // reading a stale definition.
                let view = view_identifier(namespace, name);
                self.presto
                    .execute(&format!("DROP VIEW IF EXISTS {view}"))
                    .await?;
                info!(key, %view, "dropped view for deleted query");
                return Ok(());
            }
        };

        if query.spec.view.disabled || query.view_materialized() {
            return Ok(());
        }

        self.check_dependencies(&query)?;

        let view = view_identifier(namespace, name);
        let body = self.renderer.render_view(&query.spec.query)?;
        self.presto
            .execute(&format!("CREATE OR REPLACE VIEW {view} AS {body}"))
            .await?;

        self.queries.update(key, |q| {
            q.status.view_name = Some(view.clone());
        })?;
        info!(query = %query.metadata, %view, "materialized view");
        Ok(())
    }
}
