// # Dependency Resolution
//
// ReportGenerationQuery dependencies form a DAG by contract: `report_queries`
// edges read from materialized views, `dynamic_report_queries` edges are
// inlined at render time, and `report_data_sources` edges read from backing
// tables. Resolution walks the transitive closure depth-first with
// gray/black marking so cycles surface as a diagnostic naming the cycle
// instead of a hang.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{MeteringError, Result};
use crate::resources::{ReportDataSource, ReportGenerationQuery};
use crate::store::ResourceStore;

/// The transitive dependency closure of one generation query.
#[derive(Default, Debug)]
pub struct ResolvedDependencies {
    /// Queries that must be materialized as views before execution.
    pub views: Vec<Arc<ReportGenerationQuery>>,
    /// Queries inlined at render time; disabled views land here too.
    pub dynamic: Vec<Arc<ReportGenerationQuery>>,
    /// Data sources whose backing tables are read.
    pub datasources: Vec<Arc<ReportDataSource>>,
}

impl ResolvedDependencies {
    /// All views materialized and all tables created?
    pub fn ready(&self) -> Result<()> {
        for query in &self.views {
            if !query.view_materialized() {
                return Err(MeteringError::DependencyNotReady(format!(
                    "view for query {} is not materialized",
                    query.metadata
                )));
            }
        }
        for source in &self.datasources {
            if source.status.table_name.is_none() {
                return Err(MeteringError::DependencyNotReady(format!(
                    "datasource {} has no backing table",
                    source.metadata
                )));
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Gray,
    Black,
}

/// Resolve the full transitive closure rooted at `root`. An unknown query
/// name is a validation failure; a cycle is terminal with the cycle named.
pub fn resolve_dependencies(
    queries: &ResourceStore<ReportGenerationQuery>,
    datasources: &ResourceStore<ReportDataSource>,
    namespace: &str,
    root: &ReportGenerationQuery,
) -> Result<ResolvedDependencies> {
    let mut resolver = Resolver {
        queries,
        datasources,
        namespace,
        marks: HashMap::new(),
        path: Vec::new(),
        resolved: ResolvedDependencies::default(),
    };
    resolver.visit_edges(root)?;
    Ok(resolver.resolved)
}

struct Resolver<'a> {
    queries: &'a ResourceStore<ReportGenerationQuery>,
    datasources: &'a ResourceStore<ReportDataSource>,
    namespace: &'a str,
    marks: HashMap<String, Mark>,
    path: Vec<String>,
    resolved: ResolvedDependencies,
}

impl<'a> Resolver<'a> {
    fn visit_edges(&mut self, query: &ReportGenerationQuery) -> Result<()> {
        for name in &query.spec.report_queries {
            self.visit_query(name, false)?;
        }
        for name in &query.spec.dynamic_report_queries {
            self.visit_query(name, true)?;
        }
        for name in &query.spec.report_data_sources {
            let source = self.datasources.get(self.namespace, name).map_err(|_| {
                MeteringError::Validation(format!(
                    "query {} references unknown datasource {name}",
                    query.metadata
                ))
            })?;
            if !self
                .resolved
                .datasources
                .iter()
                .any(|s| s.metadata == source.metadata)
            {
                self.resolved.datasources.push(source);
            }
        }
        Ok(())
    }

    fn visit_query(&mut self, name: &str, dynamic: bool) -> Result<()> {
        match self.marks.get(name) {
            Some(Mark::Black) => return Ok(()),
            Some(Mark::Gray) => {
                let mut cycle = self.path.clone();
                cycle.push(name.to_string());
                return Err(MeteringError::DependencyCycle(cycle.join(" -> ")));
            }
            None => {}
        }

        let query = self
            .queries
            .get(self.namespace, name)
            .map_err(|_| MeteringError::Validation(format!("unknown generation query: {name}")))?;

        self.marks.insert(name.to_string(), Mark::Gray);
        self.path.push(name.to_string());
        self.visit_edges(&query)?;
        self.path.pop();
        self.marks.insert(name.to_string(), Mark::Black);

        if dynamic || query.spec.view.disabled {
            self.resolved.dynamic.push(query);
        } else {
            self.resolved.views.push(query);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        Column, DataSourceSpec, GenerationQuerySpec, Metadata, PrometheusSource, ViewSpec,
    };

    fn query(
        name: &str,
        report_queries: &[&str],
        dynamic: &[&str],
        sources: &[&str],
        view_disabled: bool,
    ) -> ReportGenerationQuery {
        ReportGenerationQuery::new(
            Metadata::new("metering", name),
            GenerationQuerySpec {
                query: "SELECT 1".to_string(),
                columns: vec![Column::new("amount", "double")],
                inputs: Vec::new(),
                report_queries: report_queries.iter().map(|s| s.to_string()).collect(),
                dynamic_report_queries: dynamic.iter().map(|s| s.to_string()).collect(),
                report_data_sources: sources.iter().map(|s| s.to_string()).collect(),
                view: ViewSpec {
                    disabled: view_disabled,
                },
            },
        )
    }

    fn datasource(name: &str) -> ReportDataSource {
        ReportDataSource::new(
            Metadata::new("metering", name),
            DataSourceSpec::Prometheus(PrometheusSource {
                query: "cpu".to_string(),
            }),
        )
    }

    #[test]
    fn test_closure_is_transitive() {
        let queries = ResourceStore::new();
        let datasources = ResourceStore::new();
        datasources.apply(datasource("d"));
        queries.apply(query("raw", &[], &[], &["d"], false));
        queries.apply(query("final", &["raw"], &[], &[], false));

        let root = queries.get("metering", "final").unwrap();
        let resolved = resolve_dependencies(&queries, &datasources, "metering", &root).unwrap();
        assert_eq!(resolved.views.len(), 1);
        assert_eq!(resolved.datasources.len(), 1);
        assert!(resolved.dynamic.is_empty());
    }

    #[test]
    fn test_disabled_views_classified_dynamic() {
        let queries = ResourceStore::new();
        let datasources = ResourceStore::new();
        queries.apply(query("raw", &[], &[], &[], false));
        queries.apply(query("filtered", &["raw"], &[], &[], true));
        queries.apply(query("final", &[], &["filtered"], &[], false));

        let root = queries.get("metering", "final").unwrap();
        let resolved = resolve_dependencies(&queries, &datasources, "metering", &root).unwrap();
        assert_eq!(resolved.views.len(), 1, "only raw is a view dependency");
        assert_eq!(resolved.views[0].metadata.name, "raw");
        assert_eq!(resolved.dynamic.len(), 1);
        assert_eq!(resolved.dynamic[0].metadata.name, "filtered");
    }

    #[test]
    fn test_cycle_detected_and_named() {
        let queries = ResourceStore::new();
        let datasources = ResourceStore::new();
        queries.apply(query("a", &["b"], &[], &[], false));
        queries.apply(query("b", &["a"], &[], &[], false));

        let root = queries.get("metering", "a").unwrap();
        let err = resolve_dependencies(&queries, &datasources, "metering", &root).unwrap_err();
        match err {
            MeteringError::DependencyCycle(cycle) => {
                assert!(cycle.contains("a -> b") || cycle.contains("b -> a"), "{cycle}");
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn test_unknown_reference_is_validation_failure() {
        let queries = ResourceStore::new();
        let datasources = ResourceStore::new();
        queries.apply(query("final", &["ghost"], &[], &[], false));

        let root = queries.get("metering", "final").unwrap();
        let err = resolve_dependencies(&queries, &datasources, "metering", &root).unwrap_err();
        assert!(matches!(err, MeteringError::Validation(_)));
    }

    #[test]
    fn test_readiness_requires_materialized_views() {
        let queries = ResourceStore::new();
        let datasources = ResourceStore::new();
        queries.apply(query("raw", &[], &[], &[], false));
        queries.apply(query("final", &["raw"], &[], &[], false));

        let root = queries.get("metering", "final").unwrap();
        let resolved = resolve_dependencies(&queries, &datasources, "metering", &root).unwrap();
        assert!(matches!(
            resolved.ready(),
            Err(MeteringError::DependencyNotReady(_))
        ));
    }
}
