use serde::{Deserialize, Serialize};

use super::table::Column;
use super::{Metadata, ResourceKind, ResourceObject};

/// A SQL template plus the dependency edges needed to execute it: views it
/// reads from (`report_queries`), templates inlined at render time
/// (`dynamic_report_queries`), and tables it reads from
/// (`report_data_sources`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportGenerationQuery {
    pub metadata: Metadata,
    pub spec: GenerationQuerySpec,
    #[serde(default)]
    pub status: GenerationQueryStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationQuerySpec {
    /// The SQL template body.
    pub query: String,
    /// Typed output columns, used as the schema of report output tables.
    pub columns: Vec<Column>,
    /// Named parameters with optional defaults.
    #[serde(default)]
    pub inputs: Vec<QueryInput>,
    /// Queries this one reads from as materialized views.
    #[serde(default)]
    pub report_queries: Vec<String>,
    /// Queries inlined into this template at render time.
    #[serde(default)]
    pub dynamic_report_queries: Vec<String>,
    /// Data sources whose backing tables this query reads from.
    #[serde(default)]
    pub report_data_sources: Vec<String>,
    #[serde(default)]
    pub view: ViewSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryInput {
    pub name: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ViewSpec {
    /// When set, the query is never materialized as a view; dependents must
    /// inline it through `dynamic_report_queries`.
    #[serde(default)]
    pub disabled: bool,
}

/// `view_name` records the Presto view identifier once materialized.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GenerationQueryStatus {
    pub view_name: Option<String>,
}

impl ReportGenerationQuery {
    pub fn new(metadata: Metadata, spec: GenerationQuerySpec) -> Self {
        Self {
            metadata,
            spec,
            status: GenerationQueryStatus::default(),
        }
    }

    pub fn view_materialized(&self) -> bool {
        self.status.view_name.is_some()
    }
}

impl ResourceObject for ReportGenerationQuery {
    const KIND: ResourceKind = ResourceKind::ReportGenerationQuery;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// A named PromQL expression referenced by Promsum-driven data sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportPrometheusQuery {
    pub metadata: Metadata,
    pub spec: PrometheusQuerySpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusQuerySpec {
    /// The PromQL expression issued as a range query.
    pub query: String,
}

impl ResourceObject for ReportPrometheusQuery {
    const KIND: ResourceKind = ResourceKind::ReportPrometheusQuery;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}
