use serde::{Deserialize, Serialize};

use super::{Metadata, ResourceKind, ResourceObject};

/// Declares a source of rows: either a Prometheus metric collected by the
/// Promsum ingester, or an externally-managed table (AWS billing data laid
/// out under an S3 prefix).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportDataSource {
    pub metadata: Metadata,
    pub spec: DataSourceSpec,
    #[serde(default)]
    pub status: DataSourceStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DataSourceSpec {
    /// Rows are ingested from a named ReportPrometheusQuery.
    Prometheus(PrometheusSource),
    /// Rows already exist at an external location; the operator only
    /// registers the table, it never writes to it.
    AwsBilling { bucket: String, prefix: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrometheusSource {
    /// Name of the ReportPrometheusQuery holding the PromQL expression.
    pub query: String,
}

/// Operator-managed status. `table_name` is set once the backing Hive table
/// has been created (or registered, for external sources).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataSourceStatus {
    pub table_name: Option<String>,
}

impl ReportDataSource {
    pub fn new(metadata: Metadata, spec: DataSourceSpec) -> Self {
        Self {
            metadata,
            spec,
            status: DataSourceStatus::default(),
        }
    }

    pub fn is_prometheus(&self) -> bool {
        matches!(self.spec, DataSourceSpec::Prometheus(_))
    }

    pub fn prometheus_query(&self) -> Option<&str> {
        match &self.spec {
            DataSourceSpec::Prometheus(source) => Some(&source.query),
            _ => None,
        }
    }
}

impl ResourceObject for ReportDataSource {
    const KIND: ResourceKind = ResourceKind::ReportDataSource;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}
