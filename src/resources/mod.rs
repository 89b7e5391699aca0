// # Declarative Resource Model
//
// The seven namespaced resource kinds the operator watches. Each carries a
// user-editable `spec` and an operator-managed `status` subresource. All
// addressing is by `(namespace, name)`, formatted as `namespace/name` keys on
// the work queues.

mod datasource;
mod query;
mod report;
mod scheduled_report;
mod table;

pub use datasource::{DataSourceSpec, DataSourceStatus, PrometheusSource, ReportDataSource};
pub use query::{
    GenerationQuerySpec, GenerationQueryStatus, PrometheusQuerySpec, QueryInput,
    ReportGenerationQuery, ReportPrometheusQuery, ViewSpec,
};
pub use report::{Report, ReportPhase, ReportSpec, ReportStatus};
pub use scheduled_report::{
    Schedule, SchedulePeriod, ScheduledReport, ScheduledReportSpec, ScheduledReportState,
    ScheduledReportStatus,
};
pub use table::{Column, PrestoTable, PrestoTableSpec, PrestoTableStatus, StorageLocation, StorageLocationSpec};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{MeteringError, Result};

/// Closed set of resource kinds handled by the operator. Dispatch is by
/// kind so the orchestrator can enumerate queues and worker pools statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Report,
    ScheduledReport,
    ReportGenerationQuery,
    ReportPrometheusQuery,
    ReportDataSource,
    PrestoTable,
    StorageLocation,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Report,
        ResourceKind::ScheduledReport,
        ResourceKind::ReportGenerationQuery,
        ResourceKind::ReportPrometheusQuery,
        ResourceKind::ReportDataSource,
        ResourceKind::PrestoTable,
        ResourceKind::StorageLocation,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Report => "Report",
            ResourceKind::ScheduledReport => "ScheduledReport",
            ResourceKind::ReportGenerationQuery => "ReportGenerationQuery",
            ResourceKind::ReportPrometheusQuery => "ReportPrometheusQuery",
            ResourceKind::ReportDataSource => "ReportDataSource",
            ResourceKind::PrestoTable => "PrestoTable",
            ResourceKind::StorageLocation => "StorageLocation",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Namespaced object metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pub namespace: String,
    pub name: String,
}

impl Metadata {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Work-queue key: `namespace/name`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Split a `namespace/name` queue key back into its parts.
pub fn split_key(key: &str) -> Result<(&str, &str)> {
    key.split_once('/')
        .filter(|(ns, name)| !ns.is_empty() && !name.is_empty())
        .ok_or_else(|| MeteringError::Internal(format!("malformed resource key: {key}")))
}

/// Implemented by all seven declarative resource types.
pub trait ResourceObject: Clone + Send + Sync + 'static {
    const KIND: ResourceKind;

    fn metadata(&self) -> &Metadata;

    fn key(&self) -> String {
        self.metadata().key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_round_trip() {
        let meta = Metadata::new("metering", "cluster-cpu-usage");
        let key = meta.key();
        assert_eq!(key, "metering/cluster-cpu-usage");
        let (ns, name) = split_key(&key).unwrap();
        assert_eq!(ns, "metering");
        assert_eq!(name, "cluster-cpu-usage");
    }

    #[test]
    fn test_malformed_keys_rejected() {
        assert!(split_key("no-slash").is_err());
        assert!(split_key("/name-only").is_err());
        assert!(split_key("ns-only/").is_err());
    }
}
