use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Metadata, ResourceKind, ResourceObject};

/// A one-shot materialization of a ReportGenerationQuery over the half-open
/// interval `[reporting_start, reporting_end)`. The spec is immutable; only
/// status is mutated by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub metadata: Metadata,
    pub spec: ReportSpec,
    #[serde(default)]
    pub status: ReportStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSpec {
    /// Name of the ReportGenerationQuery to execute.
    pub generation_query: String,
    pub reporting_start: DateTime<Utc>,
    pub reporting_end: DateTime<Utc>,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
}

/// Report lifecycle: `Unset → Pending → Started → Finished | Failed`.
/// `Finished` and `Failed` are terminal; retries happen only in `Pending`
/// and `Started`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportPhase {
    #[default]
    Unset,
    Pending,
    Started,
    Finished,
    Failed,
}

impl ReportPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ReportPhase::Finished | ReportPhase::Failed)
    }
}

impl fmt::Display for ReportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReportPhase::Unset => "Unset",
            ReportPhase::Pending => "Pending",
            ReportPhase::Started => "Started",
            ReportPhase::Finished => "Finished",
            ReportPhase::Failed => "Failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReportStatus {
    #[serde(default)]
    pub phase: ReportPhase,
    /// Output table, recorded once created so re-syncs never re-create it.
    pub table_name: Option<String>,
    /// Failure message for `Failed` reports.
    pub message: Option<String>,
}

impl Report {
    pub fn new(metadata: Metadata, spec: ReportSpec) -> Self {
        Self {
            metadata,
            spec,
            status: ReportStatus::default(),
        }
    }

    /// The reporting window must be non-empty: `start < end`.
    pub fn window_valid(&self) -> bool {
        self.spec.reporting_start < self.spec.reporting_end
    }
}

impl ResourceObject for Report {
    const KIND: ResourceKind = ResourceKind::Report;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}
