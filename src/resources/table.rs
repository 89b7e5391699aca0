use serde::{Deserialize, Serialize};

use super::{Metadata, ResourceKind, ResourceObject};

/// A single column of a Hive/Presto schema. Types are carried as Hive SQL
/// type strings (`double`, `timestamp`, `map<string,string>`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub unit: Option<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// Represents a Hive-managed table addressable from Presto. Created as a
/// side effect of reconciling a ReportDataSource or a non-view
/// ReportGenerationQuery; never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrestoTable {
    pub metadata: Metadata,
    pub spec: PrestoTableSpec,
    #[serde(default)]
    pub status: PrestoTableStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrestoTableSpec {
    pub table_name: String,
    pub columns: Vec<Column>,
    #[serde(default)]
    pub partitions: Vec<Column>,
    /// Name of the StorageLocation holding the table files.
    pub storage_location: Option<String>,
    /// Resolved URI of the table files, recorded at creation time so
    /// partition locations can be derived without another lookup.
    pub location: Option<String>,
}

/// The status-recorded schema is the schema actually created in Hive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrestoTableStatus {
    #[serde(default)]
    pub columns: Vec<Column>,
}

impl ResourceObject for PrestoTable {
    const KIND: ResourceKind = ResourceKind::PrestoTable;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

/// A physical location (filesystem path or object-store URI) where Hive
/// stores table files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageLocation {
    pub metadata: Metadata,
    pub spec: StorageLocationSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageLocationSpec {
    pub location: String,
}

impl ResourceObject for StorageLocation {
    const KIND: ResourceKind = ResourceKind::StorageLocation;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}
