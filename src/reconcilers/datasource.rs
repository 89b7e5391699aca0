// # ReportDataSource Reconciler
//
// Prometheus-backed sources get a Hive table with the fixed Promsum schema,
// partitioned by billing period. Externally-managed sources (AWS billing)
// only have their existing location registered. The underlying Hive table
// is never deleted by the operator.

use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use tracing::{debug, info};

use super::{datasource_table, Reconciler};
use crate::clients::hive::create_external_table_ddl;
use crate::clients::HiveClient;
use crate::error::Result;
use crate::resources::{
    Column, DataSourceSpec, Metadata, PrestoTable, PrestoTableSpec, PrestoTableStatus,
    ReportDataSource, ResourceKind, ResourceObject, StorageLocation,
};
use crate::store::ResourceStore;

static PROMSUM_SCHEMA: Lazy<Vec<Column>> = Lazy::new(|| {
    vec![
        Column::new("amount", "double"),
        Column::new("timestamp", "timestamp"),
        Column::new("timePrecision", "double").with_unit("seconds"),
        Column::new("labels", "map<string,string>"),
    ]
});

static PROMSUM_PARTITIONS: Lazy<Vec<Column>> = Lazy::new(|| {
    vec![
        Column::new("billing_period_start", "string"),
        Column::new("billing_period_end", "string"),
    ]
});

/// Fixed row schema written by the Promsum collector.
pub fn promsum_schema() -> Vec<Column> {
    PROMSUM_SCHEMA.clone()
}

/// Billing-period partition columns, string-typed `YYYYMMDD`.
pub fn promsum_partitions() -> Vec<Column> {
    PROMSUM_PARTITIONS.clone()
}

/// Fallback table-file location when no `default` StorageLocation exists.
const FALLBACK_STORAGE_URI: &str = "hdfs://hdfs-namenode:9820/operator_metering/storage";

pub struct DataSourceReconciler {
    datasources: Arc<ResourceStore<ReportDataSource>>,
    storage_locations: Arc<ResourceStore<StorageLocation>>,
    presto_tables: Arc<ResourceStore<PrestoTable>>,
    hive: Arc<HiveClient>,
}

impl DataSourceReconciler {
    pub fn new(
        datasources: Arc<ResourceStore<ReportDataSource>>,
        storage_locations: Arc<ResourceStore<StorageLocation>>,
        presto_tables: Arc<ResourceStore<PrestoTable>>,
        hive: Arc<HiveClient>,
    ) -> Self {
        Self {
            datasources,
            storage_locations,
            presto_tables,
            hive,
        }
    }

    fn storage_uri(&self, namespace: &str) -> String {
        match self.storage_locations.get(namespace, "default") {
            Ok(location) => location.spec.location.clone(),
            Err(_) => {
                debug!(namespace, "no default storage location, using fallback");
                FALLBACK_STORAGE_URI.to_string()
            }
        }
    }

    async fn sync_prometheus(&self, source: &ReportDataSource) -> Result<()> {
        let namespace = &source.metadata.namespace;
        let name = &source.metadata.name;
        let table = datasource_table(namespace, name);
        let location = format!("{}/{}", self.storage_uri(namespace), table);

        let columns = promsum_schema();
        let partitions = promsum_partitions();
        let ddl = create_external_table_ddl(&table, &columns, &partitions, &location);
        self.hive.query(&ddl).await?;

        self.presto_tables.apply(PrestoTable {
            metadata: Metadata::new(namespace.clone(), table.clone()),
            spec: PrestoTableSpec {
                table_name: table.clone(),
                columns: columns.clone(),
                partitions,
                storage_location: Some("default".to_string()),
                location: Some(location),
            },
            status: PrestoTableStatus { columns },
        });

        self.datasources.update(&source.key(), |ds| {
            ds.status.table_name = Some(table.clone());
        })?;
        info!(datasource = %source.metadata, %table, "created datasource table");
        Ok(())
    }

    /// External tables already hold rows; register the location, create
    /// nothing.
    fn sync_external(&self, source: &ReportDataSource, bucket: &str, prefix: &str) -> Result<()> {
        let namespace = &source.metadata.namespace;
        let name = &source.metadata.name;
        let table = datasource_table(namespace, name);
        let location = format!("s3a://{bucket}/{prefix}");

        self.presto_tables.apply(PrestoTable {
            metadata: Metadata::new(namespace.clone(), table.clone()),
            spec: PrestoTableSpec {
                table_name: table.clone(),
                columns: Vec::new(),
                partitions: Vec::new(),
                storage_location: None,
                location: Some(location),
            },
            status: PrestoTableStatus::default(),
        });

        self.datasources.update(&source.key(), |ds| {
            ds.status.table_name = Some(table.clone());
        })?;
        info!(datasource = %source.metadata, %table, "registered external table");
        Ok(())
    }
}

#[async_trait]
impl Reconciler for DataSourceReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ReportDataSource
    }

    async fn sync(&self, key: &str) -> Result<()> {
        let source = match self.datasources.get_key(key) {
            Ok(source) => source,
            // Deleted; the backing Hive table is left in place.
            Err(_) => return Ok(()),
        };

        if source.status.table_name.is_some() {
            return Ok(());
        }

        match &source.spec {
            DataSourceSpec::Prometheus(_) => self.sync_prometheus(&source).await,
            DataSourceSpec::AwsBilling { bucket, prefix } => {
                self.sync_external(&source, bucket, prefix)
            }
        }
    }
}
