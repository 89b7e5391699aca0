// # PrestoTable Reconciler
//
// Maintains the catalog of operator-managed tables. No external actions by
// default; this is the attachment point for future partition GC.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::trace;

use super::Reconciler;
use crate::error::Result;
use crate::resources::{PrestoTable, ResourceKind};
use crate::store::ResourceStore;

pub struct PrestoTableReconciler {
    presto_tables: Arc<ResourceStore<PrestoTable>>,
}

impl PrestoTableReconciler {
    pub fn new(presto_tables: Arc<ResourceStore<PrestoTable>>) -> Self {
        Self { presto_tables }
    }
}

#[async_trait]
impl Reconciler for PrestoTableReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::PrestoTable
    }

    async fn sync(&self, key: &str) -> Result<()> {
        match self.presto_tables.get_key(key) {
            Ok(table) => trace!(table = %table.metadata, "catalog entry in sync"),
            Err(_) => trace!(key, "catalog entry removed"),
        }
        Ok(())
    }
}
