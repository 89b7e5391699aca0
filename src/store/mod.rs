// # Resource Store
//
// Read-through cache of declarative resources, one typed store per kind.
// Watch notifications land here via `apply`/`delete`; registered handlers
// fan events out to the work queues. A periodic resync re-emits every key
// as an update so reconcilers converge even after missed notifications.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::error::{MeteringError, Result};
use crate::resources::{
    Report, ReportDataSource, ReportGenerationQuery, ReportPrometheusQuery, ResourceObject,
    ScheduledReport, StorageLocation,
};
use crate::resources::PrestoTable;

/// Store-level change notification. Carries the `namespace/name` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(String),
    Updated(String),
    Deleted(String),
}

impl WatchEvent {
    pub fn key(&self) -> &str {
        match self {
            WatchEvent::Added(key) | WatchEvent::Updated(key) | WatchEvent::Deleted(key) => key,
        }
    }
}

type EventHandler = Box<dyn Fn(&WatchEvent) + Send + Sync>;

/// Cache of one resource kind. Multi-reader, single-writer: the watch feed
/// and status patches write; reconcilers take read-only snapshots per sync.
pub struct ResourceStore<T: ResourceObject> {
    items: DashMap<String, Arc<T>>,
    handlers: RwLock<Vec<EventHandler>>,
}

impl<T: ResourceObject> ResourceStore<T> {
    pub fn new() -> Self {
        Self {
            items: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler. Handlers run inline on the notifying
    /// thread and must not block.
    pub fn register<F>(&self, handler: F)
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        self.handlers.write().push(Box::new(handler));
    }

    pub fn get(&self, namespace: &str, name: &str) -> Result<Arc<T>> {
        self.get_key(&format!("{namespace}/{name}"))
    }

    pub fn get_key(&self, key: &str) -> Result<Arc<T>> {
        self.items
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| MeteringError::NotFound(format!("{} {key}", T::KIND)))
    }

    pub fn list(&self, namespace: &str) -> Vec<Arc<T>> {
        self.items
            .iter()
            .filter(|entry| entry.value().metadata().namespace == namespace)
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn list_all(&self) -> Vec<Arc<T>> {
        self.items
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Insert or replace a resource and notify handlers.
    pub fn apply(&self, resource: T) {
        let key = resource.key();
        let existed = self.items.insert(key.clone(), Arc::new(resource)).is_some();
        let event = if existed {
            WatchEvent::Updated(key)
        } else {
            WatchEvent::Added(key)
        };
        self.emit(&event);
    }

    /// Remove a resource and notify handlers. Removing an absent key is a
    /// no-op.
    pub fn delete(&self, namespace: &str, name: &str) {
        let key = format!("{namespace}/{name}");
        if self.items.remove(&key).is_some() {
            self.emit(&WatchEvent::Deleted(key));
        }
    }

    /// Read-modify-write of a resource, used for status patches. Emits an
    /// update event, so mutators should leave the resource untouched when
    /// there is nothing to change.
    pub fn update<F>(&self, key: &str, mutate: F) -> Result<Arc<T>>
    where
        F: FnOnce(&mut T),
    {
        let updated = {
            let mut entry = self
                .items
                .get_mut(key)
                .ok_or_else(|| MeteringError::NotFound(format!("{} {key}", T::KIND)))?;
            let mut resource = (**entry.value()).clone();
            mutate(&mut resource);
            let updated = Arc::new(resource);
            *entry.value_mut() = Arc::clone(&updated);
            updated
        };
        self.emit(&WatchEvent::Updated(key.to_string()));
        Ok(updated)
    }

    /// Re-emit every key as an update.
    pub fn resync(&self) {
        let keys: Vec<String> = self.items.iter().map(|entry| entry.key().clone()).collect();
        for key in keys {
            self.emit(&WatchEvent::Updated(key));
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn emit(&self, event: &WatchEvent) {
        for handler in self.handlers.read().iter() {
            handler(event);
        }
    }
}

impl<T: ResourceObject> Default for ResourceStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// All seven typed caches, shared across reconcilers and collectors.
pub struct Stores {
    pub reports: Arc<ResourceStore<Report>>,
    pub scheduled_reports: Arc<ResourceStore<ScheduledReport>>,
    pub generation_queries: Arc<ResourceStore<ReportGenerationQuery>>,
    pub prometheus_queries: Arc<ResourceStore<ReportPrometheusQuery>>,
    pub datasources: Arc<ResourceStore<ReportDataSource>>,
    pub presto_tables: Arc<ResourceStore<PrestoTable>>,
    pub storage_locations: Arc<ResourceStore<StorageLocation>>,
}

impl Stores {
    pub fn new() -> Self {
        Self {
            reports: Arc::new(ResourceStore::new()),
            scheduled_reports: Arc::new(ResourceStore::new()),
            generation_queries: Arc::new(ResourceStore::new()),
            prometheus_queries: Arc::new(ResourceStore::new()),
            datasources: Arc::new(ResourceStore::new()),
            presto_tables: Arc::new(ResourceStore::new()),
            storage_locations: Arc::new(ResourceStore::new()),
        }
    }

    /// Resync every cache, re-emitting all keys as updates.
    pub fn resync_all(&self) {
        self.reports.resync();
        self.scheduled_reports.resync();
        self.generation_queries.resync();
        self.prometheus_queries.resync();
        self.datasources.resync();
        self.presto_tables.resync();
        self.storage_locations.resync();
    }
}

impl Default for Stores {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{DataSourceSpec, Metadata, PrometheusSource};
    use parking_lot::Mutex;

    fn datasource(name: &str) -> ReportDataSource {
        ReportDataSource::new(
            Metadata::new("metering", name),
            DataSourceSpec::Prometheus(PrometheusSource {
                query: "node-cpu".to_string(),
            }),
        )
    }

    #[test]
    fn test_apply_get_delete() {
        let store = ResourceStore::<ReportDataSource>::new();
        store.apply(datasource("cpu"));

        let found = store.get("metering", "cpu").unwrap();
        assert_eq!(found.metadata.name, "cpu");

        store.delete("metering", "cpu");
        assert!(store.get("metering", "cpu").is_err());
    }

    #[test]
    fn test_events_distinguish_add_update_delete() {
        let store = ResourceStore::<ReportDataSource>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.register(move |event| sink.lock().push(event.clone()));

        store.apply(datasource("cpu"));
        store.apply(datasource("cpu"));
        store.delete("metering", "cpu");
        store.delete("metering", "cpu");

        let events = seen.lock().clone();
        assert_eq!(
            events,
            vec![
                WatchEvent::Added("metering/cpu".to_string()),
                WatchEvent::Updated("metering/cpu".to_string()),
                WatchEvent::Deleted("metering/cpu".to_string()),
            ]
        );
    }

    #[test]
    fn test_update_patches_status() {
        let store = ResourceStore::<ReportDataSource>::new();
        store.apply(datasource("cpu"));
        store
            .update("metering/cpu", |ds| {
                ds.status.table_name = Some("hive.metering.datasource_cpu".to_string());
            })
            .unwrap();
        let found = store.get("metering", "cpu").unwrap();
        assert_eq!(
            found.status.table_name.as_deref(),
            Some("hive.metering.datasource_cpu")
        );
    }

    #[test]
    fn test_resync_reemits_all_keys() {
        let store = ResourceStore::<ReportDataSource>::new();
        store.apply(datasource("cpu"));
        store.apply(datasource("memory"));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        store.register(move |event| sink.lock().push(event.clone()));

        store.resync();
        let events = seen.lock().clone();
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|e| matches!(e, WatchEvent::Updated(_))));
    }
}
