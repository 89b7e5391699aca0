// # Orchestrator
//
// Wires components, sequences startup, supervises shutdown:
//
// 1. Register store watch handlers feeding the work queues.
// 2. Acquire Hive and Presto connections in parallel.
// 3. (Prometheus client is non-blocking and already injected.)
// 4. Caches are push-populated, so they report synced immediately.
// 5. Run the Presto write-readiness probe.
// 6. Start worker pools, the scheduled runner, and the Promsum collector.
// 7. Mark initialized.
//
// Shutdown drains the queues, joins every worker fiber, cancels the
// runner's fibers, and closes the Hive session. Every blocking wait in the
// system selects on the broadcast stop channel, so shutdown is prompt.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clients::{
    HiveClient, HiveConnectionFactory, PrestoClient, PrestoConnectionFactory, PromQuerier,
    QueryLogger,
};
use crate::clock::SharedClock;
use crate::config::OperatorConfig;
use crate::error::Result;
use crate::http::{self, HealthState};
use crate::promsum::{CollectorConfig, PromsumCollector};
use crate::queue::WorkQueue;
use crate::reconcilers::{
    run_worker, DataSourceReconciler, GenerationQueryReconciler, NoopReconciler,
    PrestoTableReconciler, Reconciler, ReportExecutor, ReportReconciler,
    ScheduledReportReconciler,
};
use crate::render::QueryRenderer;
use crate::resources::ResourceKind;
use crate::schedule::{RunnerConfig, ScheduledRunner};
use crate::store::Stores;

/// External collaborators, injected so tests can swap in fakes.
pub struct OperatorDeps {
    pub hive_factory: Arc<dyn HiveConnectionFactory>,
    pub presto_factory: Arc<dyn PrestoConnectionFactory>,
    pub prom: Arc<dyn PromQuerier>,
    pub clock: SharedClock,
}

pub struct Operator {
    config: OperatorConfig,
    deps: OperatorDeps,
    stores: Arc<Stores>,
    health: Arc<HealthState>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Operator {
    pub fn new(config: OperatorConfig, deps: OperatorDeps) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            config,
            deps,
            stores: Arc::new(Stores::new()),
            health: Arc::new(HealthState::new()),
            stop_tx,
            stop_rx,
        }
    }

    pub fn stores(&self) -> Arc<Stores> {
        Arc::clone(&self.stores)
    }

    pub fn health(&self) -> Arc<HealthState> {
        Arc::clone(&self.health)
    }

    /// Broadcast the stop signal. Safe to call more than once.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Run until the stop signal fires, then tear down in order.
    pub async fn run(&self) -> Result<()> {
        let stop = self.stop_rx.clone();

        // 1. Watches feed the queues; workers start later, so early events
        // pile up harmlessly.
        let queues = self.wire_queues();

        // 2. Hive and Presto in parallel; both honor backoff and ceiling.
        let hive = Arc::new(HiveClient::new(
            Arc::clone(&self.deps.hive_factory),
            QueryLogger::new(self.config.log_ddl_queries, false),
            stop.clone(),
        ));
        let presto_logger =
            QueryLogger::new(self.config.log_ddl_queries, self.config.log_dml_queries);
        let (presto, ()) = tokio::try_join!(
            PrestoClient::connect(Arc::clone(&self.deps.presto_factory), presto_logger, &stop),
            hive.connect(),
        )?;
        let presto = Arc::new(presto);

        // 4. Push-populated caches are synced by construction.
        debug!("resource caches synced");

        // 5. Guard against Hive catalog registration outrunning Presto.
        presto.wait_until_writable(&stop).await?;

        // 6. Reconcilers, workers, runner, collector.
        let renderer = Arc::new(QueryRenderer::new(
            Arc::clone(&self.stores.generation_queries),
            Arc::clone(&self.stores.datasources),
            self.config.namespace.clone(),
            self.config.log_reports,
        ));
        let executor = Arc::new(ReportExecutor::new(
            Arc::clone(&self.stores.generation_queries),
            Arc::clone(&self.stores.datasources),
            Arc::clone(&self.stores.presto_tables),
            Arc::clone(&presto),
            Arc::clone(&hive),
            Arc::clone(&renderer),
        ));
        let runner = Arc::new(ScheduledRunner::new(
            Arc::clone(&self.stores.scheduled_reports),
            Arc::clone(&executor),
            Arc::clone(&self.deps.clock),
            stop.clone(),
            RunnerConfig::default(),
        ));

        let mut workers = self.spawn_workers(&queues, &hive, &presto, &renderer, &executor, &runner);

        workers.push(self.spawn_resync(stop.clone()));

        if self.config.disable_promsum {
            info!("promsum collector disabled by configuration");
        } else {
            let collector = PromsumCollector::new(
                Arc::clone(&self.stores.datasources),
                Arc::clone(&self.stores.prometheus_queries),
                Arc::clone(&self.stores.presto_tables),
                Arc::clone(&self.deps.prom),
                Arc::clone(&presto),
                Arc::clone(&hive),
                Arc::clone(&self.deps.clock),
                CollectorConfig {
                    interval: self.config.promsum_interval,
                    step: self.config.promsum_step_size,
                    chunk: self.config.promsum_chunk_size,
                },
            );
            let collector_stop = stop.clone();
            workers.push(tokio::spawn(async move {
                collector.run(collector_stop).await;
            }));
        }

        let http_state = Arc::clone(&self.health);
        let http_stop = stop.clone();
        let http_address = self.config.api_listen_address.clone();
        let http_server = tokio::spawn(async move {
            if let Err(err) = http::serve(&http_address, http_state, http_stop).await {
                tracing::error!(%err, "http server failed");
            }
        });

        // 7. Admit traffic.
        self.health.set_initialized(true);
        info!(version = crate::VERSION, "operator initialized");

        // Block until shutdown.
        let mut stop_wait = stop.clone();
        if !*stop_wait.borrow() {
            let _ = stop_wait.changed().await;
        }

        info!("stop signal observed, shutting down");
        for queue in queues.values() {
            queue.shutdown();
        }
        futures::future::join_all(workers).await;
        runner.shutdown().await;
        let _ = http_server.await;
        hive.close().await;
        self.health.set_initialized(false);
        info!("shutdown complete");
        Ok(())
    }

    /// One queue per kind; every store event enqueues its key.
    fn wire_queues(&self) -> HashMap<ResourceKind, Arc<WorkQueue>> {
        let mut queues = HashMap::new();
        for kind in ResourceKind::ALL {
            queues.insert(kind, Arc::new(WorkQueue::new(kind.as_str())));
        }

        macro_rules! wire {
            ($store:expr, $kind:expr) => {{
                let queue = Arc::clone(&queues[&$kind]);
                $store.register(move |event| queue.add(event.key()));
            }};
        }
        wire!(self.stores.reports, ResourceKind::Report);
        wire!(self.stores.scheduled_reports, ResourceKind::ScheduledReport);
        wire!(
            self.stores.generation_queries,
            ResourceKind::ReportGenerationQuery
        );
        wire!(
            self.stores.prometheus_queries,
            ResourceKind::ReportPrometheusQuery
        );
        wire!(self.stores.datasources, ResourceKind::ReportDataSource);
        wire!(self.stores.presto_tables, ResourceKind::PrestoTable);
        wire!(self.stores.storage_locations, ResourceKind::StorageLocation);
        queues
    }

    fn spawn_workers(
        &self,
        queues: &HashMap<ResourceKind, Arc<WorkQueue>>,
        hive: &Arc<HiveClient>,
        presto: &Arc<PrestoClient>,
        renderer: &Arc<QueryRenderer>,
        executor: &Arc<ReportExecutor>,
        runner: &Arc<ScheduledRunner>,
    ) -> Vec<JoinHandle<()>> {
        let reconcilers: Vec<Arc<dyn Reconciler>> = vec![
            Arc::new(ReportReconciler::new(
                Arc::clone(&self.stores.reports),
                Arc::clone(executor),
            )),
            Arc::new(ScheduledReportReconciler::new(
                Arc::clone(&self.stores.scheduled_reports),
                Arc::clone(runner),
            )),
            Arc::new(GenerationQueryReconciler::new(
                Arc::clone(&self.stores.generation_queries),
                Arc::clone(&self.stores.datasources),
                Arc::clone(presto),
                Arc::clone(renderer),
            )),
            Arc::new(DataSourceReconciler::new(
                Arc::clone(&self.stores.datasources),
                Arc::clone(&self.stores.storage_locations),
                Arc::clone(&self.stores.presto_tables),
                Arc::clone(hive),
            )),
            Arc::new(PrestoTableReconciler::new(Arc::clone(
                &self.stores.presto_tables,
            ))),
            Arc::new(NoopReconciler::new(ResourceKind::ReportPrometheusQuery)),
            Arc::new(NoopReconciler::new(ResourceKind::StorageLocation)),
        ];

        let mut handles = Vec::new();
        for reconciler in reconcilers {
            let kind = reconciler.kind();
            let queue = Arc::clone(&queues[&kind]);
            // PrestoTable carries one extra worker for future partition GC
            // sweeps.
            let count = if kind == ResourceKind::PrestoTable {
                self.config.workers_per_kind + 1
            } else {
                self.config.workers_per_kind
            };
            for _ in 0..count {
                let queue = Arc::clone(&queue);
                let reconciler = Arc::clone(&reconciler);
                let max_requeues = self.config.max_requeues;
                handles.push(tokio::spawn(async move {
                    run_worker(queue, reconciler, max_requeues).await;
                }));
            }
        }
        handles
    }

    /// Periodic full resync: re-emit every key so reconcilers converge even
    /// after missed notifications.
    fn spawn_resync(&self, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let stores = Arc::clone(&self.stores);
        let interval = self.config.resync_interval;
        let mut stop = stop;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The immediate first tick would re-emit what the watch just
            // delivered.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => stores.resync_all(),
                    _ = stop.changed() => return,
                }
            }
        })
    }
}
