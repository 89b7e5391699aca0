// End-to-end orchestrator test: full startup sequence against fakes, a
// report driven from resource creation to Finished by the worker pools,
// and an ordered shutdown.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chargeback::clock::SystemClock;
use chargeback::operator::{Operator, OperatorDeps};
use chargeback::resources::{
    Column, DataSourceSpec, GenerationQuerySpec, Metadata, PrometheusSource, Report,
    ReportDataSource, ReportGenerationQuery, ReportPhase, ReportSpec, ViewSpec,
};
use chargeback::OperatorConfig;
use chrono::{TimeZone, Utc};
use common::{FakeProm, RecordingPresto, RecordingPrestoFactory, ScriptedHiveFactory};

async fn wait_for<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    condition()
}

#[tokio::test]
async fn test_operator_drives_report_to_finished() {
    let presto = RecordingPresto::new();
    let hive = ScriptedHiveFactory::new();

    let mut config = OperatorConfig::default();
    config.api_listen_address = "127.0.0.1:0".to_string();
    config.disable_promsum = true;

    let operator = Arc::new(Operator::new(
        config,
        OperatorDeps {
            hive_factory: Arc::clone(&hive) as Arc<dyn chargeback::clients::HiveConnectionFactory>,
            presto_factory: Arc::new(RecordingPrestoFactory::new(Arc::clone(&presto))),
            prom: FakeProm::new() as Arc<dyn chargeback::clients::PromQuerier>,
            clock: Arc::new(SystemClock),
        },
    ));

    let stores = operator.stores();
    let runner = Arc::clone(&operator);
    let run = tokio::spawn(async move { runner.run().await });

    let health = operator.health();
    assert!(
        wait_for(|| health.initialized(), Duration::from_secs(5)).await,
        "operator initializes against healthy fakes"
    );
    assert!(
        presto.count_matching("chargeback_write_probe") >= 2,
        "write-readiness probe ran before initialization"
    );

    // Declare a datasource, a query over it, and a report.
    stores.datasources.apply(ReportDataSource::new(
        Metadata::new("metering", "d"),
        DataSourceSpec::Prometheus(PrometheusSource {
            query: "node-cpu".to_string(),
        }),
    ));
    stores.generation_queries.apply(ReportGenerationQuery::new(
        Metadata::new("metering", "usage"),
        GenerationQuerySpec {
            query: "SELECT * FROM {{ datasource_table_name(name=\"d\") }}".to_string(),
            columns: vec![Column::new("amount", "double")],
            inputs: Vec::new(),
            report_queries: Vec::new(),
            dynamic_report_queries: Vec::new(),
            report_data_sources: vec!["d".to_string()],
            view: ViewSpec::default(),
        },
    ));
    stores.reports.apply(Report::new(
        Metadata::new("metering", "r"),
        ReportSpec {
            generation_query: "usage".to_string(),
            reporting_start: Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap(),
            reporting_end: Utc.with_ymd_and_hms(2019, 1, 2, 0, 0, 0).unwrap(),
            inputs: BTreeMap::new(),
        },
    ));

    let reports = Arc::clone(&stores.reports);
    let finished = wait_for(
        || {
            reports
                .get_key("metering/r")
                .map(|r| r.status.phase == ReportPhase::Finished)
                .unwrap_or(false)
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(finished, "workers drive the report to Finished");

    assert_eq!(
        hive.count_matching("CREATE EXTERNAL TABLE IF NOT EXISTS datasource_metering_d"),
        1,
        "datasource table created in hive"
    );
    assert_eq!(
        presto.count_matching("INSERT INTO report_metering_r"),
        1,
        "exactly one report insert"
    );
    let datasource = stores.datasources.get("metering", "d").unwrap();
    assert_eq!(
        datasource.status.table_name.as_deref(),
        Some("datasource_metering_d")
    );

    operator.shutdown();
    let result = run.await.expect("run task joins");
    assert!(result.is_ok(), "shutdown is clean: {result:?}");
    assert!(!operator.health().initialized(), "readiness drops on shutdown");
}
