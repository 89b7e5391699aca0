// # Promsum Collector
//
// Periodic Prometheus → Hive ingestion. Every tick snapshots the
// Prometheus-backed ReportDataSources and, per source, advances a cursor:
// query the metric over `[cursor, cursor + chunk)`, split the samples into
// billing-period partitions, ensure the partitions exist, insert through
// Presto, then move the cursor. A failed source leaves its cursor
// untouched and the next tick retries the same window; sources never
// affect each other.
//
// Cursors live in memory and are reconstructed from the warehouse on
// startup by scanning for the largest ingested timestamp, which keeps
// ingestion contiguous across operator restarts: successive chunks always
// satisfy `next.start == prev.end`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Months, TimeZone, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clients::hive::add_partition_ddl;
use crate::clients::presto::timestamp_literal;
use crate::clients::{HiveClient, PrestoClient, PromQuerier, PromSample};
use crate::clock::SharedClock;
use crate::error::{MeteringError, Result};
use crate::resources::{
    PrestoTable, ReportDataSource, ReportPrometheusQuery, ResourceObject,
};
use crate::store::ResourceStore;

#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Tick period.
    pub interval: Duration,
    /// Prometheus query step.
    pub step: Duration,
    /// Maximum per-tick ingestion window.
    pub chunk: Duration,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            step: Duration::from_secs(60),
            chunk: Duration::from_secs(300),
        }
    }
}

pub struct PromsumCollector {
    datasources: Arc<ResourceStore<ReportDataSource>>,
    prometheus_queries: Arc<ResourceStore<ReportPrometheusQuery>>,
    presto_tables: Arc<ResourceStore<PrestoTable>>,
    prom: Arc<dyn PromQuerier>,
    presto: Arc<PrestoClient>,
    hive: Arc<HiveClient>,
    clock: SharedClock,
    config: CollectorConfig,
    /// Per-source high-water mark, keyed by `namespace/name`.
    cursors: DashMap<String, DateTime<Utc>>,
}

impl PromsumCollector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        datasources: Arc<ResourceStore<ReportDataSource>>,
        prometheus_queries: Arc<ResourceStore<ReportPrometheusQuery>>,
        presto_tables: Arc<ResourceStore<PrestoTable>>,
        prom: Arc<dyn PromQuerier>,
        presto: Arc<PrestoClient>,
        hive: Arc<HiveClient>,
        clock: SharedClock,
        config: CollectorConfig,
    ) -> Self {
        Self {
            datasources,
            prometheus_queries,
            presto_tables,
            prom,
            presto,
            hive,
            clock,
            config,
            cursors: DashMap::new(),
        }
    }

    /// Collector loop: tick until the stop signal fires.
    pub async fn run(&self, stop: watch::Receiver<bool>) {
        let mut stop = stop;
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.config.interval, "promsum collector started");
        loop {
            tokio::select! {
                _ = ticker.tick() => self.collect_once().await,
                _ = stop.changed() => {
                    info!("promsum collector stopping");
                    return;
                }
            }
        }
    }

    /// One tick: ingest every Prometheus-backed source. Failures are
    /// isolated per source.
    pub async fn collect_once(&self) {
        let sources = self.datasources.list_all();
        for source in sources.into_iter().filter(|s| s.is_prometheus()) {
            if let Err(err) = self.collect_source(&source).await {
                warn!(datasource = %source.metadata, %err, "collection failed, cursor unchanged");
            }
        }
    }

    async fn collect_source(&self, source: &ReportDataSource) -> Result<()> {
        let key = source.key();
        let Some(table) = source.status.table_name.clone() else {
            debug!(datasource = %source.metadata, "no backing table yet, skipping");
            return Ok(());
        };

        let expression = self.promql_for(source)?;
        let cursor_start = match self.cursors.get(&key) {
            Some(cursor) => *cursor,
            None => {
                let cursor = self.reconstruct_cursor(&table).await?;
                self.cursors.insert(key.clone(), cursor);
                cursor
            }
        };

        let now = self.clock.now();
        // Hold back one step so half-written scrape intervals are not
        // ingested.
        let ceiling = now - chrono_duration(self.config.step);
        let cursor_end = std::cmp::min(cursor_start + chrono_duration(self.config.chunk), ceiling);

        if cursor_end - cursor_start < chrono_duration(self.config.step) {
            debug!(datasource = %source.metadata, "window shorter than step, skipping tick");
            return Ok(());
        }

        let samples = self
            .prom
            .query_range(&expression, cursor_start, cursor_end, self.config.step)
            .await?;

        if samples.is_empty() {
            // A Prometheus-side gap is preserved verbatim; the cursor still
            // advances so the collector does not spin on it.
            self.cursors.insert(key, cursor_end);
            return Ok(());
        }

        let location = self.table_location(source, &table);
        for batch in split_by_billing_period(&samples) {
            self.ensure_partition(&table, &batch.period, location.as_deref())
                .await?;
            let insert = build_insert(&table, &batch, self.config.step);
            self.presto.query(&insert).await?;
            debug!(
                datasource = %source.metadata,
                period_start = %batch.period.start_str(),
                rows = batch.samples.len(),
                "ingested batch"
            );
        }

        self.cursors.insert(key, cursor_end);
        Ok(())
    }

    fn promql_for(&self, source: &ReportDataSource) -> Result<String> {
        let name = source
            .prometheus_query()
            .ok_or_else(|| MeteringError::Internal("non-prometheus source in promsum".into()))?;
        let query = self
            .prometheus_queries
            .get(&source.metadata.namespace, name)
            .map_err(|_| {
                MeteringError::DependencyNotReady(format!("prometheus query {name} not found"))
            })?;
        Ok(query.spec.query.clone())
    }

    /// Largest ingested timestamp, or `now - chunk` for a fresh table.
    async fn reconstruct_cursor(&self, table: &str) -> Result<DateTime<Utc>> {
        let rows = self
            .presto
            .query(&format!("SELECT max(\"timestamp\") AS latest FROM {table}"))
            .await?;
        let latest = rows
            .first()
            .and_then(|row| row.get("latest"))
            .and_then(|value| value.as_str())
            .and_then(parse_presto_timestamp);
        match latest {
            Some(cursor) => {
                info!(table, %cursor, "cursor reconstructed from warehouse");
                Ok(cursor)
            }
            None => Ok(self.clock.now() - chrono_duration(self.config.chunk)),
        }
    }

    fn table_location(&self, source: &ReportDataSource, table: &str) -> Option<String> {
        self.presto_tables
            .get(&source.metadata.namespace, table)
            .ok()
            .and_then(|t| t.spec.location.clone())
    }

    async fn ensure_partition(
        &self,
        table: &str,
        period: &BillingPeriod,
        location: Option<&str>,
    ) -> Result<()> {
        let partition = [
            ("billing_period_start".to_string(), period.start_str()),
            ("billing_period_end".to_string(), period.end_str()),
        ];
        let location = match location {
            Some(base) => format!("{base}/{}_{}", period.start_str(), period.end_str()),
            None => return Err(MeteringError::Internal(format!(
                "table {table} has no recorded location"
            ))),
        };
        self.hive
            .query(&add_partition_ddl(table, &partition, &location))
            .await
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Monthly billing period: first-of-month to first-of-next-month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingPeriod {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl BillingPeriod {
    pub fn containing(t: DateTime<Utc>) -> Self {
        let start = Utc
            .with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
            .unwrap();
        let end = start
            .checked_add_months(Months::new(1))
            .unwrap_or(start + chrono::Duration::days(31));
        Self { start, end }
    }

    pub fn start_str(&self) -> String {
        self.start.format("%Y%m%d").to_string()
    }

    pub fn end_str(&self) -> String {
        self.end.format("%Y%m%d").to_string()
    }
}

pub struct PartitionBatch<'a> {
    pub period: BillingPeriod,
    pub samples: Vec<&'a PromSample>,
}

/// Group samples by billing period, splitting batches that cross a month
/// boundary. Input is sorted by timestamp, so output batches are too.
pub fn split_by_billing_period(samples: &[PromSample]) -> Vec<PartitionBatch<'_>> {
    let mut batches: Vec<PartitionBatch<'_>> = Vec::new();
    for sample in samples {
        let period = BillingPeriod::containing(sample.timestamp);
        match batches.last_mut() {
            Some(batch) if batch.period == period => batch.samples.push(sample),
            _ => batches.push(PartitionBatch {
                period,
                samples: vec![sample],
            }),
        }
    }
    batches
}

/// `INSERT INTO <table> VALUES ...` with one row per sample:
/// `(amount, timestamp, timePrecision, labels, billing_period_start,
/// billing_period_end)`.
fn build_insert(table: &str, batch: &PartitionBatch<'_>, step: Duration) -> String {
    let precision = step.as_secs_f64();
    let rows = batch
        .samples
        .iter()
        .map(|sample| {
            format!(
                "({}, {}, {}, {}, '{}', '{}')",
                sample.value,
                timestamp_literal(sample.timestamp),
                precision,
                map_literal(&sample.labels),
                batch.period.start_str(),
                batch.period.end_str(),
            )
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {table} VALUES {rows}")
}

/// Presto map literal: `map(ARRAY['k'], ARRAY['v'])`.
fn map_literal(labels: &BTreeMap<String, String>) -> String {
    let keys = labels
        .keys()
        .map(|k| format!("'{}'", escape_sql(k)))
        .collect::<Vec<_>>()
        .join(", ");
    let values = labels
        .values()
        .map(|v| format!("'{}'", escape_sql(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("map(ARRAY[{keys}], ARRAY[{values}])")
}

fn escape_sql(s: &str) -> String {
    s.replace('\'', "''")
}

fn parse_presto_timestamp(s: &str) -> Option<DateTime<Utc>> {
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
        .or_else(|| {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(ts: DateTime<Utc>, value: f64) -> PromSample {
        let mut labels = BTreeMap::new();
        labels.insert("pod".to_string(), "api-0".to_string());
        PromSample {
            timestamp: ts,
            value,
            labels,
        }
    }

    #[test]
    fn test_billing_period_boundaries() {
        let t = Utc.with_ymd_and_hms(2019, 1, 15, 12, 0, 0).unwrap();
        let period = BillingPeriod::containing(t);
        assert_eq!(period.start_str(), "20190101");
        assert_eq!(period.end_str(), "20190201");
    }

    #[test]
    fn test_split_preserves_single_period() {
        let samples = vec![
            sample(Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap(), 1.0),
            sample(Utc.with_ymd_and_hms(2019, 1, 1, 0, 1, 0).unwrap(), 2.0),
        ];
        let batches = split_by_billing_period(&samples);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].samples.len(), 2);
    }

    #[test]
    fn test_split_at_month_boundary() {
        let samples = vec![
            sample(Utc.with_ymd_and_hms(2019, 1, 31, 23, 59, 0).unwrap(), 1.0),
            sample(Utc.with_ymd_and_hms(2019, 2, 1, 0, 0, 0).unwrap(), 2.0),
        ];
        let batches = split_by_billing_period(&samples);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].period.start_str(), "20190101");
        assert_eq!(batches[1].period.start_str(), "20190201");
    }

    #[test]
    fn test_insert_rows_carry_partition_values() {
        let samples = vec![sample(
            Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap(),
            0.5,
        )];
        let batches = split_by_billing_period(&samples);
        let sql = build_insert("datasource_metering_cpu", &batches[0], Duration::from_secs(60));
        assert_eq!(
            sql,
            "INSERT INTO datasource_metering_cpu VALUES \
             (0.5, timestamp '2019-01-01 00:00:00.000', 60, \
             map(ARRAY['pod'], ARRAY['api-0']), '20190101', '20190201')"
        );
    }

    #[test]
    fn test_label_values_escaped() {
        let mut labels = BTreeMap::new();
        labels.insert("note".to_string(), "it's".to_string());
        assert_eq!(
            map_literal(&labels),
            "map(ARRAY['note'], ARRAY['it''s'])"
        );
    }

    #[test]
    fn test_presto_timestamp_parsing() {
        let t = parse_presto_timestamp("2019-01-01 00:05:00.000").unwrap();
        assert_eq!(t, Utc.with_ymd_and_hms(2019, 1, 1, 0, 5, 0).unwrap());
    }
}
