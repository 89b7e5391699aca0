// # Scheduled Report Runner
//
// One fiber per active ScheduledReport. Each fiber advances its report
// through successive reporting windows in wall-clock time: sleep until the
// window closes (plus jitter), materialize it through the shared report
// execution path, patch `last_report_time`, repeat. Windows behind the
// clock are caught up back-to-back before the fiber sleeps again.
//
// A fiber processes its windows strictly serially, so no two overlapping
// windows for the same ScheduledReport ever run concurrently, and
// `last_report_time` never advances past the wall clock.

use std::cmp::max;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{jitter, SharedClock};
use crate::error::{MeteringError, Result};
use crate::reconcilers::ReportExecutor;
use crate::resources::{
    Metadata, Report, ReportSpec, ResourceObject, ScheduledReport, ScheduledReportState,
};
use crate::store::ResourceStore;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Uniform wakeup jitter after a window closes.
    pub jitter_max: Duration,
    /// First retry delay after a window fails.
    pub backoff_base: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
    /// Consecutive failures tolerated per window before surfacing Failed.
    pub retry_budget: u32,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            jitter_max: Duration::from_secs(60),
            backoff_base: Duration::from_secs(15),
            backoff_max: Duration::from_secs(300),
            retry_budget: 10,
        }
    }
}

struct Fiber {
    fingerprint: String,
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct ScheduledRunner {
    inner: Arc<RunnerInner>,
}

struct RunnerInner {
    scheduled_reports: Arc<ResourceStore<ScheduledReport>>,
    executor: Arc<ReportExecutor>,
    clock: SharedClock,
    stop: watch::Receiver<bool>,
    config: RunnerConfig,
    fibers: DashMap<String, Fiber>,
}

impl ScheduledRunner {
    pub fn new(
        scheduled_reports: Arc<ResourceStore<ScheduledReport>>,
        executor: Arc<ReportExecutor>,
        clock: SharedClock,
        stop: watch::Receiver<bool>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                scheduled_reports,
                executor,
                clock,
                stop,
                config,
                fibers: DashMap::new(),
            }),
        }
    }

    /// Register or update a ScheduledReport. Re-registration with an
    /// unchanged spec is a no-op; a changed spec restarts the fiber.
    pub fn register(&self, report: &ScheduledReport) {
        let key = report.key();
        let fingerprint =
            serde_json::to_string(&report.spec).unwrap_or_else(|_| String::from("unfingerprintable"));

        if let Some(existing) = self.inner.fibers.get(&key) {
            if existing.fingerprint == fingerprint {
                return;
            }
        }
        self.deregister(&key);

        let (cancel, cancelled) = watch::channel(false);
        let inner = Arc::clone(&self.inner);
        let fiber_key = key.clone();
        let handle = tokio::spawn(async move {
            run_fiber(inner, fiber_key, cancelled).await;
        });
        self.inner.fibers.insert(
            key.clone(),
            Fiber {
                fingerprint,
                cancel,
                handle,
            },
        );
        debug!(%key, "scheduled report fiber registered");
    }

    /// Cancel a fiber cooperatively; it exits at its next suspension point.
    pub fn deregister(&self, key: &str) {
        if let Some((_, fiber)) = self.inner.fibers.remove(key) {
            let _ = fiber.cancel.send(true);
            debug!(key, "scheduled report fiber deregistered");
        }
    }

    pub fn active_fibers(&self) -> usize {
        self.inner.fibers.len()
    }

    /// Cancel every fiber and wait for them to exit.
    pub async fn shutdown(&self) {
        let keys: Vec<String> = self.inner.fibers.iter().map(|f| f.key().clone()).collect();
        let mut handles = Vec::new();
        for key in keys {
            if let Some((_, fiber)) = self.inner.fibers.remove(&key) {
                let _ = fiber.cancel.send(true);
                handles.push(fiber.handle);
            }
        }
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// The per-report scheduling loop.
async fn run_fiber(inner: Arc<RunnerInner>, key: String, cancelled: watch::Receiver<bool>) {
    let mut cancelled = cancelled;
    let mut stop = inner.stop.clone();
    let mut attempts: u32 = 0;

    loop {
        if *cancelled.borrow() || *stop.borrow() {
            return;
        }

        let report = match inner.scheduled_reports.get_key(&key) {
            Ok(report) => report,
            Err(_) => return,
        };
        if report.spec.suspend {
            return;
        }

        let now = inner.clock.now();
        let window_start = next_window_start(&report, now);
        let window_end = report.spec.schedule.next_boundary(window_start);

        if window_end > now {
            // Window still open: sleep until it closes, spread by jitter.
            let wait = duration_until(now, window_end) + jitter(inner.config.jitter_max);
            tokio::select! {
                _ = tokio::time::sleep(wait) => continue,
                _ = cancelled.changed() => return,
                _ = stop.changed() => return,
            }
        }

        match materialize_window(&inner, &report, window_start, window_end).await {
            Ok(()) => {
                attempts = 0;
                info!(%key, %window_start, %window_end, "scheduled window materialized");
            }
            Err(MeteringError::Shutdown) => return,
            Err(err) if err.is_terminal() || attempts + 1 >= inner.config.retry_budget => {
                warn!(%key, %err, attempts, "scheduled report failed");
                let _ = inner.scheduled_reports.update(&key, |r| {
                    r.status.state = ScheduledReportState::Failed;
                    r.status.message = Some(err.to_string());
                });
                return;
            }
            Err(err) => {
                attempts += 1;
                let backoff = inner
                    .config
                    .backoff_base
                    .saturating_mul(2u32.saturating_pow(attempts - 1))
                    .min(inner.config.backoff_max);
                warn!(%key, %err, attempts, ?backoff, "scheduled window failed, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancelled.changed() => return,
                    _ = stop.changed() => return,
                }
            }
        }
    }
}

/// `window_start = max(spec.reporting_start, status.last_report_time)`.
/// With neither set, the current period is the first window.
fn next_window_start(report: &ScheduledReport, now: DateTime<Utc>) -> DateTime<Utc> {
    match (report.spec.reporting_start, report.status.last_report_time) {
        (Some(start), Some(last)) => max(start, last),
        (Some(start), None) => start,
        (None, Some(last)) => last,
        (None, None) => report.spec.schedule.period.truncate(now),
    }
}

fn duration_until(now: DateTime<Utc>, until: DateTime<Utc>) -> Duration {
    (until - now).to_std().unwrap_or(Duration::ZERO)
}

/// Synthesize an ephemeral Report for the window and run it through the
/// shared execution path: validate, resolve dependencies, create the output
/// table once, insert.
async fn materialize_window(
    inner: &Arc<RunnerInner>,
    report: &ScheduledReport,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> Result<()> {
    let mut ephemeral = Report::new(
        Metadata::new(
            report.metadata.namespace.clone(),
            report.metadata.name.clone(),
        ),
        ReportSpec {
            generation_query: report.spec.generation_query.clone(),
            reporting_start: window_start,
            reporting_end: window_end,
            inputs: report.spec.inputs.clone(),
        },
    );
    // Reuse the recorded output table so creation happens once across
    // windows and operator restarts.
    ephemeral.status.table_name = report.status.table_name.clone();

    let query = inner.executor.validate(&ephemeral)?;
    inner.executor.check_dependencies(&ephemeral, &query)?;
    let table = inner.executor.ensure_output_table(&ephemeral, &query).await?;
    inner.executor.execute(&ephemeral, &query, &table).await?;

    inner.scheduled_reports.update(&report.key(), |r| {
        r.status.state = ScheduledReportState::Active;
        r.status.table_name = Some(table.clone());
        r.status.last_report_time = Some(match r.status.last_report_time {
            Some(existing) => max(existing, window_end),
            None => window_end,
        });
    })?;
    Ok(())
}
