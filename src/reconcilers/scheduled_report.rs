// # ScheduledReport Reconciler
//
// Bridges watch events to the scheduled runner: registers fibers for live
// ScheduledReports, parks suspended ones, and removes registrations on
// deletion. Status reflects Active/Disabled; the runner itself patches
// Failed when a fiber exhausts its retry budget.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::Reconciler;
use crate::error::Result;
use crate::resources::{ResourceKind, ScheduledReport, ScheduledReportState};
use crate::schedule::ScheduledRunner;
use crate::store::ResourceStore;

pub struct ScheduledReportReconciler {
    scheduled_reports: Arc<ResourceStore<ScheduledReport>>,
    runner: Arc<ScheduledRunner>,
}

impl ScheduledReportReconciler {
    pub fn new(
        scheduled_reports: Arc<ResourceStore<ScheduledReport>>,
        runner: Arc<ScheduledRunner>,
    ) -> Self {
        Self {
            scheduled_reports,
            runner,
        }
    }
}

#[async_trait]
impl Reconciler for ScheduledReportReconciler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ScheduledReport
    }

    async fn sync(&self, key: &str) -> Result<()> {
        let report = match self.scheduled_reports.get_key(key) {
            Ok(report) => report,
            Err(_) => {
                self.runner.deregister(key);
                debug!(key, "scheduled report deleted, fiber cancelled");
                return Ok(());
            }
        };

        if report.spec.suspend {
            self.runner.deregister(key);
            if report.status.state != ScheduledReportState::Disabled {
                self.scheduled_reports.update(key, |r| {
                    r.status.state = ScheduledReportState::Disabled;
                })?;
            }
            return Ok(());
        }

        self.runner.register(&report);
        if report.status.state == ScheduledReportState::Disabled {
            self.scheduled_reports.update(key, |r| {
                r.status.state = ScheduledReportState::Active;
            })?;
        }
        Ok(())
    }
}
