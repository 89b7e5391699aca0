use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Datelike, Months, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use super::{Metadata, ResourceKind, ResourceObject};

/// A recurring Report generator. The scheduled runner owns one fiber per
/// ScheduledReport and advances it through successive reporting windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledReport {
    pub metadata: Metadata,
    pub spec: ScheduledReportSpec,
    #[serde(default)]
    pub status: ScheduledReportStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReportSpec {
    /// Name of the ReportGenerationQuery to execute each window.
    pub generation_query: String,
    pub schedule: Schedule,
    /// Earliest instant the first window may start. Defaults to creation
    /// wall-clock time when unset.
    pub reporting_start: Option<DateTime<Utc>>,
    /// Parks the fiber without removing the registration.
    #[serde(default)]
    pub suspend: bool,
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    pub period: SchedulePeriod,
    /// Offset from the period boundary, in seconds.
    #[serde(default)]
    pub phase_seconds: u64,
}

impl Schedule {
    pub fn new(period: SchedulePeriod) -> Self {
        Self {
            period,
            phase_seconds: 0,
        }
    }

    pub fn phase(&self) -> Duration {
        Duration::from_secs(self.phase_seconds)
    }

    /// The earliest period boundary (plus phase) strictly after `after`.
    /// Reporting windows end on these boundaries.
    pub fn next_boundary(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let phase = chrono::Duration::seconds(self.phase_seconds as i64);
        let mut boundary = self.period.truncate(after) + phase;
        while boundary <= after {
            boundary = self.period.advance(boundary);
        }
        boundary
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulePeriod {
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl SchedulePeriod {
    /// Truncate `t` down to the enclosing period boundary. Weeks start on
    /// Monday; months on the first.
    pub fn truncate(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let day = Utc
            .with_ymd_and_hms(t.year(), t.month(), t.day(), 0, 0, 0)
            .unwrap();
        match self {
            SchedulePeriod::Hourly => day + chrono::Duration::hours(t.hour() as i64),
            SchedulePeriod::Daily => day,
            SchedulePeriod::Weekly => {
                day - chrono::Duration::days(t.weekday().num_days_from_monday() as i64)
            }
            SchedulePeriod::Monthly => Utc
                .with_ymd_and_hms(t.year(), t.month(), 1, 0, 0, 0)
                .unwrap(),
        }
    }

    /// One period after `t`. Monthly advancement is calendar-aware.
    pub fn advance(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            SchedulePeriod::Hourly => t + chrono::Duration::hours(1),
            SchedulePeriod::Daily => t + chrono::Duration::days(1),
            SchedulePeriod::Weekly => t + chrono::Duration::weeks(1),
            SchedulePeriod::Monthly => t
                .checked_add_months(Months::new(1))
                .unwrap_or(t + chrono::Duration::days(31)),
        }
    }
}

impl fmt::Display for SchedulePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SchedulePeriod::Hourly => "hourly",
            SchedulePeriod::Daily => "daily",
            SchedulePeriod::Weekly => "weekly",
            SchedulePeriod::Monthly => "monthly",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduledReportState {
    #[default]
    Disabled,
    Active,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledReportStatus {
    #[serde(default)]
    pub state: ScheduledReportState,
    /// End of the last successfully materialized window. Monotone
    /// non-decreasing, never ahead of the wall clock.
    pub last_report_time: Option<DateTime<Utc>>,
    /// Output table, shared by every window; created once.
    pub table_name: Option<String>,
    pub message: Option<String>,
}

impl ScheduledReport {
    pub fn new(metadata: Metadata, spec: ScheduledReportSpec) -> Self {
        Self {
            metadata,
            spec,
            status: ScheduledReportStatus::default(),
        }
    }
}

impl ResourceObject for ScheduledReport {
    const KIND: ResourceKind = ResourceKind::ScheduledReport;

    fn metadata(&self) -> &Metadata {
        &self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn test_hourly_truncate_and_advance() {
        let t = ts(2019, 1, 15, 10, 42, 7);
        assert_eq!(SchedulePeriod::Hourly.truncate(t), ts(2019, 1, 15, 10, 0, 0));
        assert_eq!(
            SchedulePeriod::Hourly.advance(ts(2019, 1, 15, 10, 0, 0)),
            ts(2019, 1, 15, 11, 0, 0)
        );
    }

    #[test]
    fn test_weekly_truncates_to_monday() {
        // 2019-01-17 was a Thursday.
        let t = ts(2019, 1, 17, 5, 0, 0);
        assert_eq!(SchedulePeriod::Weekly.truncate(t), ts(2019, 1, 14, 0, 0, 0));
    }

    #[test]
    fn test_monthly_advance_is_calendar_aware() {
        assert_eq!(
            SchedulePeriod::Monthly.advance(ts(2019, 1, 1, 0, 0, 0)),
            ts(2019, 2, 1, 0, 0, 0)
        );
        assert_eq!(
            SchedulePeriod::Monthly.advance(ts(2019, 12, 1, 0, 0, 0)),
            ts(2020, 1, 1, 0, 0, 0)
        );
    }

    #[test]
    fn test_next_boundary_is_strictly_after() {
        let schedule = Schedule::new(SchedulePeriod::Hourly);
        // On a boundary, the next boundary is one full period later.
        assert_eq!(
            schedule.next_boundary(ts(2019, 1, 15, 10, 0, 0)),
            ts(2019, 1, 15, 11, 0, 0)
        );
        // Mid-period, it is the enclosing period's end.
        assert_eq!(
            schedule.next_boundary(ts(2019, 1, 15, 10, 30, 0)),
            ts(2019, 1, 15, 11, 0, 0)
        );
    }

    #[test]
    fn test_next_boundary_honors_phase() {
        let schedule = Schedule {
            period: SchedulePeriod::Hourly,
            phase_seconds: 600,
        };
        assert_eq!(
            schedule.next_boundary(ts(2019, 1, 15, 10, 0, 0)),
            ts(2019, 1, 15, 10, 10, 0)
        );
        assert_eq!(
            schedule.next_boundary(ts(2019, 1, 15, 10, 10, 0)),
            ts(2019, 1, 15, 11, 10, 0)
        );
    }
}
