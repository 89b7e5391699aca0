// # Prometheus Client
//
// Range-query executor over the HTTP API. Samples come back flattened and
// sorted by timestamp so the Promsum collector can batch them by billing
// period without re-sorting.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;

use crate::error::{MeteringError, Result};

/// One sample from a range query.
#[derive(Debug, Clone, PartialEq)]
pub struct PromSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
}

#[async_trait]
pub trait PromQuerier: Send + Sync {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<PromSample>>;
}

pub struct PrometheusClient {
    http: reqwest::Client,
    base_url: String,
}

impl PrometheusClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    status: String,
    #[serde(default)]
    error: Option<String>,
    data: Option<RangeData>,
}

#[derive(Debug, Deserialize)]
struct RangeData {
    result: Vec<RangeSeries>,
}

#[derive(Debug, Deserialize)]
struct RangeSeries {
    metric: BTreeMap<String, String>,
    values: Vec<(f64, String)>,
}

#[async_trait]
impl PromQuerier for PrometheusClient {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<PromSample>> {
        let url = format!("{}/api/v1/query_range", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[
                ("query", query),
                ("start", &start.to_rfc3339()),
                ("end", &end.to_rfc3339()),
                ("step", &step.as_secs().to_string()),
            ])
            .send()
            .await
            .map_err(|e| MeteringError::Prometheus(format!("range query failed: {e}")))?;

        let body: RangeResponse = response
            .json()
            .await
            .map_err(|e| MeteringError::Prometheus(format!("malformed response: {e}")))?;

        if body.status != "success" {
            return Err(MeteringError::Prometheus(
                body.error.unwrap_or_else(|| "query returned non-success status".to_string()),
            ));
        }

        let data = body
            .data
            .ok_or_else(|| MeteringError::Prometheus("response missing data".to_string()))?;

        let mut samples = Vec::new();
        for series in data.result {
            for (ts, value) in series.values {
                let value: f64 = value
                    .parse()
                    .map_err(|_| MeteringError::Prometheus(format!("bad sample value: {value}")))?;
                let secs = ts.trunc() as i64;
                let nanos = ((ts - ts.trunc()) * 1e9) as u32;
                let timestamp = Utc
                    .timestamp_opt(secs, nanos)
                    .single()
                    .ok_or_else(|| MeteringError::Prometheus(format!("bad sample timestamp: {ts}")))?;
                samples.push(PromSample {
                    timestamp,
                    value,
                    labels: series.metric.clone(),
                });
            }
        }
        samples.sort_by_key(|s| s.timestamp);
        Ok(samples)
    }
}
