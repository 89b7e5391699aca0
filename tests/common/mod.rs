// Shared test doubles: recording Presto/Hive connections and a scripted
// Prometheus querier.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chargeback::clients::hive::{HiveConnection, HiveConnectionFactory};
use chargeback::clients::presto::{PrestoConnection, PrestoConnectionFactory, Row};
use chargeback::clients::{PromQuerier, PromSample};
use chargeback::error::{MeteringError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

/// Records every statement; answers scripted results by SQL prefix,
/// empty row sets otherwise.
pub struct RecordingPresto {
    pub queries: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, Vec<Row>)>>,
    fail_prefixes: Mutex<Vec<String>>,
}

impl RecordingPresto {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            queries: Mutex::new(Vec::new()),
            responses: Mutex::new(Vec::new()),
            fail_prefixes: Mutex::new(Vec::new()),
        })
    }

    /// Answer queries starting with `prefix` with `rows`.
    pub fn respond(&self, prefix: &str, rows: Vec<Row>) {
        self.responses.lock().push((prefix.to_string(), rows));
    }

    /// Fail queries starting with `prefix`.
    pub fn fail_on(&self, prefix: &str) {
        self.fail_prefixes.lock().push(prefix.to_string());
    }

    pub fn recorded(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.queries
            .lock()
            .iter()
            .filter(|q| q.contains(needle))
            .count()
    }
}

#[async_trait]
impl PrestoConnection for RecordingPresto {
    async fn query(&self, sql: &str) -> Result<Vec<Row>> {
        self.queries.lock().push(sql.to_string());
        if self
            .fail_prefixes
            .lock()
            .iter()
            .any(|prefix| sql.starts_with(prefix.as_str()))
        {
            return Err(MeteringError::Query(format!("injected failure: {sql}")));
        }
        let responses = self.responses.lock();
        for (prefix, rows) in responses.iter() {
            if sql.starts_with(prefix.as_str()) {
                return Ok(rows.clone());
            }
        }
        Ok(Vec::new())
    }
}

pub struct RecordingPrestoFactory {
    conn: Arc<RecordingPresto>,
}

impl RecordingPrestoFactory {
    pub fn new(conn: Arc<RecordingPresto>) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl PrestoConnectionFactory for RecordingPrestoFactory {
    async fn connect(&self) -> Result<Arc<dyn PrestoConnection>> {
        Ok(Arc::clone(&self.conn) as Arc<dyn PrestoConnection>)
    }
}

/// Hive factory whose sessions record DDL into a shared log. Optionally
/// fails the first execute with a broken pipe to exercise reconnects.
pub struct ScriptedHiveFactory {
    pub ddl: Arc<Mutex<Vec<String>>>,
    pub connects: AtomicUsize,
    fail_next_execute: Arc<AtomicBool>,
}

impl ScriptedHiveFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ddl: Arc::new(Mutex::new(Vec::new())),
            connects: AtomicUsize::new(0),
            fail_next_execute: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn fail_next_execute(&self) {
        self.fail_next_execute.store(true, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn recorded(&self) -> Vec<String> {
        self.ddl.lock().clone()
    }

    pub fn count_matching(&self, needle: &str) -> usize {
        self.ddl
            .lock()
            .iter()
            .filter(|q| q.contains(needle))
            .count()
    }
}

#[async_trait]
impl HiveConnectionFactory for ScriptedHiveFactory {
    async fn connect(&self) -> Result<Box<dyn HiveConnection>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedHiveConnection {
            ddl: Arc::clone(&self.ddl),
            fail_next_execute: Arc::clone(&self.fail_next_execute),
        }))
    }
}

pub struct ScriptedHiveConnection {
    ddl: Arc<Mutex<Vec<String>>>,
    fail_next_execute: Arc<AtomicBool>,
}

#[async_trait]
impl HiveConnection for ScriptedHiveConnection {
    async fn execute(&mut self, sql: &str) -> Result<()> {
        if self.fail_next_execute.swap(false, Ordering::SeqCst) {
            return Err(MeteringError::BrokenPipe("connection reset by peer".into()));
        }
        self.ddl.lock().push(sql.to_string());
        Ok(())
    }

    async fn close(&mut self) {}
}

/// Scripted range-query responder recording every call.
pub struct FakeProm {
    pub calls: Mutex<Vec<(String, DateTime<Utc>, DateTime<Utc>)>>,
    samples: Mutex<Vec<PromSample>>,
}

impl FakeProm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            samples: Mutex::new(Vec::new()),
        })
    }

    pub fn push_sample(&self, timestamp: DateTime<Utc>, value: f64) {
        let mut labels = BTreeMap::new();
        labels.insert("pod".to_string(), "api-0".to_string());
        self.samples.lock().push(PromSample {
            timestamp,
            value,
            labels,
        });
    }

    pub fn recorded_calls(&self) -> Vec<(String, DateTime<Utc>, DateTime<Utc>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PromQuerier for FakeProm {
    async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        _step: Duration,
    ) -> Result<Vec<PromSample>> {
        self.calls.lock().push((query.to_string(), start, end));
        Ok(self
            .samples
            .lock()
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp < end)
            .cloned()
            .collect())
    }
}
