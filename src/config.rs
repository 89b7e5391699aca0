// # Operator Configuration
//
// Central configuration for the metering operator. Every knob can be set
// through a `METERING_*` environment variable; unset variables fall back to
// the defaults below.

use std::env;
use std::time::Duration;

/// Operator configuration
#[derive(Debug, Clone)]
pub struct OperatorConfig {
    // Scope
    pub namespace: String,

    // Endpoints
    pub hive_host: String,
    pub presto_host: String,
    pub prometheus_host: String,

    // Query echoing
    pub log_reports: bool,
    pub log_dml_queries: bool,
    pub log_ddl_queries: bool,

    // Promsum collector
    pub disable_promsum: bool,
    pub promsum_interval: Duration,
    pub promsum_step_size: Duration,
    pub promsum_chunk_size: Duration,

    // Controller machinery
    pub resync_interval: Duration,
    pub workers_per_kind: usize,
    pub max_requeues: u32,

    // HTTP surface
    pub api_listen_address: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: "metering".to_string(),

            hive_host: "hive:10000".to_string(),
            presto_host: "presto:8080".to_string(),
            prometheus_host: "http://prometheus:9090".to_string(),

            log_reports: false,
            log_dml_queries: false,
            log_ddl_queries: false,

            disable_promsum: false,
            promsum_interval: Duration::from_secs(30),
            promsum_step_size: Duration::from_secs(60),
            promsum_chunk_size: Duration::from_secs(300),

            resync_interval: Duration::from_secs(60),
            workers_per_kind: 2,
            max_requeues: 5,

            api_listen_address: "0.0.0.0:8080".to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the environment, falling back to defaults for
    /// anything unset or unparseable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("METERING_NAMESPACE") {
            config.namespace = v;
        }
        if let Ok(v) = env::var("METERING_HIVE_HOST") {
            config.hive_host = v;
        }
        if let Ok(v) = env::var("METERING_PRESTO_HOST") {
            config.presto_host = v;
        }
        if let Ok(v) = env::var("METERING_PROMETHEUS_HOST") {
            config.prometheus_host = v;
        }
        if let Ok(v) = env::var("METERING_API_LISTEN_ADDRESS") {
            config.api_listen_address = v;
        }

        config.log_reports = env_bool("METERING_LOG_REPORTS", config.log_reports);
        config.log_dml_queries = env_bool("METERING_LOG_DML_QUERIES", config.log_dml_queries);
        config.log_ddl_queries = env_bool("METERING_LOG_DDL_QUERIES", config.log_ddl_queries);
        config.disable_promsum = env_bool("METERING_DISABLE_PROMSUM", config.disable_promsum);

        config.promsum_interval = env_secs("METERING_PROMSUM_INTERVAL", config.promsum_interval);
        config.promsum_step_size = env_secs("METERING_PROMSUM_STEP_SIZE", config.promsum_step_size);
        config.promsum_chunk_size = env_secs("METERING_PROMSUM_CHUNK_SIZE", config.promsum_chunk_size);
        config.resync_interval = env_secs("METERING_RESYNC_INTERVAL", config.resync_interval);

        if let Some(v) = env_u64("METERING_WORKERS_PER_KIND") {
            config.workers_per_kind = v as usize;
        }
        if let Some(v) = env_u64("METERING_MAX_REQUEUES") {
            config.max_requeues = v as u32;
        }

        config
    }
}

fn env_bool(key: &str, fallback: bool) -> bool {
    match env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => fallback,
    }
}

fn env_secs(key: &str, fallback: Duration) -> Duration {
    env_u64(key).map(Duration::from_secs).unwrap_or(fallback)
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OperatorConfig::default();
        assert_eq!(config.promsum_interval, Duration::from_secs(30));
        assert_eq!(config.promsum_step_size, Duration::from_secs(60));
        assert_eq!(config.promsum_chunk_size, Duration::from_secs(300));
        assert_eq!(config.workers_per_kind, 2);
        assert_eq!(config.max_requeues, 5);
        assert!(!config.disable_promsum);
    }
}
