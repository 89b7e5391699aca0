// # HTTP Introspection Surface
//
// Liveness and readiness endpoints. `/healthy` answers as soon as the
// process is up; `/ready` answers 200 only once the orchestrator has marked
// itself initialized.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;

use crate::error::Result;

/// Shared readiness flag, flipped by the orchestrator at the end of
/// startup.
pub struct HealthState {
    initialized: Mutex<bool>,
}

impl HealthState {
    pub fn new() -> Self {
        Self {
            initialized: Mutex::new(false),
        }
    }

    pub fn set_initialized(&self, value: bool) {
        *self.initialized.lock() = value;
    }

    pub fn initialized(&self) -> bool {
        *self.initialized.lock()
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

pub fn router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthy", get(healthy))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn healthy() -> &'static str {
    "ok"
}

async fn ready(State(state): State<Arc<HealthState>>) -> (StatusCode, &'static str) {
    if state.initialized() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Serve until the stop signal fires.
pub async fn serve(
    address: &str,
    state: Arc<HealthState>,
    stop: watch::Receiver<bool>,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address, "http server listening");
    let mut stop = stop;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = stop.changed().await;
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_flips_with_flag() {
        let state = HealthState::new();
        assert!(!state.initialized());
        state.set_initialized(true);
        assert!(state.initialized());
    }
}
