//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose server health information for orchestrators
//! (Kubernetes, load balancers) and operational monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

use super::AppState;

/// Returns detailed health information as JSON.
///
/// Always returns 200. `status` is `"draining"` once shutdown has begun and
/// `commands` is `null` when no store is configured or it cannot be read.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    let commands = match &state.store {
        Some(store) => match store.command_count().await {
            Ok(count) => Some(count),
            Err(err) => {
                warn!(error = %err, "health check could not count stored commands");
                None
            }
        },
        None => None,
    };
    let mut hubs: Vec<&str> = state.hubs.keys().map(String::as_str).collect();
    hubs.sort_unstable();
    let status = if state.shutdown.is_cancelled() {
        "draining"
    } else {
        "ready"
    };

    Json(json!({
        "status": status,
        "commands": commands,
        "storeBackend": state.store_backend,
        "hubConnections": state.registry.count(),
        "hubs": hubs,
        "uptimeSecs": state.start_time.elapsed().as_secs(),
    }))
}

/// Kubernetes liveness probe -- always returns 200 OK.
///
/// The liveness probe only checks whether the process is running and
/// responsive. It intentionally does not check downstream dependencies,
/// because a failed liveness probe triggers a pod restart.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Kubernetes readiness probe -- 503 once shutdown has begun.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.is_cancelled() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

#[cfg(test)]
mod tests {
    use outcome_core::{CommandExecutionStatus, CommandId, IdempotencyStore};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::network::handlers::test_support::test_state;
    use crate::network::ConnectionConfig;
    use crate::service::config::ServerConfig;

    #[tokio::test]
    async fn health_reports_store_and_connections() {
        let (state, store) = test_state(ServerConfig::default());
        store
            .set_command_status(
                &CommandId::parse("a").unwrap(),
                CommandExecutionStatus::InProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let (_handle, _rx) = state.registry.register("chat", &ConnectionConfig::default());

        let Json(json) = health_handler(State(state)).await;
        assert_eq!(json["status"], "ready");
        assert_eq!(json["commands"], 1);
        assert_eq!(json["storeBackend"], "memory");
        assert_eq!(json["hubConnections"], 1);
        assert_eq!(json["hubs"], json!(["chat"]));
        assert!(json["uptimeSecs"].is_number());
    }

    #[tokio::test]
    async fn health_without_store_reports_null_commands() {
        let (mut state, _) = test_state(ServerConfig::default());
        state.store = None;
        state.store_backend = "disabled";

        let Json(json) = health_handler(State(state)).await;
        assert!(json["commands"].is_null());
        assert_eq!(json["storeBackend"], "disabled");
    }

    #[tokio::test]
    async fn liveness_handler_always_returns_200() {
        assert_eq!(liveness_handler().await, StatusCode::OK);
    }

    #[tokio::test]
    async fn readiness_flips_when_shutdown_begins() {
        let (state, _) = test_state(ServerConfig::default());
        assert_eq!(readiness_handler(State(state.clone())).await, StatusCode::OK);

        state.shutdown.cancel();
        assert_eq!(
            readiness_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        let Json(json) = health_handler(State(state)).await;
        assert_eq!(json["status"], "draining");
    }
}
