//! HTTP and hub handler definitions.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod commands;
pub mod health;
pub mod hub;

pub use commands::command_handler;
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use hub::hub_upgrade_handler;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;

use super::{ConnectionRegistry, NetworkConfig};
use crate::service::config::ServerConfig;
use crate::service::intercept::Interceptor;
use crate::service::middleware::InvocationPipeline;
use crate::storage::ExpiringStore;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references and cloneable pipelines so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Pipeline behind `POST /commands/{operation}`.
    pub commands: InvocationPipeline,
    /// One pipeline per hub name.
    pub hubs: Arc<HashMap<String, InvocationPipeline>>,
    /// Translates failures raised by HTTP handlers before the pipeline runs.
    pub http_interceptor: Arc<Interceptor>,
    /// Same for hub frames that never reach a pipeline.
    pub hub_interceptor: Arc<Interceptor>,
    /// Registry of all active hub connections.
    pub registry: Arc<ConnectionRegistry>,
    pub config: Arc<NetworkConfig>,
    pub server: Arc<ServerConfig>,
    /// Store used for health reporting; `None` when idempotency is disabled.
    pub store: Option<Arc<dyn ExpiringStore>>,
    pub store_backend: &'static str,
    /// Cancelled once shutdown begins; readiness reports 503 from then on.
    pub shutdown: CancellationToken,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::network::problem::HttpTransport;
    use crate::service::classify::hub_classifier;
    use crate::service::handler::handler_fn;
    use crate::service::intercept::TransportAdapter;
    use crate::service::invocation::Invocation;
    use crate::service::middleware::build_invocation_pipeline;
    use crate::service::router::InvocationRouter;
    use crate::storage::InMemoryIdempotencyStore;
    use outcome_core::{CommandError, IdempotencyStore};
    use serde_json::Value;

    /// `echo` returns its payload; `fail` raises a validation error.
    pub fn demo_router() -> InvocationRouter {
        InvocationRouter::new()
            .route(
                "echo",
                handler_fn(|inv: Invocation| async move { Ok::<_, anyhow::Error>(inv.payload) }),
            )
            .route(
                "fail",
                handler_fn(|_inv: Invocation| async move {
                    Err::<Value, _>(anyhow::Error::new(CommandError::validation(
                        "name", "is required",
                    )))
                }),
            )
    }

    /// State with an in-memory store, the demo router on both transports and
    /// one hub named `chat`.
    pub fn test_state(server: ServerConfig) -> (AppState, Arc<InMemoryIdempotencyStore>) {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        let commands_store: Arc<dyn IdempotencyStore> = store.clone();
        let expiring: Arc<dyn ExpiringStore> = store.clone();
        let http_interceptor = Arc::new(Interceptor::from_config(
            HttpTransport::classifier(),
            Some(Arc::clone(&commands_store)),
            &server,
        ));
        let hub_interceptor = Arc::new(Interceptor::from_config(
            hub_classifier(),
            Some(commands_store),
            &server,
        ));

        let commands =
            build_invocation_pipeline(demo_router(), Arc::clone(&http_interceptor), &server);
        let chat = build_invocation_pipeline(demo_router(), Arc::clone(&hub_interceptor), &server);
        let mut hubs = HashMap::new();
        hubs.insert("chat".to_string(), chat);

        let state = AppState {
            commands,
            hubs: Arc::new(hubs),
            http_interceptor,
            hub_interceptor,
            registry: Arc::new(ConnectionRegistry::new()),
            config: Arc::new(NetworkConfig::default()),
            server: Arc::new(server),
            store: Some(expiring),
            store_backend: "memory",
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        };
        (state, store)
    }
}
