//! Network module with deferred startup lifecycle.
//!
//! Implements the deferred startup pattern: `new()` creates resources,
//! `start()` binds the TCP listener, and `serve()` starts accepting
//! connections. Between the two, callers can hand the registry or the
//! shutdown token to other parts of the process.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::config::NetworkConfig;
use super::connection::ConnectionRegistry;
use super::handlers::hub::HubTransport;
use super::handlers::{
    command_handler, health_handler, hub_upgrade_handler, liveness_handler, readiness_handler,
    AppState,
};
use super::middleware::build_http_layers;
use super::problem::HttpTransport;
use crate::service::config::ServerConfig;
use crate::service::intercept::{Interceptor, TransportAdapter};
use crate::service::middleware::build_invocation_pipeline;
use crate::service::router::InvocationRouter;
use crate::service::worker::BackgroundWorker;
use crate::storage::{ExpirySweeper, StoreHandle};

/// Operations served over HTTP and the hubs served over WebSocket.
#[derive(Clone, Default)]
pub struct Endpoints {
    commands: InvocationRouter,
    hubs: BTreeMap<String, InvocationRouter>,
}

impl Endpoints {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Router behind `POST /commands/{operation}`.
    #[must_use]
    pub fn commands(mut self, router: InvocationRouter) -> Self {
        self.commands = router;
        self
    }

    /// Register a hub at `GET /hubs/{name}`; its methods are the router's operations.
    #[must_use]
    pub fn hub(mut self, name: impl Into<String>, router: InvocationRouter) -> Self {
        self.hubs.insert(name.into(), router);
        self
    }

    pub fn hub_names(&self) -> impl Iterator<Item = &str> {
        self.hubs.keys().map(String::as_str)
    }
}

/// Manages the full HTTP/WebSocket server lifecycle.
///
/// Follows the deferred startup pattern:
/// 1. `new()` -- allocates shared state (registry, shutdown token)
/// 2. `start()` -- binds TCP listener to the configured address
/// 3. `serve()` -- begins accepting connections until shutdown is signalled
pub struct NetworkModule {
    config: NetworkConfig,
    server: ServerConfig,
    endpoints: Endpoints,
    store: Option<StoreHandle>,
    listener: Option<TcpListener>,
    registry: Arc<ConnectionRegistry>,
    shutdown: CancellationToken,
    start_time: Instant,
}

impl NetworkModule {
    /// Creates a new network module without binding any port.
    ///
    /// `store` is shared by both transports; `None` disables idempotency.
    #[must_use]
    pub fn new(
        config: NetworkConfig,
        server: ServerConfig,
        endpoints: Endpoints,
        store: Option<StoreHandle>,
    ) -> Self {
        Self {
            config,
            server,
            endpoints,
            store,
            listener: None,
            registry: Arc::new(ConnectionRegistry::new()),
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }

    /// Returns a shared reference to the hub connection registry.
    #[must_use]
    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    /// Cancelling this token starts a graceful shutdown of `serve()`.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    fn app_state(&self) -> AppState {
        let commands_store = self.store.as_ref().map(|s| Arc::clone(&s.commands));
        let http_interceptor = Arc::new(Interceptor::from_config(
            HttpTransport::classifier(),
            commands_store.clone(),
            &self.server,
        ));
        let hub_interceptor = Arc::new(Interceptor::from_config(
            HubTransport::classifier(),
            commands_store,
            &self.server,
        ));

        let commands = build_invocation_pipeline(
            self.endpoints.commands.clone(),
            Arc::clone(&http_interceptor),
            &self.server,
        );
        let hubs: HashMap<_, _> = self
            .endpoints
            .hubs
            .iter()
            .map(|(name, router)| {
                let pipeline = build_invocation_pipeline(
                    router.clone(),
                    Arc::clone(&hub_interceptor),
                    &self.server,
                );
                (name.clone(), pipeline)
            })
            .collect();

        AppState {
            commands,
            hubs: Arc::new(hubs),
            http_interceptor,
            hub_interceptor,
            registry: Arc::clone(&self.registry),
            config: Arc::new(self.config.clone()),
            server: Arc::new(self.server.clone()),
            store: self.store.as_ref().map(|s| Arc::clone(&s.expiring)),
            store_backend: self.store.as_ref().map_or("disabled", |s| s.backend),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
        }
    }

    /// Assembles the axum router with all routes and middleware.
    ///
    /// Routes:
    /// - `POST /commands/{operation}` -- run a command
    /// - `GET /hubs/{hub}` -- hub WebSocket upgrade
    /// - `GET /health` -- detailed health JSON
    /// - `GET /health/live` -- Kubernetes liveness probe
    /// - `GET /health/ready` -- Kubernetes readiness probe
    pub fn build_router(&self) -> Router {
        Router::new()
            .route("/commands/{operation}", post(command_handler))
            .route("/hubs/{hub}", get(hub_upgrade_handler))
            .route("/health", get(health_handler))
            .route("/health/live", get(liveness_handler))
            .route("/health/ready", get(readiness_handler))
            .layer(DefaultBodyLimit::max(self.config.max_body_bytes))
            .layer(build_http_layers(&self.config))
            .with_state(self.app_state())
    }

    /// Binds the TCP listener to the configured host and port.
    ///
    /// Returns the actual bound port, which may differ from the configured
    /// port when port 0 is used (OS-assigned ephemeral port).
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound (e.g., port in use).
    pub async fn start(&mut self) -> anyhow::Result<u16> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let port = listener.local_addr()?.port();

        info!("TCP listener bound to {}:{}", self.config.host, port);

        self.listener = Some(listener);
        Ok(port)
    }

    /// Serves connections until `shutdown` resolves or the shutdown token
    /// is cancelled.
    ///
    /// Consumes `self` because the listener is moved into the server. The
    /// expiry sweeper runs for as long as the server does.
    ///
    /// After the shutdown signal:
    /// 1. Readiness turns 503 and every hub connection receives a Close frame
    /// 2. In-flight HTTP requests finish
    /// 3. Waits up to `drain_timeout` for hub connections to go away
    /// 4. The sweeper is stopped
    ///
    /// # Errors
    ///
    /// Returns an error if `start()` was not called first or the server
    /// encounters a fatal I/O error.
    pub async fn serve(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = self.build_router();
        let Some(listener) = self.listener else {
            anyhow::bail!("start() must be called before serve()");
        };

        let mut sweeper = self.store.as_ref().map(|store| {
            BackgroundWorker::start(
                ExpirySweeper::new(Arc::clone(&store.expiring), self.server.expiry_policy()),
                Duration::from_millis(self.server.sweep_interval_ms),
            )
        });

        let registry = Arc::clone(&self.registry);
        let token = self.shutdown.clone();
        let signal = async move {
            tokio::select! {
                () = shutdown => {}
                () = token.cancelled() => {}
            }
            token.cancel();
            let closing = registry.close_all("server shutting down");
            info!(connections = closing, "shutdown signalled, closing hub connections");
        };

        info!("Serving HTTP and hub connections");
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await;

        if self.registry.wait_until_empty(self.config.drain_timeout).await {
            info!("All connections drained successfully");
        } else {
            warn!(
                remaining = self.registry.count(),
                "Drain timeout expired with hub connections remaining"
            );
        }
        if let Some(worker) = sweeper.as_mut() {
            worker.stop().await;
        }

        served?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use futures_util::StreamExt;
    use outcome_core::IdempotencyStore;
    use serde_json::Value;
    use tokio_tungstenite::tungstenite::Message as ClientMessage;
    use tower::ServiceExt;

    use super::*;
    use crate::network::handlers::test_support::demo_router;
    use crate::storage::{open_store, StoreBackend};

    fn module(store: Option<StoreHandle>) -> NetworkModule {
        let config = NetworkConfig {
            host: "127.0.0.1".to_string(),
            drain_timeout: Duration::from_secs(5),
            ..NetworkConfig::default()
        };
        let endpoints = Endpoints::new()
            .commands(demo_router())
            .hub("chat", demo_router());
        NetworkModule::new(config, ServerConfig::default(), endpoints, store)
    }

    fn memory_store() -> StoreHandle {
        open_store(&StoreBackend::Memory).unwrap().unwrap()
    }

    async fn get_json(router: Router, uri: &str) -> (StatusCode, Value) {
        let response = router
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    #[test]
    fn endpoints_list_hubs() {
        let endpoints = Endpoints::new()
            .hub("b", InvocationRouter::new())
            .hub("a", InvocationRouter::new());
        assert_eq!(endpoints.hub_names().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn registry_returns_shared_arc() {
        let module = module(None);
        assert!(Arc::ptr_eq(&module.registry(), &module.registry()));
        assert!(module.listener.is_none());
    }

    #[tokio::test]
    async fn tracked_commands_land_in_the_shared_store() {
        let store = memory_store();
        let commands = Arc::clone(&store.commands);
        let router = module(Some(store)).build_router();

        let response = router
            .clone()
            .oneshot(
                Request::post("/commands/echo")
                    .header("content-type", "application/json")
                    .header("idempotency-key", "k-1")
                    .body(Body::from(r#"{"value": 5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));

        let status = commands
            .command_status(
                &outcome_core::CommandId::parse("k-1").unwrap(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(status, outcome_core::CommandExecutionStatus::Completed);

        let (status, health) = get_json(router, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["commands"], 1);
        assert_eq!(health["storeBackend"], "memory");
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let mut module = module(None);
        module.config.max_body_bytes = 16;
        let response = module
            .build_router()
            .oneshot(
                Request::post("/commands/echo")
                    .header("content-type", "application/json")
                    .body(Body::from(format!(r#"{{"value": "{}"}}"#, "x".repeat(64))))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(response.status().is_client_error());
    }

    #[tokio::test]
    async fn start_binds_to_os_assigned_port() {
        let mut module = module(None);
        let port = module.start().await.unwrap();
        assert!(port > 0, "OS-assigned port should be > 0");
        assert!(module.listener.is_some());
    }

    #[tokio::test]
    async fn serve_requires_start() {
        let err = module(None)
            .serve(std::future::pending::<()>())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("start()"));
    }

    #[tokio::test]
    async fn shutdown_closes_hub_connections() {
        let mut module = module(Some(memory_store()));
        let port = module.start().await.unwrap();
        let token = module.shutdown_token();
        let registry = module.registry();
        let server = tokio::spawn(module.serve(std::future::pending::<()>()));

        let url = format!("ws://127.0.0.1:{port}/hubs/chat");
        let (mut socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        while registry.count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        token.cancel();
        let close = loop {
            match socket.next().await {
                Some(Ok(ClientMessage::Close(frame))) => break frame,
                Some(Ok(_)) => {}
                other => panic!("expected a close frame, got {other:?}"),
            }
        };
        assert_eq!(close.unwrap().reason.as_str(), "server shutting down");

        drop(socket);
        server.await.unwrap().unwrap();
        assert_eq!(registry.count(), 0);
    }
}
