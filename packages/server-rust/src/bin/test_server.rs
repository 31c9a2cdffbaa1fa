//! Demo server exposing a few commands, one hub and one actor-backed
//! operation. Used for manual and integration testing of the transports.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use outcome_core::{Command, CommandError};
use outcome_server::actor::{Actor, ActorError, ActorHost, ActorRef};
use outcome_server::network::{Endpoints, NetworkConfig, NetworkModule};
use outcome_server::service::{
    handler_fn, typed_handler, InProgressPolicy, Invocation, InvocationContext, InvocationRouter,
    ServerConfig,
};
use outcome_server::storage::{open_store, StoreBackend};
use outcome_server::telemetry::{init_tracing, LogFormat};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum StoreKind {
    Disabled,
    Memory,
    Redb,
}

#[derive(Debug, Parser)]
#[command(name = "test-server", about = "Outcome demo server")]
struct Cli {
    #[arg(long, env = "OUTCOME_HOST", default_value = "127.0.0.1")]
    host: String,
    #[arg(long, env = "OUTCOME_PORT", default_value_t = 8080)]
    port: u16,
    #[arg(long, env = "OUTCOME_STORE", value_enum, default_value = "memory")]
    store: StoreKind,
    /// redb file used with `--store redb`.
    #[arg(long, env = "OUTCOME_STORE_PATH", default_value = "outcome.redb")]
    store_path: PathBuf,
    #[arg(long, env = "OUTCOME_LOG_FORMAT", value_enum, default_value = "pretty")]
    log_format: LogFormat,
    #[arg(long, env = "OUTCOME_LOG", default_value = "info,outcome_server=debug")]
    log_filter: String,
    /// Attach inner errors and stack traces to failures.
    #[arg(long, env = "OUTCOME_ERROR_DETAILS")]
    include_error_details: bool,
    /// Wait this long for an in-progress duplicate instead of answering 409.
    #[arg(long, env = "OUTCOME_IN_PROGRESS_WAIT_MS")]
    in_progress_wait_ms: Option<u64>,
    /// Assign an idempotency key to HTTP commands that arrive without one.
    #[arg(long, env = "OUTCOME_GENERATE_IDS")]
    generate_ids: bool,
    #[arg(long, env = "OUTCOME_INVOCATION_TIMEOUT_MS", default_value_t = 30_000)]
    invocation_timeout_ms: u64,
    #[arg(long, env = "OUTCOME_MAX_CONCURRENT", default_value_t = 1000)]
    max_concurrent: u32,
    #[arg(long, env = "OUTCOME_RETENTION_SECS", default_value_t = 86_400)]
    retention_secs: u64,
    /// Evict commands left `InProgress` by abandoned calls after this long.
    #[arg(long, env = "OUTCOME_IN_PROGRESS_TTL_SECS", default_value_t = 600)]
    in_progress_ttl_secs: u64,
}

impl Cli {
    fn store_backend(&self) -> anyhow::Result<StoreBackend> {
        Ok(match self.store {
            StoreKind::Disabled => StoreBackend::Disabled,
            StoreKind::Memory => StoreBackend::Memory,
            #[cfg(feature = "redb")]
            StoreKind::Redb => StoreBackend::Redb(self.store_path.clone()),
            #[cfg(not(feature = "redb"))]
            StoreKind::Redb => anyhow::bail!("built without the `redb` feature"),
        })
    }

    fn server_config(&self) -> ServerConfig {
        let in_progress_policy = match self.in_progress_wait_ms {
            Some(ms) => InProgressPolicy::Wait {
                timeout: Duration::from_millis(ms),
                poll_interval: Duration::from_millis(25),
            },
            None => InProgressPolicy::Reject,
        };
        ServerConfig {
            default_invocation_timeout_ms: self.invocation_timeout_ms,
            max_concurrent_invocations: self.max_concurrent,
            include_error_details: self.include_error_details,
            in_progress_policy,
            generate_missing_command_ids: self.generate_ids,
            command_retention_ms: self.retention_secs.saturating_mul(1000),
            in_progress_ttl_ms: self.in_progress_ttl_secs.saturating_mul(1000),
            ..ServerConfig::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct AddRequest {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize)]
struct AddResponse {
    sum: i64,
}

#[derive(Debug, Deserialize)]
struct SleepRequest {
    ms: u64,
}

/// Running total kept by a single actor.
#[derive(Default)]
struct Counter {
    total: i64,
}

#[async_trait]
impl Actor for Counter {
    fn actor_type(&self) -> &'static str {
        "Counter"
    }

    async fn handle(&mut self, method: &str, payload: Value) -> anyhow::Result<Value> {
        match method {
            "add" => {
                let amount = payload
                    .as_i64()
                    .ok_or_else(|| CommandError::validation("amount", "must be an integer"))?;
                self.total += amount;
                Ok(json!(self.total))
            }
            "get" => Ok(json!(self.total)),
            other => Err(ActorError::unknown_method(self.actor_type(), other).into()),
        }
    }
}

fn commands(counter: ActorRef) -> InvocationRouter {
    InvocationRouter::new()
        .route(
            "echo",
            handler_fn(|inv: Invocation| async move { Ok::<_, anyhow::Error>(inv.payload) }),
        )
        .route(
            "add",
            typed_handler(|_ctx: InvocationContext, req: AddRequest| async move {
                let sum = req
                    .a
                    .checked_add(req.b)
                    .ok_or_else(|| CommandError::validation("b", "sum overflows"))?;
                Ok::<_, anyhow::Error>(AddResponse { sum })
            }),
        )
        .route(
            "sleep",
            typed_handler(|_ctx: InvocationContext, req: SleepRequest| async move {
                tokio::time::sleep(Duration::from_millis(req.ms)).await;
                Ok::<_, anyhow::Error>(json!({"slept": req.ms}))
            }),
        )
        .route(
            "fail",
            handler_fn(|_inv: Invocation| async move {
                Err::<Value, _>(anyhow::Error::new(CommandError::Fault {
                    reason: "requested failure".to_string(),
                }))
            }),
        )
        .route(
            "counter.add",
            handler_fn(move |inv: Invocation| {
                let counter = counter.clone();
                async move {
                    // The HTTP call is already tracked, so the actor call is not.
                    let outcome = counter.call("add", Command::untracked(inv.payload)).await;
                    Ok::<_, anyhow::Error>(serde_json::to_value(outcome)?)
                }
            }),
        )
}

fn chat_hub() -> InvocationRouter {
    InvocationRouter::new()
        .route(
            "Send",
            handler_fn(|inv: Invocation| async move {
                Ok::<_, anyhow::Error>(json!({"echo": inv.payload}))
            }),
        )
        .route(
            "Reject",
            handler_fn(|_inv: Invocation| async move {
                Err::<Value, _>(anyhow::Error::new(CommandError::NotAuthorized {
                    reason: "not a member of this room".to_string(),
                }))
            }),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format, &cli.log_filter)?;

    let server = cli.server_config();
    let backend = cli.store_backend()?;
    let store = open_store(&backend)?;

    let actor_store = store.as_ref().map(|s| Arc::clone(&s.commands));
    let actors = ActorHost::from_server_config(actor_store, &server);
    let counter = actors.spawn("counter", Counter::default());

    let endpoints = Endpoints::new()
        .commands(commands(counter))
        .hub("chat", chat_hub());
    let config = NetworkConfig {
        host: cli.host.clone(),
        port: cli.port,
        ..NetworkConfig::default()
    };

    let mut module = NetworkModule::new(config, server, endpoints, store);
    let port = module.start().await?;
    info!(port, store = backend.name(), "test server ready");

    module
        .serve(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("ctrl-c received, shutting down");
        })
        .await
}
