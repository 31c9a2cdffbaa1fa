use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use outcome_core::{detail_keys, Command, CommandError, IdempotencyStore, Outcome};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::{Actor, ActorError, ActorTransport};
use crate::service::config::ServerConfig;
use crate::service::intercept::{Interceptor, TransportAdapter};
use crate::service::invocation::{transport_names, InvocationContext};

/// One queued call.
struct Envelope {
    ctx: InvocationContext,
    payload: Value,
    reply: oneshot::Sender<Outcome<Value>>,
}

#[derive(Debug, Clone)]
pub struct ActorHostConfig {
    /// Calls queued per actor before `call` waits for room.
    pub mailbox_capacity: usize,
    pub call_timeout: Duration,
}

impl Default for ActorHostConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 64,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Spawns actors and keeps a handle to each by id.
pub struct ActorHost {
    interceptor: Arc<Interceptor>,
    config: ActorHostConfig,
    actors: DashMap<String, ActorRef>,
}

impl ActorHost {
    #[must_use]
    pub fn new(interceptor: Arc<Interceptor>, config: ActorHostConfig) -> Self {
        Self {
            interceptor,
            config,
            actors: DashMap::new(),
        }
    }

    /// Host whose interceptor uses the actor classifier and `server`'s settings.
    #[must_use]
    pub fn from_server_config(
        store: Option<Arc<dyn IdempotencyStore>>,
        server: &ServerConfig,
    ) -> Self {
        let interceptor = Interceptor::from_config(ActorTransport::classifier(), store, server);
        let config = ActorHostConfig {
            call_timeout: server.invocation_timeout(),
            ..ActorHostConfig::default()
        };
        Self::new(Arc::new(interceptor), config)
    }

    /// Start `actor` on its own task. An actor already registered under `id`
    /// is replaced and stops once its last reference is dropped.
    pub fn spawn<A: Actor>(&self, id: impl Into<String>, actor: A) -> ActorRef {
        let id: String = id.into();
        let (tx, rx) = mpsc::channel(self.config.mailbox_capacity.max(1));
        let actor_ref = ActorRef {
            id: Arc::from(id.as_str()),
            actor_type: actor.actor_type(),
            tx,
            interceptor: Arc::clone(&self.interceptor),
            timeout: self.config.call_timeout,
        };

        tokio::spawn(run_mailbox(actor, rx, Arc::clone(&self.interceptor)));
        debug!(actor_id = %id, actor_type = actor_ref.actor_type, "actor spawned");

        if self.actors.insert(id, actor_ref.clone()).is_some() {
            debug!(actor_id = %actor_ref.id, "replaced existing actor");
        }
        actor_ref
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<ActorRef> {
        self.actors.get(id).map(|entry| entry.value().clone())
    }

    /// Forget `id`. Its mailbox closes when outstanding references are gone.
    pub fn stop(&self, id: &str) -> bool {
        self.actors.remove(id).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.actors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }
}

async fn run_mailbox<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<Envelope>,
    interceptor: Arc<Interceptor>,
) {
    while let Some(Envelope { ctx, payload, reply }) = rx.recv().await {
        let method = ctx.operation.clone();
        let timeout = ctx.timeout;
        let call = async {
            match tokio::time::timeout(timeout, actor.handle(&method, payload)).await {
                Ok(result) => result,
                Err(_) => Err(anyhow::Error::new(CommandError::Timeout {
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                })),
            }
        };
        let outcome = interceptor.execute(&ctx, call).await;
        if reply.send(outcome).is_err() {
            debug!(call_id = ctx.call_id, "caller left before the actor replied");
        }
    }
    debug!(actor_type = actor.actor_type(), "actor mailbox closed");
}

/// Cloneable handle for calling one actor.
#[derive(Clone)]
pub struct ActorRef {
    id: Arc<str>,
    actor_type: &'static str,
    tx: mpsc::Sender<Envelope>,
    interceptor: Arc<Interceptor>,
    timeout: Duration,
}

impl ActorRef {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn actor_type(&self) -> &'static str {
        self.actor_type
    }

    /// Call `method` and wait for its outcome.
    ///
    /// A closed mailbox becomes a 503 outcome. Dropping the returned future
    /// cancels the call inside the actor.
    pub async fn call(&self, method: &str, command: Command<Value>) -> Outcome<Value> {
        let (command_id, payload) = command.into_parts();
        let ctx = InvocationContext::new(transport_names::ACTOR, method, self.timeout)
            .with_command_id(command_id)
            .with_extension(detail_keys::ACTOR_TYPE, self.actor_type)
            .with_extension(detail_keys::ACTOR_ID, self.id.as_ref());

        let guard = ctx.cancel.clone().drop_guard();
        let (reply_tx, reply_rx) = oneshot::channel();
        let envelope = Envelope {
            ctx: ctx.clone(),
            payload: payload.unwrap_or(Value::Null),
            reply: reply_tx,
        };

        let outcome = if self.tx.send(envelope).await.is_err() {
            self.unavailable(
                &ctx,
                ActorError::MailboxClosed {
                    actor_id: self.id.to_string(),
                },
            )
        } else {
            match reply_rx.await {
                Ok(outcome) => outcome,
                Err(_) => self.unavailable(
                    &ctx,
                    ActorError::ReplyDropped {
                        actor_id: self.id.to_string(),
                    },
                ),
            }
        };
        drop(guard.disarm());
        outcome
    }

    fn unavailable(&self, ctx: &InvocationContext, err: ActorError) -> Outcome<Value> {
        Outcome::Failure(self.interceptor.translate_error(ctx, &anyhow::Error::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use outcome_core::{CommandId, StatusCode};
    use serde_json::json;

    use super::*;
    use crate::storage::InMemoryIdempotencyStore;

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
                    let n = payload.as_i64().ok_or_else(|| {
                        CommandError::validation("amount", "must be an integer")
                    })?;
                    tokio::task::yield_now().await;
                    self.total += n;
                    Ok(json!(self.total))
                }
                "get" => Ok(json!(self.total)),
                "explode" => panic!("counter exploded"),
                other => Err(ActorError::unknown_method(self.actor_type(), other).into()),
            }
        }
    }

    fn host() -> ActorHost {
        let interceptor = Interceptor::new(ActorTransport::classifier())
            .with_store(Arc::new(InMemoryIdempotencyStore::new()));
        ActorHost::new(Arc::new(interceptor), ActorHostConfig::default())
    }

    #[tokio::test]
    async fn calls_are_processed_one_at_a_time() {
        let host = host();
        let counter = host.spawn("counter-1", Counter::default());

        let mut calls = Vec::new();
        for _ in 0..10 {
            let counter = counter.clone();
            calls.push(tokio::spawn(async move {
                counter.call("add", Command::untracked(json!(1))).await
            }));
        }
        for call in calls {
            assert!(call.await.unwrap().is_success());
        }

        let total = counter.call("get", Command::untracked(Value::Null)).await;
        assert_eq!(total, Outcome::succeed(json!(10)));
    }

    #[tokio::test]
    async fn tracked_calls_run_once() {
        let host = host();
        let counter = host.spawn("counter-2", Counter::default());
        let id = CommandId::parse("add-5").unwrap();

        let first = counter.call("add", Command::with_id(id.clone(), json!(5))).await;
        let second = counter.call("add", Command::with_id(id, json!(5))).await;
        assert_eq!(first, Outcome::succeed(json!(5)));
        assert_eq!(second, first);

        let total = counter.call("get", Command::untracked(Value::Null)).await;
        assert_eq!(total, Outcome::succeed(json!(5)));
    }

    #[tokio::test]
    async fn failures_carry_actor_identity() {
        let host = host();
        let counter = host.spawn("counter-3", Counter::default());

        let outcome = counter.call("reset", Command::untracked(Value::Null)).await;
        assert_eq!(outcome.status_code(), Some(StatusCode::NotFound));
        let failure = outcome.failure().unwrap();
        assert_eq!(failure.detail(detail_keys::ACTOR_TYPE), Some(&json!("Counter")));
        assert_eq!(failure.detail(detail_keys::ACTOR_ID), Some(&json!("counter-3")));

        let invalid = counter.call("add", Command::untracked(json!("x"))).await;
        assert_eq!(invalid.status_code(), Some(StatusCode::BadRequest));
    }

    #[tokio::test]
    async fn actor_survives_a_panicking_call() {
        let host = host();
        let counter = host.spawn("counter-4", Counter::default());

        let outcome = counter.call("explode", Command::untracked(Value::Null)).await;
        assert_eq!(outcome.status_code(), Some(StatusCode::InternalServerError));

        let after = counter.call("add", Command::untracked(json!(2))).await;
        assert_eq!(after, Outcome::succeed(json!(2)));
    }

    #[tokio::test]
    async fn closed_mailbox_is_unavailable() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let orphan = ActorRef {
            id: Arc::from("gone"),
            actor_type: "Counter",
            tx,
            interceptor: Arc::new(Interceptor::new(ActorTransport::classifier())),
            timeout: Duration::from_secs(1),
        };

        let outcome = orphan.call("get", Command::untracked(Value::Null)).await;
        assert_eq!(outcome.status_code(), Some(StatusCode::ServiceUnavailable));
    }

    #[tokio::test]
    async fn host_tracks_spawned_actors() {
        let host = host();
        host.spawn("a", Counter::default());
        assert!(host.get("a").is_some());
        assert_eq!(host.len(), 1);
        assert!(host.stop("a"));
        assert!(!host.stop("a"));
        assert!(host.is_empty());
    }
}
