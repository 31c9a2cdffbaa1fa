//! The interception contract shared by every transport.
//!
//! [`Interceptor::execute`] wraps one handler call: it consults the
//! idempotency store, runs the handler at most once per command id, turns
//! errors and panics into classified failures, and records the terminal
//! outcome for replay. Transports differ only in how they build the
//! [`InvocationContext`] and how they render the resulting [`Outcome`]; that
//! part is the [`TransportAdapter`] trait.

use std::any::Any;
use std::backtrace::BacktraceStatus;
use std::error::Error as StdError;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use outcome_core::outcome::detail_keys;
use outcome_core::{
    Classification, Classifier, CommandError, CommandExecutionStatus, CommandId, DetailOptions,
    Failure, IdempotencyStore, IdempotencyStoreExt, Outcome, StatusCode, StoreError,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::config::{InProgressPolicy, ServerConfig};
use super::invocation::InvocationContext;

// ---------------------------------------------------------------------------
// TransportAdapter
// ---------------------------------------------------------------------------

/// Per-transport half of the interception contract.
pub trait TransportAdapter {
    /// Transport name used in logs and contexts.
    const NAME: &'static str;

    /// The transport's native response shape.
    type Native;

    /// Classifier with this transport's layers in front of the base layer.
    fn classifier() -> Classifier;

    /// Render an outcome the way the transport expects it.
    fn into_native(outcome: Outcome<Value>, ctx: &InvocationContext) -> Self::Native;
}

// ---------------------------------------------------------------------------
// Interceptor
// ---------------------------------------------------------------------------

/// What to do after consulting the store.
enum Admission<T> {
    Run(CommandId),
    Respond(Outcome<T>),
}

/// How a handler call ended.
enum Completion<T> {
    Finished(Outcome<T>),
    Cancelled(Outcome<T>),
}

/// Exception-to-outcome translation plus idempotency bookkeeping.
pub struct Interceptor {
    store: Option<Arc<dyn IdempotencyStore>>,
    classifier: Classifier,
    policy: InProgressPolicy,
    include_error_details: bool,
}

impl Interceptor {
    /// Interceptor without a store: pure error translation.
    #[must_use]
    pub fn new(classifier: Classifier) -> Self {
        Self {
            store: None,
            classifier,
            policy: InProgressPolicy::default(),
            include_error_details: false,
        }
    }

    /// Interceptor configured from `config`.
    #[must_use]
    pub fn from_config(
        classifier: Classifier,
        store: Option<Arc<dyn IdempotencyStore>>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            store,
            classifier,
            policy: config.in_progress_policy,
            include_error_details: config.include_error_details,
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: InProgressPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_error_details(mut self, include: bool) -> Self {
        self.include_error_details = include;
        self
    }

    #[must_use]
    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    /// Run `call` under the interception contract.
    ///
    /// `call` is only polled when this invocation wins the right to execute;
    /// replays and rejections drop it untouched.
    pub async fn execute<T, F>(&self, ctx: &InvocationContext, call: F) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Future<Output = anyhow::Result<T>> + Send,
    {
        let store = match (&self.store, &ctx.command_id) {
            (Some(store), Some(_)) => Arc::clone(store),
            _ => {
                return match self.run(ctx, call).await {
                    Completion::Finished(outcome) | Completion::Cancelled(outcome) => outcome,
                };
            }
        };

        let id = match self.admit(store.as_ref(), ctx).await {
            Admission::Run(id) => id,
            Admission::Respond(outcome) => return outcome,
        };

        match self.run(ctx, call).await {
            Completion::Finished(outcome) => {
                self.persist(store.as_ref(), &id, ctx, &outcome).await;
                outcome
            }
            // The command stays InProgress; nothing is rolled back.
            Completion::Cancelled(outcome) => outcome,
        }
    }

    /// Translate `err` into a failure carrying this call's details, and log it.
    #[must_use]
    pub fn translate_error(&self, ctx: &InvocationContext, err: &anyhow::Error) -> Failure {
        let source: &(dyn StdError + 'static) = err.as_ref();
        let classification = self.classifier.classify(source);
        let options = DetailOptions {
            include_diagnostics: self.include_error_details,
        };

        let mut failure = Failure::from_error(source, classification.status, &options)
            .with_detail(detail_keys::TRACE_ID, ctx.trace_id.clone())
            .with_details(&ctx.extensions);

        if self.include_error_details {
            let backtrace = err.backtrace();
            if backtrace.status() == BacktraceStatus::Captured {
                failure = failure.with_detail(detail_keys::STACK_TRACE, backtrace.to_string());
            }
        }

        log_failure(ctx, &classification, err);
        failure
    }

    /// Decide whether this call runs, replays, or is turned away.
    async fn admit<T>(&self, store: &dyn IdempotencyStore, ctx: &InvocationContext) -> Admission<T>
    where
        T: DeserializeOwned + Send,
    {
        let Some(id) = ctx.command_id.clone() else {
            return Admission::Respond(Outcome::fail(StatusCode::InternalServerError));
        };

        let status = match store.command_status(&id, &ctx.cancel).await {
            Ok(status) => status,
            Err(err) => return Admission::Respond(self.store_failure(ctx, err)),
        };

        let status = match status {
            CommandExecutionStatus::NotStarted => {
                match store
                    .try_transition(
                        &id,
                        CommandExecutionStatus::NotStarted,
                        CommandExecutionStatus::InProgress,
                        &ctx.cancel,
                    )
                    .await
                {
                    Ok(true) => return Admission::Run(id),
                    // Lost the race; see what the winner has done so far.
                    Ok(false) => match store.command_status(&id, &ctx.cancel).await {
                        Ok(status) => status,
                        Err(err) => return Admission::Respond(self.store_failure(ctx, err)),
                    },
                    Err(err) => return Admission::Respond(self.store_failure(ctx, err)),
                }
            }
            other => other,
        };

        if status.is_terminal() {
            debug!(command_id = %id, ?status, "replaying recorded outcome");
            return Admission::Respond(self.replay(store, &id, ctx).await);
        }

        Admission::Respond(self.on_in_progress(store, &id, ctx).await)
    }

    async fn on_in_progress<T>(
        &self,
        store: &dyn IdempotencyStore,
        id: &CommandId,
        ctx: &InvocationContext,
    ) -> Outcome<T>
    where
        T: DeserializeOwned + Send,
    {
        match self.policy {
            InProgressPolicy::Reject => self.in_progress_failure(ctx, id),
            InProgressPolicy::Wait {
                timeout,
                poll_interval,
            } => {
                let wait = async {
                    loop {
                        tokio::select! {
                            () = ctx.cancel.cancelled() => {
                                return Err(StoreError::Cancelled);
                            }
                            () = tokio::time::sleep(poll_interval) => {}
                        }
                        let status = store.command_status(id, &ctx.cancel).await?;
                        if status.is_terminal() {
                            return Ok(());
                        }
                    }
                };
                match tokio::time::timeout(timeout, wait).await {
                    Ok(Ok(())) => self.replay(store, id, ctx).await,
                    Ok(Err(err)) => self.store_failure(ctx, err),
                    Err(_elapsed) => self.in_progress_failure(ctx, id),
                }
            }
        }
    }

    async fn replay<T>(
        &self,
        store: &dyn IdempotencyStore,
        id: &CommandId,
        ctx: &InvocationContext,
    ) -> Outcome<T>
    where
        T: DeserializeOwned + Send,
    {
        match store.command_result::<Outcome<T>>(id, &ctx.cancel).await {
            Ok(Some(outcome)) => outcome,
            Ok(None) => {
                let err = anyhow::Error::new(CommandError::Fault {
                    reason: format!("command {id} is terminal but has no recorded outcome"),
                });
                Outcome::Failure(self.translate_error(ctx, &err))
            }
            Err(err) => self.store_failure(ctx, err),
        }
    }

    async fn run<T, F>(&self, ctx: &InvocationContext, call: F) -> Completion<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send,
    {
        let guarded = AssertUnwindSafe(call).catch_unwind();
        let result = tokio::select! {
            biased;
            () = ctx.cancel.cancelled() => {
                let err = anyhow::Error::new(CommandError::Cancelled);
                return Completion::Cancelled(Outcome::Failure(self.translate_error(ctx, &err)));
            }
            result = guarded => result,
        };

        let outcome = match result {
            Ok(Ok(value)) => Outcome::Success(value),
            Ok(Err(err)) => Outcome::Failure(self.translate_error(ctx, &err)),
            Err(panic) => {
                let err = anyhow::Error::new(CommandError::Fault {
                    reason: format!("handler panicked: {}", panic_message(panic.as_ref())),
                });
                Outcome::Failure(self.translate_error(ctx, &err))
            }
        };
        Completion::Finished(outcome)
    }

    async fn persist<T: Serialize>(
        &self,
        store: &dyn IdempotencyStore,
        id: &CommandId,
        ctx: &InvocationContext,
        outcome: &Outcome<T>,
    ) {
        let status = if outcome.is_success() {
            CommandExecutionStatus::Completed
        } else {
            CommandExecutionStatus::Failed
        };
        let value = match serde_json::to_value(outcome) {
            Ok(value) => value,
            Err(err) => {
                error!(command_id = %id, error = %err, "failed to encode outcome for the store");
                return;
            }
        };
        // The handler has run, so record its outcome even if the caller left.
        let detached = CancellationToken::new();
        if let Err(err) = store.record_outcome(id, status, value, &detached).await {
            error!(
                transport = ctx.transport,
                operation = %ctx.operation,
                command_id = %id,
                error = %err,
                "failed to record command outcome"
            );
        }
    }

    fn store_failure<T>(&self, ctx: &InvocationContext, err: StoreError) -> Outcome<T> {
        Outcome::Failure(self.translate_error(ctx, &anyhow::Error::new(err)))
    }

    fn in_progress_failure<T>(&self, ctx: &InvocationContext, id: &CommandId) -> Outcome<T> {
        let err = anyhow::Error::new(CommandError::Conflict {
            reason: format!("command {id} is already in progress; retry later"),
        });
        Outcome::Failure(self.translate_error(ctx, &err))
    }
}

fn log_failure(ctx: &InvocationContext, classification: &Classification, err: &anyhow::Error) {
    let status = classification.status.as_u16();
    let command_id = ctx.command_id.as_ref().map(CommandId::as_str);
    let chain = format!("{err:#}");
    if classification.status.is_server_error() {
        error!(
            transport = ctx.transport,
            operation = %ctx.operation,
            call_id = ctx.call_id,
            command_id,
            trace_id = %ctx.trace_id,
            status,
            layer = classification.layer,
            error = %chain,
            "invocation failed"
        );
    } else {
        warn!(
            transport = ctx.transport,
            operation = %ctx.operation,
            call_id = ctx.call_id,
            command_id,
            trace_id = %ctx.trace_id,
            status,
            layer = classification.layer,
            error = %chain,
            "invocation failed"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
