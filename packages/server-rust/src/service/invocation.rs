//! Invocation types carried through the interception pipeline.
//!
//! Every transport turns its inbound call into an [`Invocation`]: a context
//! describing who is calling what, plus the JSON payload. The pipeline answers
//! with an `Outcome<Value>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use outcome_core::{CommandError, CommandId, ErrorDetails};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Transport names used in logs and as `InvocationContext::transport`.
pub mod transport_names {
    pub const HTTP: &str = "http";
    pub const HUB: &str = "hub";
    pub const ACTOR: &str = "actor";
}

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

/// Context carried with every invocation through the pipeline.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Process-unique id for this call (not the idempotency key).
    pub call_id: u64,
    pub transport: &'static str,
    /// Operation, hub method or actor method being invoked.
    pub operation: String,
    /// Idempotency key. `None` skips the store entirely.
    pub command_id: Option<CommandId>,
    /// Attached to every failure as `traceId`.
    pub trace_id: String,
    pub timeout: Duration,
    /// Fires when the caller goes away.
    pub cancel: CancellationToken,
    /// Extra details merged into failures (hub/actor identity).
    pub extensions: ErrorDetails,
}

impl InvocationContext {
    #[must_use]
    pub fn new(transport: &'static str, operation: impl Into<String>, timeout: Duration) -> Self {
        Self {
            call_id: NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed),
            transport,
            operation: operation.into(),
            command_id: None,
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            timeout,
            cancel: CancellationToken::new(),
            extensions: ErrorDetails::new(),
        }
    }

    #[must_use]
    pub fn with_command_id(mut self, command_id: Option<CommandId>) -> Self {
        self.command_id = command_id;
        self
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_extension(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.to_string(), value.into());
        self
    }
}

/// A call travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub ctx: InvocationContext,
    pub payload: Value,
}

impl Invocation {
    #[must_use]
    pub fn new(ctx: InvocationContext, payload: Value) -> Self {
        Self { ctx, payload }
    }

    #[must_use]
    pub fn ctx(&self) -> &InvocationContext {
        &self.ctx
    }
}

/// Errors produced inside the pipeline, below the interceptor.
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("unknown operation: {name}")]
    UnknownOperation { name: String },
    #[error("invocation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("server overloaded, try again later")]
    Overloaded,
    #[error(transparent)]
    Handler(#[from] anyhow::Error),
}

impl InvocationError {
    /// Convert for classification.
    ///
    /// Handler errors are returned as-is so the handler's own error stays at
    /// the top of the chain. Timeouts become [`CommandError::Timeout`].
    #[must_use]
    pub fn into_anyhow(self) -> anyhow::Error {
        match self {
            InvocationError::Handler(err) => err,
            InvocationError::Timeout { timeout_ms } => {
                anyhow::Error::new(CommandError::Timeout {
                    after_ms: timeout_ms,
                })
            }
            other @ (InvocationError::UnknownOperation { .. } | InvocationError::Overloaded) => {
                anyhow::Error::new(other)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_ids_are_unique_and_trace_ids_generated() {
        let a = InvocationContext::new(transport_names::HTTP, "echo", Duration::from_secs(1));
        let b = InvocationContext::new(transport_names::HTTP, "echo", Duration::from_secs(1));
        assert_ne!(a.call_id, b.call_id);
        assert_ne!(a.trace_id, b.trace_id);
        assert_eq!(a.trace_id.len(), 32);
        assert!(a.command_id.is_none());
    }

    #[test]
    fn handler_errors_keep_their_own_type() {
        let err = InvocationError::Handler(anyhow::Error::new(CommandError::NotAuthenticated));
        let converted = err.into_anyhow();
        assert!(converted.downcast_ref::<CommandError>().is_some());
    }

    #[test]
    fn timeouts_become_command_errors() {
        let converted = InvocationError::Timeout { timeout_ms: 25 }.into_anyhow();
        assert!(matches!(
            converted.downcast_ref::<CommandError>(),
            Some(CommandError::Timeout { after_ms: 25 })
        ));
    }
}
