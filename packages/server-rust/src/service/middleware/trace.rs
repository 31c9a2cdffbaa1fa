//! Trace middleware for invocations.
//!
//! Wraps each invocation in a `tracing` span and logs one event per completed
//! call with its duration and outcome.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use outcome_core::{CommandId, Outcome};
use serde_json::Value;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::invocation::Invocation;

// ---------------------------------------------------------------------------
// InvocationTraceLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments invocations with timing and outcome via `tracing` spans.
#[derive(Debug, Clone)]
pub struct InvocationTraceLayer;

impl<S> Layer<S> for InvocationTraceLayer {
    type Service = InvocationTraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InvocationTraceService { inner }
    }
}

// ---------------------------------------------------------------------------
// InvocationTraceService
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct InvocationTraceService<S> {
    inner: S,
}

impl<S> Service<Invocation> for InvocationTraceService<S>
where
    S: Service<Invocation, Response = Outcome<Value>, Error = Infallible> + Send,
    S::Future: Send + 'static,
{
    type Response = Outcome<Value>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Outcome<Value>, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let ctx = &invocation.ctx;
        let transport = ctx.transport;
        let call_id = ctx.call_id;
        let operation = ctx.operation.clone();

        let span = info_span!(
            "invocation",
            transport,
            operation = %operation,
            call_id,
            command_id = ctx.command_id.as_ref().map(CommandId::as_str),
            trace_id = %ctx.trace_id,
            duration_ms = tracing::field::Empty,
            status = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;
                let duration_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

                let status = match &result {
                    Ok(Outcome::Success(_)) => 200,
                    Ok(Outcome::Failure(failure)) => failure.status_code().as_u16(),
                    Err(never) => match *never {},
                };

                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("status", status);

                tracing::info!(
                    transport,
                    operation = %operation,
                    call_id,
                    duration_ms,
                    status,
                    "invocation complete"
                );

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
