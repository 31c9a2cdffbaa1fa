//! Interception middleware: the point where pipeline errors become outcomes.
//!
//! Everything below this layer speaks `Result<Value, InvocationError>`;
//! everything above it sees `Outcome<Value>` and can no longer fail.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use outcome_core::Outcome;
use serde_json::Value;
use tower::{Layer, Service, ServiceExt};

use crate::service::intercept::Interceptor;
use crate::service::invocation::{Invocation, InvocationError};

// ---------------------------------------------------------------------------
// InterceptLayer
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct InterceptLayer {
    interceptor: Arc<Interceptor>,
}

impl InterceptLayer {
    #[must_use]
    pub fn new(interceptor: Arc<Interceptor>) -> Self {
        Self { interceptor }
    }
}

impl<S> Layer<S> for InterceptLayer {
    type Service = InterceptService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptService {
            inner,
            interceptor: Arc::clone(&self.interceptor),
        }
    }
}

// ---------------------------------------------------------------------------
// InterceptService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct InterceptService<S> {
    inner: S,
    interceptor: Arc<Interceptor>,
}

impl<S> Service<Invocation> for InterceptService<S>
where
    S: Service<Invocation, Response = Value, Error = InvocationError> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Outcome<Value>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Outcome<Value>, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness of the inner stack is awaited per call so that its errors
        // also turn into outcomes.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let inner = self.inner.clone();
        let interceptor = Arc::clone(&self.interceptor);
        let ctx = invocation.ctx.clone();
        Box::pin(async move {
            let call = async move {
                inner
                    .oneshot(invocation)
                    .await
                    .map_err(InvocationError::into_anyhow)
            };
            Ok(interceptor.execute(&ctx, call).await)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use outcome_core::{Classifier, StatusCode};
    use serde_json::json;

    use super::*;
    use crate::service::handler::handler_fn;
    use crate::service::invocation::{transport_names, InvocationContext};
    use crate::service::router::InvocationRouter;

    fn service() -> InterceptService<InvocationRouter> {
        let router = InvocationRouter::new().route(
            "double",
            handler_fn(|inv: Invocation| async move {
                let n = inv.payload.as_i64().ok_or_else(|| anyhow::anyhow!("not a number"))?;
                Ok::<_, anyhow::Error>(json!(n * 2))
            }),
        );
        InterceptLayer::new(Arc::new(Interceptor::new(Classifier::base()))).layer(router)
    }

    fn invocation(operation: &str, payload: Value) -> Invocation {
        let ctx = InvocationContext::new(transport_names::HTTP, operation, Duration::from_secs(1));
        Invocation::new(ctx, payload)
    }

    #[tokio::test]
    async fn success_becomes_outcome() {
        let outcome = service().oneshot(invocation("double", json!(21))).await.unwrap();
        assert_eq!(outcome, Outcome::succeed(json!(42)));
    }

    #[tokio::test]
    async fn handler_error_becomes_failure() {
        let outcome = service()
            .oneshot(invocation("double", json!("x")))
            .await
            .unwrap();
        assert_eq!(outcome.status_code(), Some(StatusCode::InternalServerError));
        assert_eq!(outcome.error_message(), Some("not a number"));
    }

    #[tokio::test]
    async fn unknown_operation_without_transport_layer_is_internal() {
        let outcome = service().oneshot(invocation("missing", Value::Null)).await.unwrap();
        assert_eq!(outcome.status_code(), Some(StatusCode::InternalServerError));
    }
}
