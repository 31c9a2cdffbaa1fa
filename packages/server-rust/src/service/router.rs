//! Invocation routing: dispatches an `Invocation` to the handler registered
//! for its operation name.

use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use serde_json::Value;
use tower::Service;

use super::handler::CommandHandler;
use super::invocation::{Invocation, InvocationError};

type BoxedFuture = Pin<Box<dyn Future<Output = Result<Value, InvocationError>> + Send>>;

// ---------------------------------------------------------------------------
// InvocationRouter
// ---------------------------------------------------------------------------

/// Routes `Invocation` values to the handler registered for `ctx.operation`.
///
/// Cloning is cheap; clones share the handler table. Invocations for an
/// unregistered operation fail with `InvocationError::UnknownOperation`.
#[derive(Clone, Default)]
pub struct InvocationRouter {
    handlers: Arc<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl InvocationRouter {
    /// Create a new empty router.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `operation`, replacing any previous one.
    #[must_use]
    pub fn route(mut self, operation: impl Into<String>, handler: impl CommandHandler) -> Self {
        Arc::make_mut(&mut self.handlers).insert(operation.into(), Arc::new(handler));
        self
    }

    #[must_use]
    pub fn contains(&self, operation: &str) -> bool {
        self.handlers.contains_key(operation)
    }

    /// Registered operation names, sorted.
    #[must_use]
    pub fn operations(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Service<Invocation> for InvocationRouter {
    type Response = Value;
    type Error = InvocationError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        match self.handlers.get(&invocation.ctx.operation) {
            Some(handler) => {
                let fut = handler.call(invocation);
                Box::pin(async move { fut.await.map_err(InvocationError::Handler) })
            }
            None => {
                let name = invocation.ctx.operation;
                Box::pin(async move { Err::<Value, _>(InvocationError::UnknownOperation { name }) })
            }
        }
    }
}

/// Unwrap the response of a service that cannot fail.
pub(crate) fn infallible<T>(result: Result<T, Infallible>) -> T {
    match result {
        Ok(value) => value,
        Err(never) => match never {},
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tower::ServiceExt;

    use super::*;
    use crate::service::handler::handler_fn;
    use crate::service::invocation::{transport_names, InvocationContext};

    fn invocation(operation: &str) -> Invocation {
        let ctx = InvocationContext::new(transport_names::HTTP, operation, Duration::from_secs(5));
        Invocation::new(ctx, json!("ping"))
    }

    fn router() -> InvocationRouter {
        InvocationRouter::new()
            .route(
                "echo",
                handler_fn(|inv: Invocation| async move { Ok::<_, anyhow::Error>(inv.payload) }),
            )
            .route(
                "name",
                handler_fn(|inv: Invocation| async move {
                    Ok::<_, anyhow::Error>(json!(inv.ctx.operation))
                }),
            )
    }

    #[tokio::test]
    async fn routes_to_registered_handler() {
        let resp = router().oneshot(invocation("echo")).await.unwrap();
        assert_eq!(resp, json!("ping"));
    }

    #[tokio::test]
    async fn unknown_operation_returns_error() {
        let err = router().oneshot(invocation("nonexistent")).await.unwrap_err();
        assert!(matches!(
            err,
            InvocationError::UnknownOperation { name } if name == "nonexistent"
        ));
    }

    #[tokio::test]
    async fn routes_to_correct_handler_among_multiple() {
        let mut router = router();
        let resp = ServiceExt::ready(&mut router)
            .await
            .unwrap()
            .call(invocation("name"))
            .await
            .unwrap();
        assert_eq!(resp, json!("name"));
        assert_eq!(router.operations(), vec!["echo", "name"]);
        assert!(router.contains("echo"));
    }

    #[tokio::test]
    async fn handler_errors_are_wrapped() {
        let router = InvocationRouter::new().route(
            "fail",
            handler_fn(|_inv: Invocation| async move { Err::<Value, _>(anyhow::anyhow!("nope")) }),
        );
        let err = router.oneshot(invocation("fail")).await.unwrap_err();
        assert!(matches!(err, InvocationError::Handler(_)));
    }
}
