//! Load-shedding middleware for invocations.
//!
//! Answers with a 503 outcome when the number of concurrent invocations
//! reaches `max_concurrent_invocations`. Sits outside the interceptor, so a
//! shed call never reaches the idempotency store.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use outcome_core::Outcome;
use serde_json::Value;
use tokio::sync::Semaphore;
use tower::{Layer, Service};

use crate::service::intercept::Interceptor;
use crate::service::invocation::{Invocation, InvocationError};

// ---------------------------------------------------------------------------
// LoadShedLayer
// ---------------------------------------------------------------------------

/// Tower layer that limits concurrent invocations via a semaphore.
///
/// When all permits are taken, incoming invocations are rejected immediately
/// rather than queued.
#[derive(Clone)]
pub struct LoadShedLayer {
    semaphore: Arc<Semaphore>,
    interceptor: Arc<Interceptor>,
}

impl LoadShedLayer {
    /// Create a new `LoadShedLayer` with the given concurrency limit.
    ///
    /// `interceptor` renders the rejection so it carries the same details as
    /// any other failure.
    #[must_use]
    pub fn new(max_concurrent: u32, interceptor: Arc<Interceptor>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent as usize)),
            interceptor,
        }
    }
}

impl<S> Layer<S> for LoadShedLayer {
    type Service = LoadShedService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        LoadShedService {
            inner,
            semaphore: Arc::clone(&self.semaphore),
            interceptor: Arc::clone(&self.interceptor),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadShedService
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct LoadShedService<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
    interceptor: Arc<Interceptor>,
}

impl<S> Service<Invocation> for LoadShedService<S>
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
        // Try to acquire a permit without waiting. If none available, reject.
        let Ok(permit) = Arc::clone(&self.semaphore).try_acquire_owned() else {
            let err = anyhow::Error::new(InvocationError::Overloaded);
            let failure = self.interceptor.translate_error(&invocation.ctx, &err);
            return Box::pin(async move { Ok(Outcome::Failure(failure)) });
        };

        let fut = self.inner.call(invocation);
        Box::pin(async move {
            // Hold the permit for the duration of the invocation.
            let result = fut.await;
            drop(permit);
            result
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use outcome_core::StatusCode;
    use tower::ServiceExt;

    use super::*;
    use crate::service::classify::http_classifier;
    use crate::service::invocation::{transport_names, InvocationContext};

    /// Service that holds the permit for a while before answering.
    #[derive(Clone)]
    struct SlowService;

    impl Service<Invocation> for SlowService {
        type Response = Outcome<Value>;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Outcome<Value>, Infallible>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, _invocation: Invocation) -> Self::Future {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(Outcome::succeed(Value::Null))
            })
        }
    }

    fn invocation() -> Invocation {
        let ctx = InvocationContext::new(transport_names::HTTP, "slow", Duration::from_secs(1));
        Invocation::new(ctx, Value::Null)
    }

    fn layer(max: u32) -> LoadShedLayer {
        LoadShedLayer::new(max, Arc::new(Interceptor::new(http_classifier())))
    }

    #[tokio::test]
    async fn allows_requests_under_limit() {
        let svc = layer(10).layer(SlowService);
        let outcome = svc.oneshot(invocation()).await.unwrap();
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn rejects_when_overloaded() {
        let layer = layer(1);
        let busy = layer.layer(SlowService);
        let first = tokio::spawn(busy.oneshot(invocation()));
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = layer.layer(SlowService).oneshot(invocation()).await.unwrap();
        assert_eq!(outcome.status_code(), Some(StatusCode::ServiceUnavailable));

        assert!(first.await.unwrap().unwrap().is_success());
    }
}
