//! Pipeline composition: combines all middleware layers into a single service stack.

use std::sync::Arc;

use outcome_core::Outcome;
use serde_json::Value;
use tower::{ServiceBuilder, ServiceExt};

use super::intercept::{InterceptLayer, InterceptService};
use super::load_shed::{LoadShedLayer, LoadShedService};
use super::timeout::{TimeoutLayer, TimeoutService};
use super::trace::{InvocationTraceLayer, InvocationTraceService};
use crate::service::config::ServerConfig;
use crate::service::intercept::Interceptor;
use crate::service::invocation::Invocation;
use crate::service::router::{infallible, InvocationRouter};

/// The fully assembled invocation stack.
///
/// Cloneable and `Send + Sync`, so transports keep one in their state and
/// clone it per call.
pub type InvocationPipeline =
    InvocationTraceService<LoadShedService<InterceptService<TimeoutService<InvocationRouter>>>>;

/// Build the invocation pipeline by wrapping the `InvocationRouter` with middleware layers.
///
/// Layer order (outermost to innermost):
/// 1. `InvocationTraceLayer` -- span and completion event for every call
/// 2. `LoadShedLayer` -- reject when overloaded (fail fast before touching the store)
/// 3. `InterceptLayer` -- idempotency bookkeeping and error translation
/// 4. `TimeoutLayer` -- enforce per-invocation timeouts
#[must_use]
pub fn build_invocation_pipeline(
    router: InvocationRouter,
    interceptor: Arc<Interceptor>,
    config: &ServerConfig,
) -> InvocationPipeline {
    ServiceBuilder::new()
        .layer(InvocationTraceLayer)
        .layer(LoadShedLayer::new(
            config.max_concurrent_invocations,
            Arc::clone(&interceptor),
        ))
        .layer(InterceptLayer::new(interceptor))
        .layer(TimeoutLayer)
        .service(router)
}

/// Run one invocation through a clone of `pipeline`.
pub async fn dispatch(pipeline: &InvocationPipeline, invocation: Invocation) -> Outcome<Value> {
    infallible(pipeline.clone().oneshot(invocation).await)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
