//! Command handlers: the code the pipeline ultimately invokes.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;

use outcome_core::TransportError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::invocation::{Invocation, InvocationContext};

/// Boxed future returned by [`CommandHandler::call`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

/// A handler for one named operation.
///
/// Work must happen inside the returned future: the interceptor drops the
/// future unpolled when a command is replayed or rejected.
pub trait CommandHandler: Send + Sync + 'static {
    fn call(&self, invocation: Invocation) -> HandlerFuture;
}

// ---------------------------------------------------------------------------
// handler_fn
// ---------------------------------------------------------------------------

/// Handler built from a closure over the raw JSON invocation.
#[derive(Clone)]
pub struct HandlerFn<F> {
    f: F,
}

/// Wrap `f` as a [`CommandHandler`].
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    HandlerFn { f }
}

impl<F, Fut> CommandHandler for HandlerFn<F>
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    fn call(&self, invocation: Invocation) -> HandlerFuture {
        Box::pin((self.f)(invocation))
    }
}

// ---------------------------------------------------------------------------
// typed_handler
// ---------------------------------------------------------------------------

/// Handler that decodes its request and encodes its response with serde.
pub struct TypedHandler<F, Req, Resp> {
    f: F,
    _types: PhantomData<fn(Req) -> Resp>,
}

/// Wrap a typed async function as a [`CommandHandler`].
///
/// A payload that does not decode into `Req` fails with
/// [`TransportError::MalformedRequest`].
pub fn typed_handler<F, Fut, Req, Resp>(f: F) -> TypedHandler<F, Req, Resp>
where
    F: Fn(InvocationContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + 'static,
{
    TypedHandler {
        f,
        _types: PhantomData,
    }
}

impl<F, Fut, Req, Resp> CommandHandler for TypedHandler<F, Req, Resp>
where
    F: Fn(InvocationContext, Req) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + 'static,
{
    fn call(&self, invocation: Invocation) -> HandlerFuture {
        let Invocation { ctx, payload } = invocation;
        let request = match serde_json::from_value::<Req>(payload) {
            Ok(request) => request,
            Err(err) => {
                let reason = err.to_string();
                return Box::pin(async move {
                    Err::<Value, _>(anyhow::Error::new(TransportError::MalformedRequest {
                        reason,
                    }))
                });
            }
        };
        let fut = (self.f)(ctx, request);
        Box::pin(async move {
            let response = fut.await?;
            Ok::<Value, anyhow::Error>(serde_json::to_value(response)?)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Deserialize;
    use serde_json::json;

    use super::*;
    use crate::service::invocation::transport_names;

    #[derive(Deserialize)]
    struct Add {
        a: i64,
        b: i64,
    }

    fn invocation(payload: Value) -> Invocation {
        let ctx = InvocationContext::new(transport_names::HTTP, "add", Duration::from_secs(1));
        Invocation::new(ctx, payload)
    }

    #[tokio::test]
    async fn handler_fn_passes_payload_through() {
        let handler =
            handler_fn(|inv: Invocation| async move { Ok::<_, anyhow::Error>(inv.payload) });
        let out = handler.call(invocation(json!({"x": 1}))).await.unwrap();
        assert_eq!(out, json!({"x": 1}));
    }

    #[tokio::test]
    async fn typed_handler_decodes_and_encodes() {
        let handler =
            typed_handler(|_ctx, req: Add| async move { Ok::<_, anyhow::Error>(req.a + req.b) });
        let out = handler.call(invocation(json!({"a": 2, "b": 40}))).await.unwrap();
        assert_eq!(out, json!(42));
    }

    #[tokio::test]
    async fn typed_handler_rejects_malformed_payloads() {
        let handler = typed_handler(|_ctx, req: Add| async move { Ok::<_, anyhow::Error>(req.a) });
        let err = handler.call(invocation(json!({"a": "two"}))).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TransportError>(),
            Some(TransportError::MalformedRequest { .. })
        ));
    }
}
