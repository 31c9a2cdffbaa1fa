//! `POST /commands/{operation}`: the HTTP command endpoint.

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use axum::response::Response;
use axum::Json;
use outcome_core::{Command, CommandId, Outcome, TransportError};
use serde_json::Value;

use super::AppState;
use crate::network::middleware::REQUEST_ID_HEADER;
use crate::network::problem::HttpTransport;
use crate::service::intercept::TransportAdapter;
use crate::service::invocation::{transport_names, Invocation, InvocationContext};
use crate::service::middleware::dispatch;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

/// Runs one command through the HTTP pipeline.
///
/// The idempotency key comes from the `Idempotency-Key` header or the body
/// `id`; when both are present they must agree. Tracked commands get their
/// key echoed back in the response header.
pub async fn command_handler(
    State(state): State<AppState>,
    path: Result<Path<String>, PathRejection>,
    headers: HeaderMap,
    body: Result<Json<Command<Value>>, JsonRejection>,
) -> Response {
    let operation = path.as_ref().map(|Path(op)| op.clone()).unwrap_or_default();
    let mut ctx = InvocationContext::new(
        transport_names::HTTP,
        operation,
        state.server.invocation_timeout(),
    );
    if let Some(request_id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        ctx = ctx.with_trace_id(request_id);
    }

    let command = match parse_command(path, &headers, body) {
        Ok(command) => command.ensure_id(state.server.generate_missing_command_ids),
        Err(err) => {
            let failure = state.http_interceptor.translate_error(&ctx, &err);
            return HttpTransport::into_native(Outcome::Failure(failure), &ctx);
        }
    };

    let (command_id, payload) = command.into_parts();
    let ctx = ctx.with_command_id(command_id.clone());

    // A client that disconnects drops this future; the guard cancels the call.
    let guard = ctx.cancel.clone().drop_guard();
    let invocation = Invocation::new(ctx.clone(), payload.unwrap_or(Value::Null));
    let outcome = dispatch(&state.commands, invocation).await;
    drop(guard.disarm());

    let mut response = HttpTransport::into_native(outcome, &ctx);
    if let Some(id) = command_id {
        if let Ok(value) = HeaderValue::from_str(id.as_str()) {
            response
                .headers_mut()
                .insert(HeaderName::from_static(IDEMPOTENCY_KEY_HEADER), value);
        }
    }
    response
}

/// Validate the request parts and settle on one idempotency key.
fn parse_command(
    path: Result<Path<String>, PathRejection>,
    headers: &HeaderMap,
    body: Result<Json<Command<Value>>, JsonRejection>,
) -> anyhow::Result<Command<Value>> {
    path?;
    let Json(command) = body?;

    let header_id = match headers.get(IDEMPOTENCY_KEY_HEADER) {
        Some(value) => Some(CommandId::parse(value.to_str()?)?),
        None => None,
    };

    let body_id = command.id().cloned();
    match (header_id, body_id) {
        (Some(header), Some(body)) if header != body => {
            Err(anyhow::Error::new(TransportError::MalformedRequest {
                reason: format!(
                    "Idempotency-Key header `{}` does not match command id `{}`",
                    header.as_str(),
                    body.as_str()
                ),
            }))
        }
        (Some(header), _) => Ok(command.with_command_id(Some(header))),
        (None, _) => Ok(command),
    }
}
