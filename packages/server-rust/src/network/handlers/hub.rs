//! `GET /hubs/{hub}`: realtime hub connections over WebSocket.
//!
//! Every text frame is one JSON [`InboundFrame`]. Invocations run
//! concurrently, each on its own task, and answer with a completion frame
//! carrying the outcome. All invocations of a connection are cancelled when
//! the socket goes away.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use outcome_core::{detail_keys, Classifier, Command, Outcome, TransportError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::AppState;
use crate::network::connection::{ConnectionHandle, OutboundMessage};
use crate::network::middleware::REQUEST_ID_HEADER;
use crate::network::problem::HttpTransport;
use crate::service::classify::hub_classifier;
use crate::service::intercept::TransportAdapter;
use crate::service::invocation::{transport_names, Invocation, InvocationContext, InvocationError};
use crate::service::middleware::{dispatch, InvocationPipeline};

/// Client-to-server frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InboundFrame {
    #[serde(rename_all = "camelCase")]
    Invocation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invocation_id: Option<String>,
        target: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<Command<Value>>,
    },
    Ping,
}

/// Server-to-client frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum OutboundFrame {
    #[serde(rename_all = "camelCase")]
    Completion {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        invocation_id: Option<String>,
        result: Outcome<Value>,
    },
    Pong,
}

/// Adapter for hub invocations. The native form is the outcome that goes
/// into a completion frame.
pub struct HubTransport;

impl TransportAdapter for HubTransport {
    const NAME: &'static str = transport_names::HUB;

    type Native = Outcome<Value>;

    fn classifier() -> Classifier {
        hub_classifier()
    }

    /// Failures always name the hub and method they came from.
    fn into_native(outcome: Outcome<Value>, ctx: &InvocationContext) -> Outcome<Value> {
        match outcome {
            Outcome::Failure(failure) => Outcome::Failure(failure.with_details(&ctx.extensions)),
            success @ Outcome::Success(_) => success,
        }
    }
}

/// Upgrades to a hub connection, or answers with a problem response when
/// the hub does not exist or the request is not a WebSocket upgrade.
pub async fn hub_upgrade_handler(
    State(state): State<AppState>,
    Path(hub): Path<String>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let mut ctx = InvocationContext::new(
        transport_names::HTTP,
        format!("hubs/{hub}"),
        state.server.invocation_timeout(),
    );
    if let Some(request_id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        ctx = ctx.with_trace_id(request_id);
    }

    let Some(pipeline) = state.hubs.get(&hub).cloned() else {
        let err = anyhow::Error::new(InvocationError::UnknownOperation { name: hub });
        return reject_upgrade(&state, &ctx, &err);
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = anyhow::Error::new(TransportError::MalformedRequest {
                reason: rejection.body_text(),
            });
            return reject_upgrade(&state, &ctx, &err);
        }
    };

    let connection = &state.config.connection;
    ws.write_buffer_size(connection.ws_write_buffer_size)
        .max_write_buffer_size(connection.ws_max_write_buffer_size)
        .on_upgrade(move |socket| handle_socket(socket, state, hub, pipeline))
}

fn reject_upgrade(state: &AppState, ctx: &InvocationContext, err: &anyhow::Error) -> Response {
    let failure = state.http_interceptor.translate_error(ctx, err);
    HttpTransport::into_native(Outcome::Failure(failure), ctx)
}

async fn handle_socket(socket: WebSocket, state: AppState, hub: String, pipeline: InvocationPipeline) {
    let (handle, mut rx) = state.registry.register(&hub, &state.config.connection);
    let connection_id = handle.id.0;
    info!(connection_id, hub = %hub, "hub connection opened");

    let (mut sink, mut stream) = socket.split();

    // Frames queued before cancellation (such as a shutdown Close) are still
    // written because the receive branch is polled first.
    let writer_cancel = handle.cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                biased;
                message = rx.recv() => message,
                () = writer_cancel.cancelled() => None,
            };
            let Some(message) = message else { break };
            let (frame, closing) = match message {
                OutboundMessage::Text(text) => (Message::Text(text.into()), false),
                OutboundMessage::Close(reason) => (
                    Message::Close(Some(CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.unwrap_or_default().into(),
                    })),
                    true,
                ),
            };
            if sink.send(frame).await.is_err() || closing {
                break;
            }
        }
    });

    let reader_cancel = handle.cancel.clone();
    loop {
        let message = tokio::select! {
            () = reader_cancel.cancelled() => break,
            message = stream.next() => message,
        };
        match message {
            Some(Ok(Message::Text(text))) => {
                on_text(&state, &hub, &pipeline, &handle, text.as_str()).await;
            }
            Some(Ok(Message::Binary(_))) => {
                let err = anyhow::Error::new(TransportError::MalformedRequest {
                    reason: "binary frames are not supported".to_string(),
                });
                reject_frame(&state, &hub, &handle, None, "", &err).await;
            }
            Some(Ok(Message::Close(_))) | None => break,
            // Ping/pong are answered by the WebSocket layer.
            Some(Ok(_)) => {}
            Some(Err(err)) => {
                let ctx = hub_context(&state, &hub, "", &handle);
                let failure = state
                    .hub_interceptor
                    .translate_error(&ctx, &anyhow::Error::new(err));
                debug!(connection_id, status = %failure.status_code(), "hub socket failed");
                break;
            }
        }
    }

    // Removing the connection cancels whatever it still has in flight.
    state.registry.remove(handle.id);
    drop(handle);
    if let Err(err) = writer.await {
        warn!(connection_id, error = %err, "hub writer task failed");
    }
    info!(connection_id, hub = %hub, "hub connection closed");
}

async fn on_text(
    state: &AppState,
    hub: &str,
    pipeline: &InvocationPipeline,
    handle: &Arc<ConnectionHandle>,
    text: &str,
) {
    match serde_json::from_str::<InboundFrame>(text) {
        Ok(InboundFrame::Ping) => {
            send_frame(handle, &OutboundFrame::Pong, state.config.connection.send_timeout).await;
        }
        Ok(InboundFrame::Invocation {
            invocation_id,
            target,
            command,
        }) => {
            let (command_id, payload) = command.unwrap_or_default().into_parts();
            let ctx = hub_context(state, hub, &target, handle).with_command_id(command_id);
            let pipeline = pipeline.clone();
            let handle = Arc::clone(handle);
            let send_timeout = state.config.connection.send_timeout;

            tokio::spawn(async move {
                let invocation = Invocation::new(ctx.clone(), payload.unwrap_or(Value::Null));
                let outcome = dispatch(&pipeline, invocation).await;
                let frame = OutboundFrame::Completion {
                    invocation_id,
                    result: HubTransport::into_native(outcome, &ctx),
                };
                send_frame(&handle, &frame, send_timeout).await;
            });
        }
        Err(err) => {
            // Keep whatever the client can correlate on, if the frame was JSON at all.
            let partial: Option<Value> = serde_json::from_str(text).ok();
            let field = |name: &str| {
                partial
                    .as_ref()
                    .and_then(|v| v.get(name))
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            let method = field("target").unwrap_or_default();
            reject_frame(
                state,
                hub,
                handle,
                field("invocationId"),
                &method,
                &anyhow::Error::new(err),
            )
            .await;
        }
    }
}

/// Context for one hub call; cancelled together with its connection.
fn hub_context(
    state: &AppState,
    hub: &str,
    method: &str,
    handle: &ConnectionHandle,
) -> InvocationContext {
    InvocationContext::new(transport_names::HUB, method, state.server.invocation_timeout())
        .with_cancel(handle.cancel.child_token())
        .with_extension(detail_keys::HUB_TYPE, hub)
        .with_extension(detail_keys::HUB_METHOD, method)
}

/// Answer a frame that never reached a pipeline.
async fn reject_frame(
    state: &AppState,
    hub: &str,
    handle: &ConnectionHandle,
    invocation_id: Option<String>,
    method: &str,
    err: &anyhow::Error,
) {
    let ctx = hub_context(state, hub, method, handle);
    let failure = state.hub_interceptor.translate_error(&ctx, err);
    let frame = OutboundFrame::Completion {
        invocation_id,
        result: HubTransport::into_native(Outcome::Failure(failure), &ctx),
    };
    send_frame(handle, &frame, state.config.connection.send_timeout).await;
}

async fn send_frame(handle: &ConnectionHandle, frame: &OutboundFrame, timeout: Duration) {
    // Completions can outlive the socket they answer.
    if !handle.is_connected() {
        debug!(connection_id = handle.id.0, "connection closed, dropping hub frame");
        return;
    }
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            warn!(connection_id = handle.id.0, error = %err, "failed to encode hub frame");
            return;
        }
    };
    if let Err(err) = handle
        .send_timeout(OutboundMessage::Text(text), timeout)
        .await
    {
        debug!(connection_id = handle.id.0, error = ?err, "dropped hub frame");
    }
}
