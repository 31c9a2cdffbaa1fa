//! HTTP rendering of outcomes.
//!
//! Successes are `200` with the outcome JSON. Failures use the status of
//! their classified code and an RFC 7807 `application/problem+json` body
//! whose extension members are the failure's `errorDetails`.

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use outcome_core::{Classifier, Failure, Outcome};
use serde_json::{Map, Value};

use crate::service::classify::http_classifier;
use crate::service::intercept::TransportAdapter;
use crate::service::invocation::{transport_names, InvocationContext};

pub const PROBLEM_CONTENT_TYPE: &str = "application/problem+json";

/// Adapter for `POST /commands/{operation}`.
pub struct HttpTransport;

impl TransportAdapter for HttpTransport {
    const NAME: &'static str = transport_names::HTTP;

    type Native = Response;

    fn classifier() -> Classifier {
        http_classifier()
    }

    fn into_native(outcome: Outcome<Value>, _ctx: &InvocationContext) -> Response {
        match outcome {
            Outcome::Success(_) => (StatusCode::OK, Json(outcome)).into_response(),
            Outcome::Failure(failure) => problem_response(&failure),
        }
    }
}

/// `{type, title, status, detail, ...errorDetails}`. Reserved members win
/// over details with the same name.
#[must_use]
pub fn problem_body(failure: &Failure) -> Value {
    let status = failure.status_code();
    let mut body = Map::new();
    if let Some(details) = failure.error_details() {
        for (key, value) in details {
            body.insert(key.clone(), value.clone());
        }
    }
    body.insert("type".into(), Value::from("about:blank"));
    body.insert("title".into(), Value::from(status.reason()));
    body.insert("status".into(), Value::from(status.as_u16()));
    if let Some(message) = failure.error_message() {
        body.insert("detail".into(), Value::from(message));
    }
    Value::Object(body)
}

#[must_use]
pub fn problem_response(failure: &Failure) -> Response {
    let status = StatusCode::from_u16(failure.status_code().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(problem_body(failure))).into_response();
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(PROBLEM_CONTENT_TYPE),
    );
    response
}

#[cfg(test)]
mod tests {
    use axum::body::to_bytes;
    use outcome_core::{detail_keys, StatusCode as OutcomeStatus};
    use serde_json::json;

    use super::*;

    fn ctx() -> InvocationContext {
        InvocationContext::new(transport_names::HTTP, "op", std::time::Duration::from_secs(1))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn success_is_200_with_outcome_json() {
        let response = HttpTransport::into_native(Outcome::succeed(json!({"n": 1})), &ctx());
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            body_json(response).await,
            json!({"isSuccess": true, "value": {"n": 1}})
        );
    }

    #[tokio::test]
    async fn failure_becomes_problem_details() {
        let failure = Failure::new(OutcomeStatus::Conflict)
            .with_message("already exists")
            .with_detail(detail_keys::TRACE_ID, "t-1")
            .with_detail("status", 1);
        let response = HttpTransport::into_native(Outcome::Failure(failure), &ctx());

        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(response.headers()[header::CONTENT_TYPE], PROBLEM_CONTENT_TYPE);
        assert_eq!(
            body_json(response).await,
            json!({
                "type": "about:blank",
                "title": "Conflict",
                "status": 409,
                "detail": "already exists",
                "traceId": "t-1",
            })
        );
    }

    #[tokio::test]
    async fn client_closed_request_keeps_its_code() {
        let response = problem_response(&Failure::new(OutcomeStatus::ClientClosedRequest));
        assert_eq!(response.status().as_u16(), 499);
        let body = body_json(response).await;
        assert_eq!(body["status"], 499);
        assert!(body.get("detail").is_none());
    }
}
