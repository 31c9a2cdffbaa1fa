//! Transport-specific classification layers.
//!
//! Each transport gets the core base layer plus a `pipeline` layer for
//! errors raised by the tower stack, with its own layer in front of both.

use std::error::Error as StdError;

use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use outcome_core::classify::DEFAULT_LAYER;
use outcome_core::{Classifier, FailureKind};

use crate::actor::ActorError;
use crate::service::invocation::InvocationError;

pub const PIPELINE_LAYER: &str = "pipeline";
pub const HTTP_LAYER: &str = "http";
pub const HUB_LAYER: &str = "hub";
pub const ACTOR_LAYER: &str = "actor";

/// Base layer plus the pipeline layer; the starting point for every transport.
#[must_use]
pub fn pipeline_classifier() -> Classifier {
    Classifier::base().with_layer(PIPELINE_LAYER, pipeline_rule)
}

#[must_use]
pub fn http_classifier() -> Classifier {
    pipeline_classifier().with_layer(HTTP_LAYER, http_rule)
}

#[must_use]
pub fn hub_classifier() -> Classifier {
    pipeline_classifier().with_layer(HUB_LAYER, hub_rule)
}

#[must_use]
pub fn actor_classifier() -> Classifier {
    pipeline_classifier().with_layer(ACTOR_LAYER, actor_rule)
}

fn pipeline_rule(err: &(dyn StdError + 'static)) -> Option<FailureKind> {
    if let Some(e) = err.downcast_ref::<InvocationError>() {
        return match e {
            InvocationError::UnknownOperation { .. } => Some(FailureKind::NotFound),
            InvocationError::Timeout { .. } => Some(FailureKind::Timeout),
            InvocationError::Overloaded => Some(FailureKind::Unavailable),
            // `Handler` is transparent, so its own chain skips the wrapped error.
            InvocationError::Handler(inner) => {
                let inner: &(dyn StdError + 'static) = inner.as_ref();
                let classification = pipeline_classifier().classify(inner);
                (classification.layer != DEFAULT_LAYER).then_some(classification.kind)
            }
        };
    }
    if err.is::<tokio::time::error::Elapsed>() {
        return Some(FailureKind::Timeout);
    }
    if let Some(e) = err.downcast_ref::<tokio::task::JoinError>() {
        return Some(if e.is_cancelled() {
            FailureKind::Cancelled
        } else {
            FailureKind::Internal
        });
    }
    None
}

fn http_rule(err: &(dyn StdError + 'static)) -> Option<FailureKind> {
    if let Some(rejection) = err.downcast_ref::<JsonRejection>() {
        return Some(match rejection {
            JsonRejection::JsonDataError(_) => FailureKind::Validation,
            _ => FailureKind::MalformedRequest,
        });
    }
    if err.is::<PathRejection>()
        || err.is::<QueryRejection>()
        || err.is::<http::Error>()
        || err.is::<http::header::InvalidHeaderValue>()
        || err.is::<http::header::ToStrError>()
    {
        return Some(FailureKind::MalformedRequest);
    }
    if let Some(InvocationError::UnknownOperation { .. }) = err.downcast_ref::<InvocationError>() {
        return Some(FailureKind::NotFound);
    }
    None
}

fn hub_rule(err: &(dyn StdError + 'static)) -> Option<FailureKind> {
    if let Some(InvocationError::UnknownOperation { .. }) = err.downcast_ref::<InvocationError>() {
        return Some(FailureKind::HubInvocation);
    }
    if err.is::<axum::Error>() {
        return Some(FailureKind::TransportFault);
    }
    if err.is::<serde_json::Error>() {
        return Some(FailureKind::MalformedRequest);
    }
    None
}

fn actor_rule(err: &(dyn StdError + 'static)) -> Option<FailureKind> {
    err.downcast_ref::<ActorError>().map(ActorError::kind)
}

#[cfg(test)]
mod tests {
    use outcome_core::{CommandError, StatusCode};

    use super::*;

    fn unknown() -> InvocationError {
        InvocationError::UnknownOperation {
            name: "Missing".into(),
        }
    }

    #[test]
    fn unknown_operation_depends_on_transport() {
        assert_eq!(http_classifier().classify(&unknown()).status, StatusCode::NotFound);
        let hub = hub_classifier().classify(&unknown());
        assert_eq!(hub.kind, FailureKind::HubInvocation);
        assert_eq!(hub.status, StatusCode::BadRequest);
        assert_eq!(hub.layer, HUB_LAYER);
    }

    #[test]
    fn pipeline_errors_have_fixed_kinds() {
        let classifier = pipeline_classifier();
        let overloaded = classifier.classify(&InvocationError::Overloaded);
        assert_eq!(overloaded.status, StatusCode::ServiceUnavailable);
        assert_eq!(overloaded.layer, PIPELINE_LAYER);
        let timeout = classifier.classify(&InvocationError::Timeout { timeout_ms: 5 });
        assert_eq!(timeout.status, StatusCode::RequestTimeout);
    }

    #[test]
    fn wrapped_handler_errors_keep_their_own_kind() {
        let err = InvocationError::Handler(anyhow::Error::new(CommandError::NotAuthenticated));
        let classification = http_classifier().classify(&err);
        assert_eq!(classification.status, StatusCode::Unauthorized);
        assert_eq!(classification.layer, PIPELINE_LAYER);

        let nested = InvocationError::Handler(
            anyhow::Error::new(CommandError::Cancelled).context("while saving"),
        );
        assert_eq!(
            pipeline_classifier().classify(&nested).kind,
            FailureKind::Cancelled
        );
    }

    #[test]
    fn unrecognised_handler_errors_are_internal() {
        let err = InvocationError::Handler(anyhow::anyhow!("boom"));
        let classification = hub_classifier().classify(&err);
        assert_eq!(classification.status, StatusCode::InternalServerError);
        assert_eq!(classification.layer, DEFAULT_LAYER);
    }

    #[test]
    fn socket_errors_are_transport_faults() {
        let err = axum::Error::new(std::io::Error::other("reset"));
        assert_eq!(
            hub_classifier().classify(&err).kind,
            FailureKind::TransportFault
        );
    }

    #[test]
    fn closed_mailboxes_are_unavailable() {
        let err = ActorError::MailboxClosed {
            actor_id: "counter-1".into(),
        };
        assert_eq!(
            actor_classifier().classify(&err).status,
            StatusCode::ServiceUnavailable
        );
    }
}
