//! Actor transport: stateful handlers that process one call at a time.
//!
//! Each actor owns a tokio task fed by a bounded mailbox. The interception
//! contract runs inside that task, so an actor method sees the same
//! idempotency and error translation as an HTTP command or hub method.

use async_trait::async_trait;
use outcome_core::{Classifier, FailureKind, Outcome};
use serde_json::Value;

use crate::service::classify::actor_classifier;
use crate::service::intercept::TransportAdapter;
use crate::service::invocation::{transport_names, InvocationContext};

mod host;

pub use host::{ActorHost, ActorHostConfig, ActorRef};

/// A stateful handler living behind a mailbox.
#[async_trait]
pub trait Actor: Send + 'static {
    /// Reported as `actorType` on failures.
    fn actor_type(&self) -> &'static str;

    /// Handle one call. Calls never overlap, so `&mut self` needs no locking.
    async fn handle(&mut self, method: &str, payload: Value) -> anyhow::Result<Value>;
}

#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error("mailbox of actor {actor_id} is closed")]
    MailboxClosed { actor_id: String },
    #[error("actor {actor_id} stopped before replying")]
    ReplyDropped { actor_id: String },
    #[error("actor type {actor_type} has no method {method}")]
    UnknownMethod { actor_type: String, method: String },
}

impl ActorError {
    #[must_use]
    pub fn unknown_method(actor_type: &str, method: &str) -> Self {
        ActorError::UnknownMethod {
            actor_type: actor_type.to_string(),
            method: method.to_string(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            ActorError::MailboxClosed { .. } | ActorError::ReplyDropped { .. } => {
                FailureKind::Unavailable
            }
            ActorError::UnknownMethod { .. } => FailureKind::NotFound,
        }
    }
}

/// Actor calls already answer with outcomes; the native shape is the outcome.
pub struct ActorTransport;

impl TransportAdapter for ActorTransport {
    const NAME: &'static str = transport_names::ACTOR;
    type Native = Outcome<Value>;

    fn classifier() -> Classifier {
        actor_classifier()
    }

    fn into_native(outcome: Outcome<Value>, _ctx: &InvocationContext) -> Outcome<Value> {
        outcome
    }
}
