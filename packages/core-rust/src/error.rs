//! Failure families raised by handlers and transports.
//!
//! Handlers return these (usually wrapped in `anyhow::Error`) and the
//! classifier maps them onto [`FailureKind`]s. Nothing here decides how a
//! failure is rendered; that is the transport's job.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::command::{CommandExecutionStatus, CommandId};
use crate::status::FailureKind;

/// Field name -> messages, as attached to the `validationErrors` extension.
pub type ValidationErrors = BTreeMap<String, Vec<String>>;

/// General-purpose failures a command handler can raise.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("one or more validation errors occurred")]
    Validation { errors: ValidationErrors },
    #[error("invalid argument `{name}`: {reason}")]
    InvalidArgument { name: String, reason: String },
    #[error("{resource} was not found")]
    NotFound { resource: String },
    #[error("not authorized: {reason}")]
    NotAuthorized { reason: String },
    #[error("authentication required")]
    NotAuthenticated,
    #[error("conflict: {reason}")]
    Conflict { reason: String },
    #[error("not implemented: {feature}")]
    NotImplemented { feature: String },
    #[error("timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },
    #[error("operation was cancelled")]
    Cancelled,
    #[error("{reason}")]
    Fault { reason: String },
}

impl CommandError {
    /// Single-field validation failure.
    #[must_use]
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        let mut errors = ValidationErrors::new();
        errors.insert(field.into(), vec![message.into()]);
        CommandError::Validation { errors }
    }

    /// The taxonomy entry for this error.
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            CommandError::Validation { .. } | CommandError::InvalidArgument { .. } => {
                FailureKind::Validation
            }
            CommandError::NotFound { .. } => FailureKind::NotFound,
            CommandError::NotAuthorized { .. } => FailureKind::NotAuthorized,
            CommandError::NotAuthenticated => FailureKind::NotAuthenticated,
            CommandError::Conflict { .. } => FailureKind::Conflict,
            CommandError::NotImplemented { .. } => FailureKind::NotImplemented,
            CommandError::Timeout { .. } => FailureKind::Timeout,
            CommandError::Cancelled => FailureKind::Cancelled,
            CommandError::Fault { .. } => FailureKind::Internal,
        }
    }
}

/// Failures that originate in a transport rather than in a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("malformed request: {reason}")]
    MalformedRequest { reason: String },
    #[error("the connection was aborted")]
    ConnectionAborted,
    #[error("failed to invoke hub method `{hub}.{method}`: {reason}")]
    HubInvocation {
        hub: String,
        method: String,
        reason: String,
    },
    #[error("the anti-forgery token could not be validated")]
    AntiForgery,
    #[error("the request matched multiple endpoints: {path}")]
    AmbiguousRoute { path: String },
    #[error("authentication handshake failed: {reason}")]
    AuthHandshake { reason: String },
}

impl TransportError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            TransportError::MalformedRequest { .. } => FailureKind::MalformedRequest,
            TransportError::ConnectionAborted => FailureKind::TransportFault,
            TransportError::HubInvocation { .. } => FailureKind::HubInvocation,
            TransportError::AntiForgery => FailureKind::AntiForgery,
            TransportError::AmbiguousRoute { .. } => FailureKind::Internal,
            TransportError::AuthHandshake { .. } => FailureKind::NotAuthenticated,
        }
    }
}

/// Rejection reasons for [`CommandId::parse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandIdError {
    #[error("command id must not be empty")]
    Empty,
    #[error("command id exceeds {max} bytes")]
    TooLong { max: usize },
    #[error("command id must not contain control characters")]
    ControlCharacter,
}

/// Errors returned by [`IdempotencyStore`](crate::store::IdempotencyStore) implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store operation was cancelled")]
    Cancelled,
    #[error("illegal status transition for command {id}: {from:?} -> {to:?}")]
    IllegalTransition {
        id: CommandId,
        from: CommandExecutionStatus,
        to: CommandExecutionStatus,
    },
    #[error("command {id} is in a terminal state and cannot be modified")]
    TerminalState { id: CommandId },
    #[error("failed to encode or decode a stored result: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("store backend failure: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap an implementation-specific failure.
    pub fn backend(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        StoreError::Backend(err.into())
    }

    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            StoreError::Cancelled => FailureKind::Cancelled,
            StoreError::IllegalTransition { .. } | StoreError::TerminalState { .. } => {
                FailureKind::Conflict
            }
            StoreError::Serialization(_) => FailureKind::Internal,
            StoreError::Backend(_) => FailureKind::Unavailable,
        }
    }
}
