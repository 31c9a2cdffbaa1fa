//! Layered failure classification.
//!
//! A [`Classifier`] is an ordered list of pure rules. Transport-specific layers
//! sit in front of the base layer; the first rule that recognises any error in
//! the `source()` chain decides the [`FailureKind`]. Nothing recognised means
//! [`FailureKind::Internal`], so classification is total.

use std::error::Error as StdError;
use std::io;
use std::num::{ParseFloatError, ParseIntError};
use std::str::ParseBoolError;

use crate::error::{CommandError, CommandIdError, StoreError, TransportError};
use crate::outcome::Failure;
use crate::status::{FailureKind, StatusCode};

/// A single classification rule. Returns `None` when it does not recognise `err`.
pub type ClassifyRule = fn(&(dyn StdError + 'static)) -> Option<FailureKind>;

/// Name of the layer every classifier ends with.
pub const BASE_LAYER: &str = "base";

/// Name reported when no layer matched.
pub const DEFAULT_LAYER: &str = "default";

// ---------------------------------------------------------------------------
// ClassifierLayer / Classification
// ---------------------------------------------------------------------------

#[derive(Clone, Copy)]
pub struct ClassifierLayer {
    pub name: &'static str,
    pub rule: ClassifyRule,
}

impl std::fmt::Debug for ClassifierLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClassifierLayer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Result of classifying one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    pub status: StatusCode,
    /// Layer that produced the match, or [`DEFAULT_LAYER`].
    pub layer: &'static str,
}

impl Classification {
    fn new(kind: FailureKind, layer: &'static str) -> Self {
        Self {
            kind,
            status: kind.status_code(),
            layer,
        }
    }

    fn fallback() -> Self {
        Self::new(FailureKind::Internal, DEFAULT_LAYER)
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Ordered sequence of classification layers, most specific first.
#[derive(Debug, Clone)]
pub struct Classifier {
    layers: Vec<ClassifierLayer>,
}

impl Classifier {
    /// Classifier with only the general-purpose base layer.
    #[must_use]
    pub fn base() -> Self {
        Self {
            layers: vec![ClassifierLayer {
                name: BASE_LAYER,
                rule: base_rule,
            }],
        }
    }

    /// Register a layer in front of every existing one.
    #[must_use]
    pub fn with_layer(mut self, name: &'static str, rule: ClassifyRule) -> Self {
        self.layers.insert(0, ClassifierLayer { name, rule });
        self
    }

    /// Layer names in evaluation order.
    pub fn layer_names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.layers.iter().map(|layer| layer.name)
    }

    /// Classify `err`.
    ///
    /// Each layer is tried against every error in the chain, outermost first,
    /// before the next layer is consulted.
    #[must_use]
    pub fn classify(&self, err: &(dyn StdError + 'static)) -> Classification {
        self.layers
            .iter()
            .find_map(|layer| {
                std::iter::successors(Some(err), |&e| e.source())
                    .find_map(layer.rule)
                    .map(|kind| Classification::new(kind, layer.name))
            })
            .unwrap_or_else(Classification::fallback)
    }

    /// Classify a failure that may not carry an error value at all.
    #[must_use]
    pub fn classify_optional(&self, err: Option<&(dyn StdError + 'static)>) -> Classification {
        err.map_or_else(Classification::fallback, |err| self.classify(err))
    }
}

impl Default for Classifier {
    fn default() -> Self {
        Self::base()
    }
}

fn base_rule(err: &(dyn StdError + 'static)) -> Option<FailureKind> {
    if let Some(e) = err.downcast_ref::<CommandError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<TransportError>() {
        return Some(e.kind());
    }
    if let Some(e) = err.downcast_ref::<StoreError>() {
        return Some(e.kind());
    }
    if let Some(failure) = err.downcast_ref::<Failure>() {
        return Some(kind_for_status(failure.status_code()));
    }
    if err.is::<CommandIdError>() {
        return Some(FailureKind::Validation);
    }
    if let Some(e) = err.downcast_ref::<io::Error>() {
        return io_kind(e.kind());
    }
    if err.is::<serde_json::Error>() {
        return Some(FailureKind::MalformedRequest);
    }
    if err.is::<ParseIntError>() || err.is::<ParseFloatError>() || err.is::<ParseBoolError>() {
        return Some(FailureKind::Validation);
    }
    None
}

fn io_kind(kind: io::ErrorKind) -> Option<FailureKind> {
    match kind {
        io::ErrorKind::NotFound => Some(FailureKind::NotFound),
        io::ErrorKind::PermissionDenied => Some(FailureKind::NotAuthorized),
        io::ErrorKind::TimedOut => Some(FailureKind::Timeout),
        io::ErrorKind::AlreadyExists => Some(FailureKind::Conflict),
        io::ErrorKind::InvalidInput => Some(FailureKind::Validation),
        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof => {
            Some(FailureKind::MalformedRequest)
        }
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::BrokenPipe => Some(FailureKind::TransportFault),
        io::ErrorKind::Unsupported => Some(FailureKind::NotImplemented),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotConnected => {
            Some(FailureKind::Unavailable)
        }
        _ => None,
    }
}

/// Inverse of [`FailureKind::status_code`], picking the canonical kind per code.
fn kind_for_status(status: StatusCode) -> FailureKind {
    match status {
        StatusCode::BadRequest => FailureKind::Validation,
        StatusCode::Unauthorized => FailureKind::NotAuthenticated,
        StatusCode::Forbidden => FailureKind::NotAuthorized,
        StatusCode::NotFound => FailureKind::NotFound,
        StatusCode::RequestTimeout => FailureKind::Timeout,
        StatusCode::Conflict => FailureKind::Conflict,
        StatusCode::ClientClosedRequest => FailureKind::Cancelled,
        StatusCode::InternalServerError => FailureKind::Internal,
        StatusCode::NotImplemented => FailureKind::NotImplemented,
        StatusCode::ServiceUnavailable => FailureKind::Unavailable,
    }
}
