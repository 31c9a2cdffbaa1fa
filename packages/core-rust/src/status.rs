//! Status codes and the failure taxonomy.
//!
//! [`FailureKind`] is the closed set of failure categories the classifier can
//! produce. Each kind maps to exactly one [`StatusCode`], so every classified
//! failure carries a status a transport knows how to render.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status codes carried by failed outcomes.
///
/// Values follow HTTP semantics so the HTTP transport can use them directly.
/// `ClientClosedRequest` (499) is the de-facto code for a caller that went
/// away before the call completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum StatusCode {
    BadRequest,
    Unauthorized,
    Forbidden,
    NotFound,
    RequestTimeout,
    Conflict,
    ClientClosedRequest,
    InternalServerError,
    NotImplemented,
    ServiceUnavailable,
}

impl StatusCode {
    /// All codes, in ascending numeric order.
    pub const ALL: [StatusCode; 10] = [
        StatusCode::BadRequest,
        StatusCode::Unauthorized,
        StatusCode::Forbidden,
        StatusCode::NotFound,
        StatusCode::RequestTimeout,
        StatusCode::Conflict,
        StatusCode::ClientClosedRequest,
        StatusCode::InternalServerError,
        StatusCode::NotImplemented,
        StatusCode::ServiceUnavailable,
    ];

    /// Numeric value of the code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        match self {
            StatusCode::BadRequest => 400,
            StatusCode::Unauthorized => 401,
            StatusCode::Forbidden => 403,
            StatusCode::NotFound => 404,
            StatusCode::RequestTimeout => 408,
            StatusCode::Conflict => 409,
            StatusCode::ClientClosedRequest => 499,
            StatusCode::InternalServerError => 500,
            StatusCode::NotImplemented => 501,
            StatusCode::ServiceUnavailable => 503,
        }
    }

    /// Canonical reason phrase.
    #[must_use]
    pub const fn reason(self) -> &'static str {
        match self {
            StatusCode::BadRequest => "Bad Request",
            StatusCode::Unauthorized => "Unauthorized",
            StatusCode::Forbidden => "Forbidden",
            StatusCode::NotFound => "Not Found",
            StatusCode::RequestTimeout => "Request Timeout",
            StatusCode::Conflict => "Conflict",
            StatusCode::ClientClosedRequest => "Client Closed Request",
            StatusCode::InternalServerError => "Internal Server Error",
            StatusCode::NotImplemented => "Not Implemented",
            StatusCode::ServiceUnavailable => "Service Unavailable",
        }
    }

    /// Returns `true` for 5xx codes.
    #[must_use]
    pub const fn is_server_error(self) -> bool {
        self.as_u16() >= 500
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.as_u16(), self.reason())
    }
}

impl From<StatusCode> for u16 {
    fn from(code: StatusCode) -> Self {
        code.as_u16()
    }
}

/// Error returned when a number is not one of the known [`StatusCode`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unsupported status code: {0}")]
pub struct UnknownStatusCode(pub u16);

impl TryFrom<u16> for StatusCode {
    type Error = UnknownStatusCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        StatusCode::ALL
            .into_iter()
            .find(|code| code.as_u16() == value)
            .ok_or(UnknownStatusCode(value))
    }
}

/// Failure categories recognised by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Input failed validation rules.
    Validation,
    /// The request could not be decoded or is structurally invalid.
    MalformedRequest,
    /// A realtime hub method could not be invoked.
    HubInvocation,
    /// An anti-forgery or validation token check failed.
    AntiForgery,
    /// The caller is not authenticated, including failed auth handshakes.
    NotAuthenticated,
    /// The caller is authenticated but not allowed to perform the call.
    NotAuthorized,
    NotFound,
    Timeout,
    Conflict,
    /// The call was cancelled before it completed.
    Cancelled,
    /// The underlying connection dropped or was aborted.
    TransportFault,
    NotImplemented,
    /// A dependency (store, mailbox) is unavailable.
    Unavailable,
    /// Anything unrecognised.
    Internal,
}

impl FailureKind {
    /// Status code for this kind.
    #[must_use]
    pub const fn status_code(self) -> StatusCode {
        match self {
            FailureKind::Validation
            | FailureKind::MalformedRequest
            | FailureKind::HubInvocation
            | FailureKind::AntiForgery => StatusCode::BadRequest,
            FailureKind::NotAuthenticated => StatusCode::Unauthorized,
            FailureKind::NotAuthorized => StatusCode::Forbidden,
            FailureKind::NotFound => StatusCode::NotFound,
            FailureKind::Timeout => StatusCode::RequestTimeout,
            FailureKind::Conflict => StatusCode::Conflict,
            FailureKind::Cancelled | FailureKind::TransportFault => {
                StatusCode::ClientClosedRequest
            }
            FailureKind::Internal => StatusCode::InternalServerError,
            FailureKind::NotImplemented => StatusCode::NotImplemented,
            FailureKind::Unavailable => StatusCode::ServiceUnavailable,
        }
    }
}
