//! The outcome value returned in place of raw success-or-error.
//!
//! An [`Outcome`] is either a success carrying a value or a [`Failure`]
//! carrying exactly one classified [`StatusCode`]. The enum shape makes the
//! success-XOR-failure invariant structural; the hand-written serde impls
//! enforce it on the wire as well.

use std::collections::BTreeMap;
use std::error::Error as StdError;
use std::fmt;

use serde::de::{self, DeserializeOwned, IntoDeserializer};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use crate::error::{CommandError, CommandIdError, StoreError, TransportError};
use crate::status::StatusCode;

/// Extension data attached to a failure.
///
/// Ordered so that serializing the same failure twice yields identical bytes.
pub type ErrorDetails = BTreeMap<String, Value>;

/// Well-known keys in [`ErrorDetails`].
pub mod detail_keys {
    pub const TRACE_ID: &str = "traceId";
    pub const VALIDATION_ERRORS: &str = "validationErrors";
    pub const INNER_EXCEPTION: &str = "innerException";
    pub const STACK_TRACE: &str = "stackTrace";
    pub const ERROR_TYPE: &str = "errorType";
    pub const HUB_TYPE: &str = "hubType";
    pub const HUB_METHOD: &str = "hubMethod";
    pub const ACTOR_TYPE: &str = "actorType";
    pub const ACTOR_ID: &str = "actorId";
}

/// Controls which diagnostic details [`Failure::from_error`] attaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DetailOptions {
    /// Attach the inner error chain. Off by default so internals do not
    /// leak to external callers.
    pub include_diagnostics: bool,
}

/// The failure half of an [`Outcome`].
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    status_code: StatusCode,
    error_message: Option<String>,
    error_details: Option<ErrorDetails>,
}

impl Failure {
    #[must_use]
    pub fn new(status_code: StatusCode) -> Self {
        Self {
            status_code,
            error_message: None,
            error_details: None,
        }
    }

    /// Build a failure from an error and its `source()` chain.
    ///
    /// The message is the outermost error's `Display`. Validation errors found
    /// anywhere in the chain are always attached; the rest of the chain only
    /// when `options.include_diagnostics` is set.
    #[must_use]
    pub fn from_error(
        err: &(dyn StdError + 'static),
        status_code: StatusCode,
        options: &DetailOptions,
    ) -> Self {
        let mut failure = Self::new(status_code).with_message(err.to_string());

        let validation = chain(err).find_map(|e| match e.downcast_ref::<CommandError>() {
            Some(CommandError::Validation { errors }) => Some(errors),
            _ => None,
        });
        if let Some(errors) = validation {
            failure = failure.with_detail(
                detail_keys::VALIDATION_ERRORS,
                serde_json::to_value(errors).unwrap_or(Value::Null),
            );
        }

        if options.include_diagnostics {
            failure = failure.with_detail(detail_keys::ERROR_TYPE, error_type_name(err));
            if let Some(inner) = err.source().map(inner_exception) {
                failure = failure.with_detail(detail_keys::INNER_EXCEPTION, inner);
            }
        }

        failure
    }

    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.error_details
            .get_or_insert_with(ErrorDetails::new)
            .insert(key.into(), value.into());
        self
    }

    /// Merge `details` in; existing keys are kept.
    #[must_use]
    pub fn with_details(mut self, details: &ErrorDetails) -> Self {
        if details.is_empty() {
            return self;
        }
        let target = self.error_details.get_or_insert_with(ErrorDetails::new);
        for (key, value) in details {
            target.entry(key.clone()).or_insert_with(|| value.clone());
        }
        self
    }

    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.status_code
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    #[must_use]
    pub fn error_details(&self) -> Option<&ErrorDetails> {
        self.error_details.as_ref()
    }

    #[must_use]
    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.error_details.as_ref().and_then(|d| d.get(key))
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_message {
            Some(message) => write!(f, "{}: {message}", self.status_code),
            None => write!(f, "{}", self.status_code),
        }
    }
}

impl StdError for Failure {}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

/// Type name of the error that caused `err`.
///
/// The first member of a known error family in the chain wins and is
/// qualified by its variant (`CommandError::NotFound`). Otherwise the root
/// cause is named by the head of its `Debug` output, or `Error` if that is
/// not an identifier.
#[must_use]
pub fn error_type_name(err: &(dyn StdError + 'static)) -> String {
    for e in chain(err) {
        if let Some(e) = e.downcast_ref::<CommandError>() {
            return qualified("CommandError", &format!("{e:?}"));
        }
        if let Some(e) = e.downcast_ref::<TransportError>() {
            return qualified("TransportError", &format!("{e:?}"));
        }
        if let Some(e) = e.downcast_ref::<StoreError>() {
            return qualified("StoreError", &format!("{e:?}"));
        }
        if let Some(e) = e.downcast_ref::<CommandIdError>() {
            return qualified("CommandIdError", &format!("{e:?}"));
        }
        if let Some(e) = e.downcast_ref::<std::io::Error>() {
            return format!("io::Error::{:?}", e.kind());
        }
        if e.is::<serde_json::Error>() {
            return "serde_json::Error".to_string();
        }
        if e.is::<Failure>() {
            return "Failure".to_string();
        }
    }
    let root = chain(err).last().unwrap_or(err);
    debug_head(&format!("{root:?}")).map_or_else(|| "Error".to_string(), str::to_string)
}

fn qualified(family: &str, debug: &str) -> String {
    match debug_head(debug) {
        Some(variant) => format!("{family}::{variant}"),
        None => family.to_string(),
    }
}

/// Leading identifier of a `Debug` rendering, e.g. `NotFound` in `NotFound { .. }`.
fn debug_head(debug: &str) -> Option<&str> {
    let end = debug
        .find(|c: char| !(c.is_alphanumeric() || c == '_'))
        .unwrap_or(debug.len());
    let head = &debug[..end];
    head.starts_with(char::is_alphabetic).then_some(head)
}

/// `{ "message": ..., "innerException": {...} }` for `err` and everything below it.
fn inner_exception(err: &(dyn StdError + 'static)) -> Value {
    let mut node = serde_json::Map::new();
    node.insert("message".into(), Value::String(err.to_string()));
    if let Some(source) = err.source() {
        node.insert(detail_keys::INNER_EXCEPTION.into(), inner_exception(source));
    }
    Value::Object(node)
}

/// Outcome of one operation: a value on success, a classified failure otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T = ()> {
    Success(T),
    Failure(Failure),
}

impl<T> Outcome<T> {
    #[must_use]
    pub fn succeed(value: T) -> Self {
        Outcome::Success(value)
    }

    #[must_use]
    pub fn fail(status_code: StatusCode) -> Self {
        Outcome::Failure(Failure::new(status_code))
    }

    #[must_use]
    pub fn fail_with(failure: Failure) -> Self {
        Outcome::Failure(failure)
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }

    #[must_use]
    pub fn is_failure(&self) -> bool {
        !self.is_success()
    }

    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Success(value) => Some(value),
            Outcome::Failure(_) => None,
        }
    }

    #[must_use]
    pub fn failure(&self) -> Option<&Failure> {
        match self {
            Outcome::Success(_) => None,
            Outcome::Failure(failure) => Some(failure),
        }
    }

    #[must_use]
    pub fn status_code(&self) -> Option<StatusCode> {
        self.failure().map(Failure::status_code)
    }

    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.failure().and_then(Failure::error_message)
    }

    #[must_use]
    pub fn error_details(&self) -> Option<&ErrorDetails> {
        self.failure().and_then(Failure::error_details)
    }

    /// Convert into a standard `Result`.
    ///
    /// # Errors
    ///
    /// Returns the [`Failure`] when the outcome is not a success.
    pub fn into_result(self) -> Result<T, Failure> {
        match self {
            Outcome::Success(value) => Ok(value),
            Outcome::Failure(failure) => Err(failure),
        }
    }

    #[must_use]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Outcome::Success(value) => Outcome::Success(f(value)),
            Outcome::Failure(failure) => Outcome::Failure(failure),
        }
    }
}

impl Outcome<()> {
    /// Payload-less success.
    #[must_use]
    pub fn succeeded() -> Self {
        Outcome::Success(())
    }
}

impl<T: Serialize> Outcome<T> {
    /// Erase the payload type.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be represented as JSON.
    pub fn into_json(self) -> Result<Outcome<Value>, serde_json::Error> {
        match self {
            Outcome::Success(value) => Ok(Outcome::Success(serde_json::to_value(value)?)),
            Outcome::Failure(failure) => Ok(Outcome::Failure(failure)),
        }
    }
}

impl Outcome<Value> {
    /// Recover a typed outcome from a JSON-payload outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if a success value does not deserialize into `T`.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<Outcome<T>, serde_json::Error> {
        match self {
            Outcome::Success(value) => Ok(Outcome::Success(serde_json::from_value(value)?)),
            Outcome::Failure(failure) => Ok(Outcome::Failure(failure)),
        }
    }
}

impl<T> From<Failure> for Outcome<T> {
    fn from(failure: Failure) -> Self {
        Outcome::Failure(failure)
    }
}

impl<T: Serialize> Serialize for Outcome<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Outcome::Success(value) => {
                let mut state = serializer.serialize_struct("Outcome", 2)?;
                state.serialize_field("isSuccess", &true)?;
                state.serialize_field("value", value)?;
                state.end()
            }
            Outcome::Failure(failure) => {
                let len = 2
                    + usize::from(failure.error_message.is_some())
                    + usize::from(failure.error_details.is_some());
                let mut state = serializer.serialize_struct("Outcome", len)?;
                state.serialize_field("isSuccess", &false)?;
                state.serialize_field("statusCode", &failure.status_code)?;
                if let Some(message) = &failure.error_message {
                    state.serialize_field("errorMessage", message)?;
                }
                if let Some(details) = &failure.error_details {
                    state.serialize_field("errorDetails", details)?;
                }
                state.end()
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OutcomeRepr<T> {
    is_success: bool,
    value: Option<T>,
    status_code: Option<StatusCode>,
    error_message: Option<String>,
    error_details: Option<ErrorDetails>,
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Outcome<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = OutcomeRepr::<T>::deserialize(deserializer)?;
        match (repr.is_success, repr.status_code) {
            (true, None) => {
                if repr.error_message.is_some() || repr.error_details.is_some() {
                    return Err(de::Error::custom(
                        "a successful outcome must not carry error fields",
                    ));
                }
                // Unit-like payloads serialize as null, which reads back as `None`.
                let value = match repr.value {
                    Some(value) => value,
                    None => T::deserialize(().into_deserializer()).map_err(|_: de::value::Error| {
                        de::Error::missing_field("value")
                    })?,
                };
                Ok(Outcome::Success(value))
            }
            (false, Some(status_code)) => {
                if repr.value.is_some() {
                    return Err(de::Error::custom("a failed outcome must not carry a value"));
                }
                Ok(Outcome::Failure(Failure {
                    status_code,
                    error_message: repr.error_message,
                    error_details: repr.error_details,
                }))
            }
            (true, Some(_)) => Err(de::Error::custom(
                "a successful outcome must not carry a status code",
            )),
            (false, None) => Err(de::Error::missing_field("statusCode")),
        }
    }
}
