//! Outcome Core: the outcome/command model, failure taxonomy, layered
//! classifier and the idempotency store contract.

pub mod classify;
pub mod command;
pub mod error;
pub mod outcome;
pub mod status;
pub mod store;

pub use classify::{Classification, Classifier, ClassifierLayer, ClassifyRule};
pub use command::{Command, CommandExecutionStatus, CommandId};
pub use error::{CommandError, CommandIdError, StoreError, TransportError, ValidationErrors};
pub use outcome::{detail_keys, error_type_name, DetailOptions, ErrorDetails, Failure, Outcome};
pub use status::{FailureKind, StatusCode, UnknownStatusCode};
pub use store::{IdempotencyStore, IdempotencyStoreExt};
