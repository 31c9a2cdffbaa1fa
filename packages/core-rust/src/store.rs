//! Idempotency store contract.
//!
//! The store owns the status/result pair recorded for each tracked command.
//! Implementations live in the server crate; this module only fixes the
//! operations and their guarantees.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::command::{CommandExecutionStatus, CommandId};
use crate::error::StoreError;

/// Async key-value store of command status and cached results.
///
/// Every operation takes a cancellation token. A token that is already
/// cancelled yields [`StoreError::Cancelled`] without touching stored state.
/// Implementations reject transitions that [`CommandExecutionStatus::can_transition_to`]
/// forbids and never modify a command once it is terminal.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Current status; [`CommandExecutionStatus::NotStarted`] for unknown ids.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on cancellation or backend failure.
    async fn command_status(
        &self,
        id: &CommandId,
        cancel: &CancellationToken,
    ) -> Result<CommandExecutionStatus, StoreError>;

    /// Record a status transition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IllegalTransition`] for transitions the state
    /// machine forbids and [`StoreError::TerminalState`] when the command is
    /// already terminal.
    async fn set_command_status(
        &self,
        id: &CommandId,
        status: CommandExecutionStatus,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Cached result, or `None` when nothing is cached or the id is unknown.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on cancellation or backend failure.
    async fn command_result_raw(
        &self,
        id: &CommandId,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, StoreError>;

    /// Cache the result for a command.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TerminalState`] when the command is already terminal.
    async fn set_command_result_raw(
        &self,
        id: &CommandId,
        result: Value,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Evict all state for `id`. Removing an unknown id is not an error.
    ///
    /// # Errors
    ///
    /// Returns `StoreError` on cancellation or backend failure.
    async fn remove_command(
        &self,
        id: &CommandId,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError>;

    /// Atomically move `id` from `from` to `to`.
    ///
    /// Returns `Ok(false)` without writing when the current status is not
    /// `from`. Of any number of concurrent callers racing the same transition,
    /// exactly one observes `Ok(true)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IllegalTransition`] when `from -> to` is not a
    /// legal transition.
    async fn try_transition(
        &self,
        id: &CommandId,
        from: CommandExecutionStatus,
        to: CommandExecutionStatus,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError>;

    /// Persist a terminal outcome: the result first, then the status, so a
    /// terminal status is never observable without its result.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`Self::set_command_result_raw`] and
    /// [`Self::set_command_status`].
    async fn record_outcome(
        &self,
        id: &CommandId,
        status: CommandExecutionStatus,
        result: Value,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        self.set_command_result_raw(id, result, cancel).await?;
        self.set_command_status(id, status, cancel).await
    }
}

/// Typed helpers over [`IdempotencyStore`].
#[async_trait]
pub trait IdempotencyStoreExt: IdempotencyStore {
    /// Cached result decoded as `T`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the cached value is not a `T`.
    async fn command_result<T: DeserializeOwned + Send>(
        &self,
        id: &CommandId,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, StoreError> {
        match self.command_result_raw(id, cancel).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Encode `result` and cache it.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if `result` cannot be encoded.
    async fn set_command_result<T: Serialize + Sync>(
        &self,
        id: &CommandId,
        result: &T,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(result)?;
        self.set_command_result_raw(id, value, cancel).await
    }
}

impl<S: IdempotencyStore + ?Sized> IdempotencyStoreExt for S {}

/// Fail fast when `cancel` has fired. Shared by store implementations.
///
/// # Errors
///
/// Returns [`StoreError::Cancelled`] if the token is cancelled.
pub fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<(), StoreError> {
    if cancel.is_cancelled() {
        Err(StoreError::Cancelled)
    } else {
        Ok(())
    }
}

/// Validate `from -> to` against the state machine.
///
/// # Errors
///
/// Returns [`StoreError::TerminalState`] when `from` is terminal and
/// [`StoreError::IllegalTransition`] for any other forbidden move.
pub fn check_transition(
    id: &CommandId,
    from: CommandExecutionStatus,
    to: CommandExecutionStatus,
) -> Result<(), StoreError> {
    if from.can_transition_to(to) {
        Ok(())
    } else if from.is_terminal() {
        Err(StoreError::TerminalState { id: id.clone() })
    } else {
        Err(StoreError::IllegalTransition {
            id: id.clone(),
            from,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandExecutionStatus::{Completed, Failed, InProgress, NotStarted};

    fn id() -> CommandId {
        CommandId::parse("cmd-1").unwrap()
    }

    #[test]
    fn check_transition_distinguishes_terminal_from_illegal() {
        assert!(check_transition(&id(), NotStarted, InProgress).is_ok());
        assert!(check_transition(&id(), InProgress, Failed).is_ok());
        assert!(matches!(
            check_transition(&id(), Completed, Failed),
            Err(StoreError::TerminalState { .. })
        ));
        assert!(matches!(
            check_transition(&id(), NotStarted, Completed),
            Err(StoreError::IllegalTransition { .. })
        ));
    }

    #[test]
    fn cancelled_token_fails_fast() {
        let cancel = CancellationToken::new();
        assert!(ensure_not_cancelled(&cancel).is_ok());
        cancel.cancel();
        assert!(matches!(
            ensure_not_cancelled(&cancel),
            Err(StoreError::Cancelled)
        ));
    }
}
