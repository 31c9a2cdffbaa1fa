//! In-memory [`IdempotencyStore`] backed by [`DashMap`].
//!
//! Each command is one map entry; status and result change together under
//! the entry's shard lock, which is what makes `try_transition` atomic.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use outcome_core::store::{check_transition, ensure_not_cancelled};
use outcome_core::{CommandExecutionStatus, CommandId, IdempotencyStore, StoreError};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{ExpiringStore, ExpiryPolicy};

#[derive(Debug, Clone)]
struct CommandEntry {
    status: CommandExecutionStatus,
    result: Option<Value>,
    updated_at: Instant,
}

impl CommandEntry {
    fn new(status: CommandExecutionStatus) -> Self {
        Self {
            status,
            result: None,
            updated_at: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.updated_at = Instant::now();
    }
}

/// Process-local idempotency store. State is lost on restart.
pub struct InMemoryIdempotencyStore {
    entries: DashMap<CommandId, CommandEntry>,
}

impl InMemoryIdempotencyStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Number of tracked commands.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Commands `policy` says may be evicted, judged by their last write.
    #[must_use]
    pub fn expired_ids(&self, policy: ExpiryPolicy) -> Vec<CommandId> {
        self.entries
            .iter()
            .filter(|entry| policy.is_expired(entry.status, entry.updated_at.elapsed()))
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn command_status(
        &self,
        id: &CommandId,
        cancel: &CancellationToken,
    ) -> Result<CommandExecutionStatus, StoreError> {
        ensure_not_cancelled(cancel)?;
        Ok(self
            .entries
            .get(id)
            .map_or(CommandExecutionStatus::NotStarted, |entry| entry.status))
    }

    async fn set_command_status(
        &self,
        id: &CommandId,
        status: CommandExecutionStatus,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_not_cancelled(cancel)?;
        match self.entries.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                check_transition(id, entry.status, status)?;
                entry.status = status;
                entry.touch();
            }
            Entry::Vacant(vacant) => {
                check_transition(id, CommandExecutionStatus::NotStarted, status)?;
                vacant.insert(CommandEntry::new(status));
            }
        }
        Ok(())
    }

    async fn command_result_raw(
        &self,
        id: &CommandId,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, StoreError> {
        ensure_not_cancelled(cancel)?;
        Ok(self.entries.get(id).and_then(|entry| entry.result.clone()))
    }

    async fn set_command_result_raw(
        &self,
        id: &CommandId,
        result: Value,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_not_cancelled(cancel)?;
        let mut entry = self
            .entries
            .entry(id.clone())
            .or_insert_with(|| CommandEntry::new(CommandExecutionStatus::NotStarted));
        if entry.status.is_terminal() {
            return Err(StoreError::TerminalState { id: id.clone() });
        }
        entry.result = Some(result);
        entry.touch();
        Ok(())
    }

    async fn remove_command(
        &self,
        id: &CommandId,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_not_cancelled(cancel)?;
        self.entries.remove(id);
        Ok(())
    }

    async fn try_transition(
        &self,
        id: &CommandId,
        from: CommandExecutionStatus,
        to: CommandExecutionStatus,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        ensure_not_cancelled(cancel)?;
        check_transition(id, from, to)?;
        match self.entries.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                if entry.status != from {
                    return Ok(false);
                }
                entry.status = to;
                entry.touch();
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if from != CommandExecutionStatus::NotStarted {
                    return Ok(false);
                }
                vacant.insert(CommandEntry::new(to));
                Ok(true)
            }
        }
    }

    /// Result and status change under one entry lock.
    async fn record_outcome(
        &self,
        id: &CommandId,
        status: CommandExecutionStatus,
        result: Value,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_not_cancelled(cancel)?;
        match self.entries.entry(id.clone()) {
            Entry::Occupied(mut occupied) => {
                let entry = occupied.get_mut();
                check_transition(id, entry.status, status)?;
                entry.result = Some(result);
                entry.status = status;
                entry.touch();
                Ok(())
            }
            Entry::Vacant(_) => check_transition(id, CommandExecutionStatus::NotStarted, status),
        }
    }
}

#[async_trait]
impl ExpiringStore for InMemoryIdempotencyStore {
    async fn expired(&self, policy: ExpiryPolicy) -> Result<Vec<CommandId>, StoreError> {
        Ok(self.expired_ids(policy))
    }

    async fn command_count(&self) -> Result<usize, StoreError> {
        Ok(self.len())
    }
}
