//! Durable [`IdempotencyStore`] on an embedded redb database.
//!
//! One table maps command id to a MsgPack-encoded [`StoredEntry`]. Every
//! operation is a single redb transaction executed on the blocking pool;
//! redb serializes write transactions, so a read-check-write inside one of
//! them is a compare-and-set.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use outcome_core::store::{check_transition, ensure_not_cancelled};
use outcome_core::{CommandExecutionStatus, CommandId, IdempotencyStore, StoreError};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::{ExpiringStore, ExpiryPolicy};

const COMMANDS: TableDefinition<&str, &[u8]> = TableDefinition::new("commands");

/// On-disk record for one command.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    status: CommandExecutionStatus,
    result: Option<Value>,
    updated_at_ms: u64,
}

impl StoredEntry {
    fn new(status: CommandExecutionStatus) -> Self {
        Self {
            status,
            result: None,
            updated_at_ms: now_ms(),
        }
    }

    fn touch(&mut self) {
        self.updated_at_ms = now_ms();
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        rmp_serde::to_vec_named(self).map_err(StoreError::backend)
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        rmp_serde::from_slice(bytes).map_err(StoreError::backend)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

fn redb_err(err: impl Into<redb::Error>) -> StoreError {
    StoreError::backend(err.into())
}

/// Idempotency store persisted in a redb file.
#[derive(Clone)]
pub struct RedbIdempotencyStore {
    db: Arc<Database>,
}

impl RedbIdempotencyStore {
    /// Open (or create) the database at `path` and make sure the table exists.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` if the file cannot be opened or the
    /// table cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path.as_ref()).map_err(redb_err)?;
        let txn = db.begin_write().map_err(redb_err)?;
        txn.open_table(COMMANDS).map_err(redb_err)?;
        txn.commit().map_err(redb_err)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Run `op` against the database on the blocking pool.
    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, StoreError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || op(&db))
            .await
            .map_err(StoreError::backend)?
    }

    async fn read_entry(&self, id: &CommandId) -> Result<Option<StoredEntry>, StoreError> {
        let key = id.as_str().to_owned();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(redb_err)?;
            let table = txn.open_table(COMMANDS).map_err(redb_err)?;
            let stored = table.get(key.as_str()).map_err(redb_err)?;
            stored.map(|guard| StoredEntry::decode(guard.value())).transpose()
        })
        .await
    }

    /// Read-modify-write of one entry inside a single write transaction.
    ///
    /// `update` sees the current entry (if any) and returns the entry to
    /// store, or `None` to leave the table untouched.
    async fn update_entry<T, F>(&self, id: &CommandId, update: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(Option<StoredEntry>) -> Result<(Option<StoredEntry>, T), StoreError>
            + Send
            + 'static,
    {
        let key = id.as_str().to_owned();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(redb_err)?;
            let answer = write_entry(&txn, &key, update)?;
            txn.commit().map_err(redb_err)?;
            Ok(answer)
        })
        .await
    }
}

fn write_entry<T, F>(txn: &WriteTransaction, key: &str, update: F) -> Result<T, StoreError>
where
    F: FnOnce(Option<StoredEntry>) -> Result<(Option<StoredEntry>, T), StoreError>,
{
    let mut table = txn.open_table(COMMANDS).map_err(redb_err)?;
    let current = table
        .get(key)
        .map_err(redb_err)?
        .map(|guard| StoredEntry::decode(guard.value()))
        .transpose()?;
    let (next, answer) = update(current)?;
    if let Some(entry) = next {
        let bytes = entry.encode()?;
        table.insert(key, bytes.as_slice()).map_err(redb_err)?;
    }
    Ok(answer)
}

#[async_trait]
impl IdempotencyStore for RedbIdempotencyStore {
    async fn command_status(
        &self,
        id: &CommandId,
        cancel: &CancellationToken,
    ) -> Result<CommandExecutionStatus, StoreError> {
        ensure_not_cancelled(cancel)?;
        Ok(self
            .read_entry(id)
            .await?
            .map_or(CommandExecutionStatus::NotStarted, |entry| entry.status))
    }

    async fn set_command_status(
        &self,
        id: &CommandId,
        status: CommandExecutionStatus,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_not_cancelled(cancel)?;
        let owned = id.clone();
        self.update_entry(id, move |current| {
            let mut entry =
                current.unwrap_or_else(|| StoredEntry::new(CommandExecutionStatus::NotStarted));
            check_transition(&owned, entry.status, status)?;
            entry.status = status;
            entry.touch();
            Ok((Some(entry), ()))
        })
        .await
    }

    async fn command_result_raw(
        &self,
        id: &CommandId,
        cancel: &CancellationToken,
    ) -> Result<Option<Value>, StoreError> {
        ensure_not_cancelled(cancel)?;
        Ok(self.read_entry(id).await?.and_then(|entry| entry.result))
    }

    async fn set_command_result_raw(
        &self,
        id: &CommandId,
        result: Value,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_not_cancelled(cancel)?;
        let owned = id.clone();
        self.update_entry(id, move |current| {
            let mut entry =
                current.unwrap_or_else(|| StoredEntry::new(CommandExecutionStatus::NotStarted));
            if entry.status.is_terminal() {
                return Err(StoreError::TerminalState { id: owned });
            }
            entry.result = Some(result);
            entry.touch();
            Ok((Some(entry), ()))
        })
        .await
    }

    async fn remove_command(
        &self,
        id: &CommandId,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_not_cancelled(cancel)?;
        let key = id.as_str().to_owned();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(redb_err)?;
            {
                let mut table = txn.open_table(COMMANDS).map_err(redb_err)?;
                table.remove(key.as_str()).map_err(redb_err)?;
            }
            txn.commit().map_err(redb_err)
        })
        .await
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
        self.update_entry(id, move |current| {
            let status = current
                .as_ref()
                .map_or(CommandExecutionStatus::NotStarted, |entry| entry.status);
            if status != from {
                return Ok((None, false));
            }
            let mut entry = current.unwrap_or_else(|| StoredEntry::new(from));
            entry.status = to;
            entry.touch();
            Ok((Some(entry), true))
        })
        .await
    }

    /// Result and status go in one transaction, so no reader ever sees a
    /// terminal status without its result.
    async fn record_outcome(
        &self,
        id: &CommandId,
        status: CommandExecutionStatus,
        result: Value,
        cancel: &CancellationToken,
    ) -> Result<(), StoreError> {
        ensure_not_cancelled(cancel)?;
        let owned = id.clone();
        self.update_entry(id, move |current| {
            let mut entry =
                current.unwrap_or_else(|| StoredEntry::new(CommandExecutionStatus::NotStarted));
            check_transition(&owned, entry.status, status)?;
            entry.result = Some(result);
            entry.status = status;
            entry.touch();
            Ok((Some(entry), ()))
        })
        .await
    }
}

#[async_trait]
impl ExpiringStore for RedbIdempotencyStore {
    async fn expired(&self, policy: ExpiryPolicy) -> Result<Vec<CommandId>, StoreError> {
        let now = now_ms();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(redb_err)?;
            let table = txn.open_table(COMMANDS).map_err(redb_err)?;
            let mut expired = Vec::new();
            for row in table.iter().map_err(redb_err)? {
                let (key, value) = row.map_err(redb_err)?;
                let entry = StoredEntry::decode(value.value())?;
                let age = Duration::from_millis(now.saturating_sub(entry.updated_at_ms));
                if policy.is_expired(entry.status, age) {
                    match CommandId::parse(key.value()) {
                        Ok(id) => expired.push(id),
                        Err(err) => {
                            tracing::warn!(key = key.value(), error = %err, "skipping invalid command key");
                        }
                    }
                }
            }
            Ok(expired)
        })
        .await
    }

    async fn command_count(&self) -> Result<usize, StoreError> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(redb_err)?;
            let table = txn.open_table(COMMANDS).map_err(redb_err)?;
            let len = table.len().map_err(redb_err)?;
            Ok(usize::try_from(len).unwrap_or(usize::MAX))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use outcome_core::IdempotencyStoreExt;
    use serde_json::json;

    use super::*;
    use CommandExecutionStatus::{Completed, InProgress, NotStarted};

    fn id(raw: &str) -> CommandId {
        CommandId::parse(raw).unwrap()
    }

    fn open(dir: &tempfile::TempDir) -> RedbIdempotencyStore {
        RedbIdempotencyStore::open(dir.path().join("commands.redb")).unwrap()
    }

    #[tokio::test]
    async fn outcomes_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let cmd = id("cmd-1");
        {
            let store = open(&dir);
            assert!(store.try_transition(&cmd, NotStarted, InProgress, &cancel).await.unwrap());
            store
                .record_outcome(&cmd, Completed, json!({"isSuccess": true, "value": 42}), &cancel)
                .await
                .unwrap();
        }

        let store = open(&dir);
        assert_eq!(store.command_status(&cmd, &cancel).await.unwrap(), Completed);
        let cached: Option<Value> = store.command_result(&cmd, &cancel).await.unwrap();
        assert_eq!(cached, Some(json!({"isSuccess": true, "value": 42})));
        assert_eq!(store.command_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let cancel = CancellationToken::new();
        let cmd = id("cas");
        assert!(store.try_transition(&cmd, NotStarted, InProgress, &cancel).await.unwrap());
        assert!(!store.try_transition(&cmd, NotStarted, InProgress, &cancel).await.unwrap());
    }

    #[tokio::test]
    async fn terminal_entries_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let cancel = CancellationToken::new();
        let cmd = id("done");
        store.set_command_status(&cmd, InProgress, &cancel).await.unwrap();
        store.set_command_status(&cmd, Completed, &cancel).await.unwrap();
        assert!(matches!(
            store.set_command_result_raw(&cmd, json!(1), &cancel).await,
            Err(StoreError::TerminalState { .. })
        ));
        assert!(matches!(
            store.record_outcome(&cmd, Completed, json!(1), &cancel).await,
            Err(StoreError::TerminalState { .. })
        ));
    }

    #[tokio::test]
    async fn expiry_follows_policy_and_remove_evicts() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir);
        let cancel = CancellationToken::new();
        let done = id("done");
        let running = id("running");
        store.set_command_status(&done, InProgress, &cancel).await.unwrap();
        store.record_outcome(&done, Completed, json!(null), &cancel).await.unwrap();
        store.set_command_status(&running, InProgress, &cancel).await.unwrap();

        let hour = Duration::from_secs(3600);
        let keep_all = ExpiryPolicy {
            retention: hour,
            in_progress_ttl: hour,
        };
        assert!(store.expired(keep_all).await.unwrap().is_empty());
        let finished_only = ExpiryPolicy {
            retention: Duration::ZERO,
            in_progress_ttl: hour,
        };
        assert_eq!(store.expired(finished_only).await.unwrap(), vec![done.clone()]);
        let everything = ExpiryPolicy {
            retention: Duration::ZERO,
            in_progress_ttl: Duration::ZERO,
        };
        assert_eq!(
            store.expired(everything).await.unwrap(),
            vec![done.clone(), running.clone()]
        );

        store.remove_command(&done, &cancel).await.unwrap();
        assert_eq!(store.command_status(&done, &cancel).await.unwrap(), NotStarted);
        assert_eq!(store.command_count().await.unwrap(), 1);
    }
}
