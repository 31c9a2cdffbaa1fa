//! Idempotency store implementations and their upkeep.
//!
//! - [`memory`]: `DashMap`-backed store for single-process deployments and tests
//! - [`redb`]: durable store on an embedded redb file (feature `redb`)
//! - [`sweeper`]: background eviction of finished and abandoned commands
//! - [`factory`]: backend selection

use std::time::Duration;

use async_trait::async_trait;
use outcome_core::{CommandExecutionStatus, CommandId, IdempotencyStore, StoreError};

pub mod factory;
pub mod memory;
#[cfg(feature = "redb")]
pub mod redb;
pub mod sweeper;

pub use factory::{open_store, StoreBackend, StoreHandle};
pub use memory::InMemoryIdempotencyStore;
#[cfg(feature = "redb")]
pub use redb::RedbIdempotencyStore;
pub use sweeper::{ExpirySweeper, SweepTask};

/// When a stored command may be evicted.
///
/// A cancelled call leaves its command `InProgress` and nothing rolls it
/// back, so such entries only leave the store through `in_progress_ttl`.
/// Keep it well above the invocation timeout or a slow handler's command
/// can be evicted while it still runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    /// Age at which a terminal command is evicted.
    pub retention: Duration,
    /// Age at which a command still `InProgress` counts as abandoned.
    pub in_progress_ttl: Duration,
}

impl ExpiryPolicy {
    /// Whether a command in `status`, last written `age` ago, is evictable.
    #[must_use]
    pub fn is_expired(&self, status: CommandExecutionStatus, age: Duration) -> bool {
        match status {
            CommandExecutionStatus::InProgress => age >= self.in_progress_ttl,
            CommandExecutionStatus::NotStarted => false,
            CommandExecutionStatus::Completed | CommandExecutionStatus::Failed => {
                age >= self.retention
            }
        }
    }
}

/// Store housekeeping beyond the idempotency contract.
#[async_trait]
pub trait ExpiringStore: IdempotencyStore {
    /// Commands `policy` says may be evicted.
    async fn expired(&self, policy: ExpiryPolicy) -> Result<Vec<CommandId>, StoreError>;

    /// Number of tracked commands.
    async fn command_count(&self) -> Result<usize, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use CommandExecutionStatus::{Completed, Failed, InProgress, NotStarted};

    #[test]
    fn in_progress_commands_expire_on_their_own_clock() {
        let policy = ExpiryPolicy {
            retention: Duration::from_secs(60),
            in_progress_ttl: Duration::from_secs(600),
        };
        assert!(policy.is_expired(Completed, Duration::from_secs(60)));
        assert!(policy.is_expired(Failed, Duration::from_secs(61)));
        assert!(!policy.is_expired(InProgress, Duration::from_secs(61)));
        assert!(policy.is_expired(InProgress, Duration::from_secs(600)));
        assert!(!policy.is_expired(NotStarted, Duration::MAX));
    }
}
