//! Periodic eviction of finished commands past their retention and of
//! commands abandoned while `InProgress`.

use std::sync::Arc;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ExpiringStore, ExpiryPolicy};
use crate::service::worker::BackgroundRunnable;

/// On-demand work for the sweeper besides its periodic tick.
#[derive(Debug)]
pub enum SweepTask {
    /// Sweep now instead of waiting for the next tick.
    RunNow,
}

/// [`BackgroundRunnable`] that removes expired commands on every tick.
pub struct ExpirySweeper {
    store: Arc<dyn ExpiringStore>,
    policy: ExpiryPolicy,
    cancel: CancellationToken,
}

impl ExpirySweeper {
    #[must_use]
    pub fn new(store: Arc<dyn ExpiringStore>, policy: ExpiryPolicy) -> Self {
        Self {
            store,
            policy,
            cancel: CancellationToken::new(),
        }
    }

    /// Remove every expired command. Returns how many were evicted.
    pub async fn sweep(&self) -> usize {
        let expired = match self.store.expired(self.policy).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(error = %err, "expiry sweep could not list commands");
                return 0;
            }
        };

        let mut removed = 0;
        for id in expired {
            match self.store.remove_command(&id, &self.cancel).await {
                Ok(()) => removed += 1,
                Err(err) => warn!(command_id = id.as_str(), error = %err, "failed to evict command"),
            }
        }
        if removed > 0 {
            info!(removed, "evicted expired commands");
        } else {
            debug!("expiry sweep found nothing to evict");
        }
        removed
    }
}

#[async_trait]
impl BackgroundRunnable for ExpirySweeper {
    type Task = SweepTask;

    async fn run(&mut self, task: SweepTask) {
        match task {
            SweepTask::RunNow => {
                self.sweep().await;
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep().await;
    }

    async fn shutdown(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use outcome_core::{CommandExecutionStatus, CommandId, IdempotencyStore};
    use serde_json::json;

    use super::*;
    use crate::service::worker::BackgroundWorker;
    use crate::storage::InMemoryIdempotencyStore;

    async fn finished(store: &InMemoryIdempotencyStore, raw: &str) {
        let id = CommandId::parse(raw).unwrap();
        let cancel = CancellationToken::new();
        store
            .set_command_status(&id, CommandExecutionStatus::InProgress, &cancel)
            .await
            .unwrap();
        store
            .record_outcome(&id, CommandExecutionStatus::Completed, json!(1), &cancel)
            .await
            .unwrap();
    }

    fn policy(in_progress_ttl: Duration) -> ExpiryPolicy {
        ExpiryPolicy {
            retention: Duration::ZERO,
            in_progress_ttl,
        }
    }

    #[tokio::test]
    async fn sweep_keeps_running_commands_younger_than_the_ttl() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        finished(&store, "a").await;
        finished(&store, "b").await;
        store
            .set_command_status(
                &CommandId::parse("running").unwrap(),
                CommandExecutionStatus::InProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(store.clone(), policy(Duration::from_secs(3600)));
        assert_eq!(sweeper.sweep().await, 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_evicts_abandoned_commands() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        store
            .set_command_status(
                &CommandId::parse("abandoned").unwrap(),
                CommandExecutionStatus::InProgress,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let sweeper = ExpirySweeper::new(store.clone(), policy(Duration::from_secs(600)));
        assert_eq!(sweeper.sweep().await, 0);
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(sweeper.sweep().await, 1);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn worker_runs_sweeps_on_demand() {
        let store = Arc::new(InMemoryIdempotencyStore::new());
        finished(&store, "a").await;

        let sweeper = ExpirySweeper::new(store.clone(), policy(Duration::from_secs(3600)));
        let mut worker = BackgroundWorker::start(sweeper, Duration::from_secs(3600));
        worker.submit(SweepTask::RunNow).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.stop().await;

        assert!(store.is_empty());
    }
}
