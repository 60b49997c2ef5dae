// Janitor: periodic reclamation and retention sweeps
//
// Any worker can run the janitor; every pass is idempotent, so multiple
// workers sweeping concurrently is safe, just redundant.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use taskhive_core::{CoordinationConfig, Result};
use taskhive_storage::CoordinationStore;

/// Summary of one janitor pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct JanitorSummary {
    pub instances_cleaned: u64,
    pub instances_pruned: u64,
    pub events_deleted: u64,
    pub interrupted: bool,
}

pub struct Janitor {
    store: Arc<dyn CoordinationStore>,
    config: CoordinationConfig,
}

impl Janitor {
    pub fn new(store: Arc<dyn CoordinationStore>, config: CoordinationConfig) -> Self {
        Janitor { store, config }
    }

    /// One full sweep: stale instances, stopped-instance retention,
    /// agent-event retention. Cancellation is honored between (and
    /// inside) the passes; partial counts are still reported.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<JanitorSummary> {
        let mut summary = JanitorSummary::default();

        let cleanup = self
            .store
            .cleanup_stale_instances(self.config.stale_threshold_secs, cancel)
            .await?;
        summary.instances_cleaned = cleanup.cleaned;
        summary.interrupted |= cleanup.interrupted;
        if cancel.is_cancelled() {
            summary.interrupted = true;
            return Ok(summary);
        }

        summary.instances_pruned = self
            .store
            .delete_old_stopped_instances(
                self.config.stopped_retention.older_than_secs,
                self.config.stopped_retention.max_to_keep,
            )
            .await?;
        if cancel.is_cancelled() {
            summary.interrupted = true;
            return Ok(summary);
        }

        let retention = self
            .store
            .cleanup_agent_events(&self.config.event_retention, cancel)
            .await?;
        summary.events_deleted = retention.deleted;
        summary.interrupted |= retention.interrupted;

        if summary.instances_cleaned > 0 || summary.instances_pruned > 0 {
            info!(
                cleaned = summary.instances_cleaned,
                pruned = summary.instances_pruned,
                events = summary.events_deleted,
                "janitor pass complete"
            );
        } else {
            debug!(events = summary.events_deleted, "janitor pass complete");
        }
        Ok(summary)
    }

    /// Sweep on an interval until shutdown. Errors are logged, never
    /// fatal: the next tick retries.
    pub async fn run(
        &self,
        interval: Duration,
        cancel: CancellationToken,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!("janitor shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once(&cancel).await {
                        warn!(error = %e, "janitor pass failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use taskhive_core::{ExecutorInstance, Issue, IssueStatus, IssueType};
    use taskhive_storage::MemoryStore;

    fn chore(id: &str) -> Issue {
        Issue::new(id, "sweep me", IssueType::Chore)
    }

    #[tokio::test]
    async fn sweep_reclaims_stale_claims() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let mut stale = ExecutorInstance::new("exec-stale", "host", 42, "0.2.0");
        stale.last_heartbeat = Utc::now() - chrono::Duration::minutes(30);
        store.register_instance(&stale).await.unwrap();
        store.create_issue(&chore("th-1"), "tester").await.unwrap();
        store.claim_issue("th-1", "exec-stale").await.unwrap();

        let janitor = Janitor::new(store.clone(), CoordinationConfig::default());
        let summary = janitor.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(summary.instances_cleaned, 1);
        assert!(!summary.interrupted);
        assert_eq!(
            store.get_issue("th-1").await.unwrap().status,
            IssueStatus::Open
        );
    }

    #[tokio::test]
    async fn cancelled_sweep_reports_interruption() {
        let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
        let janitor = Janitor::new(store, CoordinationConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let summary = janitor.run_once(&cancel).await.unwrap();
        assert!(summary.interrupted);
    }
}
