//! Ready-work polling with exponential backoff
//!
//! Polls `get_ready_work` with an interval that backs off while the queue
//! is empty and snaps back to the minimum as soon as work appears.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, trace};

use taskhive_core::{Issue, Result};
use taskhive_storage::{CoordinationStore, ReadyFilter};

/// Backoff parameters for the poll loop.
#[derive(Debug, Clone)]
pub struct PollBackoff {
    pub min_interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
}

impl Default for PollBackoff {
    fn default() -> Self {
        PollBackoff {
            min_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(10),
            multiplier: 1.5,
        }
    }
}

/// Poller over the ready queue with adaptive backoff.
pub struct WorkPoller {
    store: Arc<dyn CoordinationStore>,
    filter: ReadyFilter,
    backoff: PollBackoff,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl WorkPoller {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        filter: ReadyFilter,
        backoff: PollBackoff,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let current_interval = backoff.min_interval;
        WorkPoller {
            store,
            filter,
            backoff,
            current_interval,
            shutdown_rx,
        }
    }

    /// Fetch ready work and adjust the backoff state.
    pub async fn poll(&mut self) -> Result<Vec<Issue>> {
        if *self.shutdown_rx.borrow() {
            return Ok(vec![]);
        }
        let issues = self.store.get_ready_work(&self.filter).await?;
        if issues.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "no ready work, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = issues.len(), "found ready work");
        }
        Ok(issues)
    }

    /// Sleep for the current interval. Returns true when shutdown was
    /// signalled during the wait.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => true,
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.backoff.min_interval;
    }

    fn increase_backoff(&mut self) {
        let scaled = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.backoff.multiplier.max(1.0),
        );
        self.current_interval = scaled.min(self.backoff.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use taskhive_storage::MemoryStore;

    fn poller(backoff: PollBackoff) -> WorkPoller {
        let (_tx, rx) = watch::channel(false);
        WorkPoller::new(
            Arc::new(MemoryStore::new()),
            ReadyFilter::default(),
            backoff,
            rx,
        )
    }

    #[tokio::test]
    async fn backs_off_while_idle_and_caps() {
        let mut poller = poller(PollBackoff {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(400),
            multiplier: 2.0,
        });

        assert_eq!(poller.current_interval(), Duration::from_millis(100));
        poller.poll().await.unwrap();
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        poller.poll().await.unwrap();
        assert_eq!(poller.current_interval(), Duration::from_millis(400));
        poller.poll().await.unwrap();
        assert_eq!(poller.current_interval(), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn resets_on_work_found() {
        let store = Arc::new(MemoryStore::new());
        let (_tx, rx) = watch::channel(false);
        let mut poller = WorkPoller::new(
            store.clone(),
            ReadyFilter::default(),
            PollBackoff {
                min_interval: Duration::from_millis(100),
                max_interval: Duration::from_secs(5),
                multiplier: 2.0,
            },
            rx,
        );

        poller.poll().await.unwrap();
        poller.poll().await.unwrap();
        assert!(poller.current_interval() > Duration::from_millis(100));

        let mut issue =
            taskhive_core::Issue::new("th-1", "work", taskhive_core::IssueType::Chore);
        issue.acceptance_criteria = String::new();
        store
            .create_issue(&issue, "tester")
            .await
            .unwrap();
        let found = poller.poll().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn shutdown_short_circuits() {
        let store = Arc::new(MemoryStore::new());
        let (tx, rx) = watch::channel(false);
        let mut poller = WorkPoller::new(
            store,
            ReadyFilter::default(),
            PollBackoff::default(),
            rx,
        );
        tx.send(true).unwrap();
        assert!(poller.poll().await.unwrap().is_empty());
        assert!(poller.wait().await);
    }
}
