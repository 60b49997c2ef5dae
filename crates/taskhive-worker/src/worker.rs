// Worker: register, poll, claim, drive, release
//
// One Worker owns one executor identity. All coordination with peers goes
// through the store; losing a claim race is normal operation, not an
// error.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use taskhive_core::{CoordinationError, ExecutorStatus, Issue, Result};
use taskhive_storage::{CoordinationStore, ReadyFilter};

use crate::config::WorkerConfig;
use crate::identity::ExecutorIdentity;
use crate::janitor::Janitor;
use crate::phase::PhaseRunner;
use crate::pipeline::run_pipeline;
use crate::poller::{PollBackoff, WorkPoller};

/// A long-running worker process.
///
/// # Example
///
/// ```ignore
/// use taskhive_worker::{Worker, WorkerConfig};
///
/// let worker = Worker::new(store, runner, WorkerConfig::default());
/// worker.run().await?;
/// ```
pub struct Worker {
    store: Arc<dyn CoordinationStore>,
    runner: Arc<dyn PhaseRunner>,
    config: WorkerConfig,
    identity: ExecutorIdentity,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl Worker {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        runner: Arc<dyn PhaseRunner>,
        config: WorkerConfig,
    ) -> Self {
        let identity = ExecutorIdentity::generate(config.version.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Worker {
            store,
            runner,
            config,
            identity,
            shutdown_tx,
            shutdown_rx,
            cancel: CancellationToken::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.identity.instance_id
    }

    /// Signal the worker to stop after the in-flight issue finishes.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let _ = self.shutdown_tx.send(true);
    }

    /// Register, spawn the heartbeat and janitor loops, and process ready
    /// work until shutdown.
    #[instrument(skip(self), fields(instance_id = %self.identity.instance_id))]
    pub async fn run(&self) -> Result<()> {
        self.store
            .register_instance(&self.identity.to_instance())
            .await?;
        info!(
            hostname = %self.identity.hostname,
            pid = self.identity.pid,
            "worker registered"
        );

        let heartbeat_handle = spawn_heartbeat(
            self.store.clone(),
            self.identity.instance_id.clone(),
            self.config.heartbeat_interval,
            self.shutdown_rx.clone(),
        );
        let janitor = Janitor::new(self.store.clone(), self.config.coordination.clone());
        let janitor_cancel = self.cancel.clone();
        let janitor_shutdown = self.shutdown_rx.clone();
        let janitor_interval = self.config.janitor_interval;
        let janitor_handle = tokio::spawn(async move {
            janitor
                .run(janitor_interval, janitor_cancel, janitor_shutdown)
                .await;
        });

        let filter = ReadyFilter {
            limit: self.config.poll_batch,
            sort: Some(self.config.coordination.sort_policy),
            ..Default::default()
        };
        let mut poller = WorkPoller::new(
            self.store.clone(),
            filter,
            PollBackoff {
                min_interval: self.config.min_poll_interval,
                max_interval: self.config.max_poll_interval,
                multiplier: self.config.backoff_multiplier,
            },
            self.shutdown_rx.clone(),
        );

        loop {
            if *self.shutdown_rx.borrow() {
                break;
            }
            match poller.poll().await {
                Ok(candidates) => {
                    self.process_candidates(candidates).await;
                }
                Err(e) => {
                    warn!(error = %e, "poll failed, backing off");
                }
            }
            if poller.wait().await {
                break;
            }
        }

        info!("worker stopping");
        self.deregister().await;
        heartbeat_handle.abort();
        janitor_handle.abort();
        Ok(())
    }

    /// Try to claim and process one of the ready candidates. Claim races
    /// lost to peers move on to the next candidate.
    async fn process_candidates(&self, candidates: Vec<Issue>) {
        for issue in candidates {
            match self
                .store
                .claim_issue(&issue.id, &self.identity.instance_id)
                .await
            {
                Ok(()) => {
                    self.process_claimed(&issue).await;
                    return;
                }
                Err(CoordinationError::Conflict { .. })
                | Err(CoordinationError::State { .. }) => {
                    // A peer got there first; that is the system working.
                    debug!(issue_id = %issue.id, "lost claim race");
                    continue;
                }
                Err(e) => {
                    warn!(issue_id = %issue.id, error = %e, "claim failed");
                    return;
                }
            }
        }
    }

    async fn process_claimed(&self, issue: &Issue) {
        let executor_id = &self.identity.instance_id;
        match run_pipeline(self.store.as_ref(), executor_id, self.runner.as_ref(), issue).await {
            Ok(report) => {
                debug!(issue_id = %issue.id, attempt = report.attempt_id, "execution succeeded");
                if let Err(e) = self.finish_success(issue).await {
                    error!(issue_id = %issue.id, error = %e, "post-success bookkeeping failed");
                }
            }
            Err(e) => {
                warn!(issue_id = %issue.id, error = %e, "execution failed, reopening");
                if let Err(release_err) = self
                    .store
                    .release_and_reopen(&issue.id, executor_id, &e.to_string())
                    .await
                {
                    error!(
                        issue_id = %issue.id,
                        error = %release_err,
                        "failed to reopen after error; janitor will reclaim"
                    );
                }
            }
        }
    }

    /// Close the issue, fire the configured workflow hand-off, release
    /// the claim.
    async fn finish_success(&self, issue: &Issue) -> Result<()> {
        self.store
            .close_issue(&issue.id, &self.identity.instance_id)
            .await?;
        if let Some(handoff) = &self.config.success_handoff {
            self.store
                .transition_workflow_state(
                    &issue.id,
                    &handoff.from,
                    &handoff.to,
                    handoff.trigger,
                    &self.identity.instance_id,
                )
                .await?;
        }
        self.store.release_issue(&issue.id).await?;
        Ok(())
    }

    async fn deregister(&self) {
        let mut instance = self.identity.to_instance();
        instance.status = ExecutorStatus::Stopped;
        if let Err(e) = self.store.register_instance(&instance).await {
            warn!(error = %e, "failed to mark instance stopped");
        }
    }
}

/// Refresh the registry heartbeat on an interval until shutdown.
fn spawn_heartbeat(
    store: Arc<dyn CoordinationStore>,
    instance_id: String,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it, registration just
        // stamped the heartbeat.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    debug!(instance_id, "heartbeat loop shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match store.update_heartbeat(&instance_id).await {
                        Ok(()) => {}
                        Err(CoordinationError::NotFound { .. }) => {
                            // Someone pruned our row; re-registering on the
                            // next beat keeps us alive.
                            warn!(instance_id, "heartbeat row missing");
                        }
                        Err(e) => {
                            warn!(instance_id, error = %e, "heartbeat failed");
                        }
                    }
                }
            }
        }
    })
}
