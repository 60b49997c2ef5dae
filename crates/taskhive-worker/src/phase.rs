// Pipeline phase seam
//
// The coordination core does not perform work; assessment, execution,
// analysis, and quality gates are external collaborators plugged in
// through PhaseRunner. The pipeline driver advances the execution state
// machine around whichever phases a runner enables.

use async_trait::async_trait;

use taskhive_core::{AgentEvent, AgentEventType, Issue, Result, Severity};
use taskhive_storage::CoordinationStore;

/// Which optional phases a runner wants driven. Execution itself always
/// runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseToggles {
    pub assess: bool,
    pub analyze: bool,
    pub gates: bool,
}

impl Default for PhaseToggles {
    fn default() -> Self {
        PhaseToggles {
            assess: true,
            analyze: true,
            gates: true,
        }
    }
}

impl PhaseToggles {
    /// Everything off except execution.
    pub fn minimal() -> Self {
        PhaseToggles {
            assess: false,
            analyze: false,
            gates: false,
        }
    }
}

/// What the execute phase produced, recorded on the attempt row.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub summary: String,
    pub exit_code: Option<i64>,
    pub output_sample: String,
}

/// Quality-gate verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    Passed,
    Failed { reason: String },
}

/// Handle given to each phase: the claimed issue, its checkpoint, and the
/// agent-event stream.
pub struct PhaseContext<'a> {
    pub issue: &'a Issue,
    store: &'a dyn CoordinationStore,
    executor_id: &'a str,
}

impl<'a> PhaseContext<'a> {
    pub(crate) fn new(
        issue: &'a Issue,
        store: &'a dyn CoordinationStore,
        executor_id: &'a str,
    ) -> Self {
        PhaseContext {
            issue,
            store,
            executor_id,
        }
    }

    pub fn executor_id(&self) -> &str {
        self.executor_id
    }

    /// The current checkpoint, parsed. A fresh claim starts at `{}`.
    pub async fn checkpoint(&self) -> Result<serde_json::Value> {
        let raw = self.store.get_checkpoint(&self.issue.id).await?;
        serde_json::from_str(&raw).map_err(|e| {
            taskhive_core::CoordinationError::fatal(
                "checkpoint",
                format!("corrupted checkpoint for {}: {e}", self.issue.id),
            )
        })
    }

    /// Persist intermediate progress so a successor can resume.
    pub async fn save_checkpoint(&self, value: &serde_json::Value) -> Result<()> {
        self.store.save_checkpoint(&self.issue.id, value).await
    }

    /// Publish a fine-grained event tied to this issue and executor.
    pub async fn emit(
        &self,
        event_type: AgentEventType,
        severity: Severity,
        message: impl Into<String>,
    ) -> Result<()> {
        let event = AgentEvent::new(event_type, &self.issue.id, severity, message)
            .with_executor(self.executor_id);
        self.store.record_agent_event(&event).await?;
        Ok(())
    }
}

/// The external collaborators of the pipeline. Implementations do the
/// actual work; the worker only coordinates.
#[async_trait]
pub trait PhaseRunner: Send + Sync {
    /// Which optional phases to drive for this runner.
    fn phases(&self) -> PhaseToggles {
        PhaseToggles::default()
    }

    /// Assessment phase (skipped when disabled).
    async fn assess(&self, _ctx: &PhaseContext<'_>) -> Result<()> {
        Ok(())
    }

    /// The work itself. Always runs.
    async fn execute(&self, ctx: &PhaseContext<'_>) -> Result<ExecutionOutcome>;

    /// Result-analysis phase (skipped when disabled).
    async fn analyze(&self, _ctx: &PhaseContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Quality gates (skipped when disabled).
    async fn run_gates(&self, _ctx: &PhaseContext<'_>) -> Result<GateOutcome> {
        Ok(GateOutcome::Passed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_toggles_enable_everything() {
        let toggles = PhaseToggles::default();
        assert!(toggles.assess && toggles.analyze && toggles.gates);
        let minimal = PhaseToggles::minimal();
        assert!(!minimal.assess && !minimal.analyze && !minimal.gates);
    }
}
