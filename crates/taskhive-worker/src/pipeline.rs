// Pipeline driver
//
// Advances a claimed issue through the execution state machine around the
// runner's enabled phases, saving attempt history and publishing agent
// events. The caller owns the claim; on error the caller decides whether
// to release-and-reopen.

use chrono::Utc;
use tracing::{debug, error, instrument};

use taskhive_core::{
    AgentEventType, CoordinationError, ExecutionAttempt, ExecutionState, Issue, Result, Severity,
};
use taskhive_storage::CoordinationStore;

use crate::phase::{GateOutcome, PhaseContext, PhaseRunner};

/// Result of one pipeline run over one claimed issue.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub issue_id: String,
    pub attempt_id: i64,
    pub summary: String,
}

/// Drive a freshly claimed issue to `completed`, or to `failed` with the
/// error propagated.
///
/// State walk depends on the runner's toggles:
/// `claimed [-> assessing] -> executing [-> analyzing] [-> gates] -> completed`.
#[instrument(skip(store, runner), fields(issue_id = %issue.id, executor_id))]
pub async fn run_pipeline(
    store: &dyn CoordinationStore,
    executor_id: &str,
    runner: &dyn PhaseRunner,
    issue: &Issue,
) -> Result<PipelineReport> {
    let ctx = PhaseContext::new(issue, store, executor_id);
    let toggles = runner.phases();

    ctx.emit(
        AgentEventType::IssueClaimed,
        Severity::Info,
        format!("issue {} claimed by {executor_id}", issue.id),
    )
    .await?;

    let mut attempt = ExecutionAttempt::new(&issue.id);
    let attempt_id = store.record_attempt(&attempt).await?;
    attempt.id = Some(attempt_id);

    let outcome = drive_phases(store, runner, &ctx, issue, toggles).await;

    match outcome {
        Ok(summary) => {
            attempt.completed_at = Some(Utc::now());
            attempt.success = Some(true);
            attempt.exit_code = summary.exit_code;
            attempt.summary = summary.summary.clone();
            attempt.output_sample = summary.output_sample.clone();
            store.record_attempt(&attempt).await?;
            debug!(issue_id = %issue.id, attempt_id, "pipeline completed");
            Ok(PipelineReport {
                issue_id: issue.id.clone(),
                attempt_id,
                summary: summary.summary,
            })
        }
        Err(e) => {
            error!(issue_id = %issue.id, error = %e, "pipeline failed");
            // Best-effort failure bookkeeping; the original error wins.
            if let Err(fail_err) = store
                .update_execution_state(&issue.id, ExecutionState::Failed)
                .await
            {
                error!(issue_id = %issue.id, error = %fail_err, "could not mark failed");
            }
            attempt.completed_at = Some(Utc::now());
            attempt.success = Some(false);
            attempt.error_sample = e.to_string();
            if let Err(record_err) = store.record_attempt(&attempt).await {
                error!(issue_id = %issue.id, error = %record_err, "could not record failure");
            }
            if let Err(emit_err) = ctx
                .emit(AgentEventType::Error, Severity::Error, e.to_string())
                .await
            {
                error!(issue_id = %issue.id, error = %emit_err, "could not emit error event");
            }
            Err(e)
        }
    }
}

async fn drive_phases(
    store: &dyn CoordinationStore,
    runner: &dyn PhaseRunner,
    ctx: &PhaseContext<'_>,
    issue: &Issue,
    toggles: crate::phase::PhaseToggles,
) -> Result<crate::phase::ExecutionOutcome> {
    if toggles.assess {
        store
            .update_execution_state(&issue.id, ExecutionState::Assessing)
            .await?;
        ctx.emit(
            AgentEventType::AssessmentStarted,
            Severity::Info,
            "assessment started",
        )
        .await?;
        runner.assess(ctx).await?;
        ctx.emit(
            AgentEventType::AssessmentCompleted,
            Severity::Info,
            "assessment completed",
        )
        .await?;
    }

    store
        .update_execution_state(&issue.id, ExecutionState::Executing)
        .await?;
    let outcome = runner.execute(ctx).await?;

    if toggles.analyze {
        store
            .update_execution_state(&issue.id, ExecutionState::Analyzing)
            .await?;
        ctx.emit(
            AgentEventType::AnalysisStarted,
            Severity::Info,
            "analysis started",
        )
        .await?;
        runner.analyze(ctx).await?;
        ctx.emit(
            AgentEventType::AnalysisCompleted,
            Severity::Info,
            "analysis completed",
        )
        .await?;
    }

    if toggles.gates {
        store
            .update_execution_state(&issue.id, ExecutionState::Gates)
            .await?;
        ctx.emit(
            AgentEventType::QualityGatesStarted,
            Severity::Info,
            "quality gates started",
        )
        .await?;
        match runner.run_gates(ctx).await? {
            GateOutcome::Passed => {
                ctx.emit(
                    AgentEventType::QualityGatesCompleted,
                    Severity::Info,
                    "quality gates passed",
                )
                .await?;
            }
            GateOutcome::Failed { reason } => {
                ctx.emit(
                    AgentEventType::QualityGatesCompleted,
                    Severity::Error,
                    format!("quality gates failed: {reason}"),
                )
                .await?;
                return Err(CoordinationError::state(
                    "run_pipeline",
                    format!("quality gates failed for {}: {reason}", issue.id),
                ));
            }
        }
    } else {
        ctx.emit(
            AgentEventType::QualityGatesSkipped,
            Severity::Info,
            "quality gates skipped",
        )
        .await?;
    }

    store
        .update_execution_state(&issue.id, ExecutionState::Completed)
        .await?;
    Ok(outcome)
}
