use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::WorkflowEngine;
use crate::error::EngineError;
use crate::models::workflow_run::WorkflowRun;

const DEFAULT_LIMIT: i64 = 50;
const MAX_LIMIT: i64 = 500;

/// Query shape for run listings. Everything optional; unfiltered listings are
/// capped at `MAX_LIMIT` regardless of what the caller asks for.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunFilter {
    pub workflow_name: Option<String>,
    pub resource_id: Option<String>,
    pub limit: Option<i64>,
}

/// Point-in-time progress of one run, computed by counting checkpoints
/// against the definition's step count. Safe to call mid-execution; the
/// numbers lag the executor by at most one commit.
#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub run_id: Uuid,
    pub status: String,
    pub error: Option<String>,
    pub completed_steps: usize,
    pub total_steps: usize,
    pub completion_percentage: f64,
}

impl WorkflowEngine {
    /// Newest-first listing of runs for status reporting. Read-only.
    pub async fn get_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, EngineError> {
        let limit = filter.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let runs = self
            .context()
            .runs
            .list_runs(
                filter.workflow_name.clone(),
                filter.resource_id.clone(),
                limit,
            )
            .await?;
        Ok(runs)
    }

    pub async fn get_run(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        self.context()
            .runs
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    /// Step-level progress for one run.
    pub async fn check_progress(&self, run_id: Uuid) -> Result<RunProgress, EngineError> {
        let ctx = self.context();
        let run = ctx
            .runs
            .get_run(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let definition = ctx.registry.lookup(&run.workflow_name)?;

        let total_steps = definition.step_count();
        let records = ctx.steps.list_steps(run_id).await?;
        // Tolerate stray records from a renamed step; progress never exceeds
        // the definition.
        let completed_steps = records
            .iter()
            .filter(|r| definition.steps().iter().any(|s| s.name() == r.step_name))
            .count()
            .min(total_steps);
        let completion_percentage = if total_steps == 0 {
            0.0
        } else {
            (completed_steps as f64 / total_steps as f64) * 100.0
        };

        Ok(RunProgress {
            run_id,
            status: run.status,
            error: run.error,
            completed_steps,
            total_steps,
            completion_percentage,
        })
    }
}
