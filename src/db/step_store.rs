use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::step_record::StepRecord;

/// Durable checkpoints of step outputs, keyed by `(run_id, step_name)`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StepStore: Send + Sync {
    async fn get_step_output(
        &self,
        run_id: Uuid,
        step_name: &str,
    ) -> Result<Option<Value>, sqlx::Error>;

    /// Every checkpoint recorded for the run, in completion order.
    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, sqlx::Error>;

    /// Persist a step's output. Idempotent: a duplicate checkpoint (resumed
    /// attempt racing a dead worker's late write) is a no-op, never an error
    /// and never an overwrite.
    async fn save_step_output(
        &self,
        run_id: Uuid,
        step_name: &str,
        output: Value,
    ) -> Result<(), sqlx::Error>;
}
