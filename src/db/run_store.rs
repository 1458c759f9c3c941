use async_trait::async_trait;
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::models::workflow_run::WorkflowRun;

/// Result of submitting a run: either a freshly inserted row or the existing
/// pending/active run for the same `(workflow_name, resource_id)` pair.
#[derive(Debug, Clone)]
pub struct CreateRunOutcome {
    pub run: WorkflowRun,
    pub created: bool,
}

/// Durable record of run metadata. All cross-process coordination goes
/// through these operations; implementations must make `create_run` and
/// `claim_next_eligible` atomic so concurrent callers and pollers cannot
/// duplicate work.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a `pending` run unless one is already pending or active for the
    /// same `(workflow_name, resource_id)`; in that case return the existing
    /// run with `created = false`. Race-free under concurrent callers.
    async fn create_run(
        &self,
        workflow_name: &str,
        resource_id: &str,
        input: Value,
        max_retries: i32,
    ) -> Result<CreateRunOutcome, sqlx::Error>;

    /// Atomically claim one pending run whose backoff gate has passed and
    /// transition it to `active` under a lease. Two pollers never receive the
    /// same run.
    async fn claim_next_eligible(
        &self,
        worker_id: &str,
        lease_seconds: i32,
    ) -> Result<Option<WorkflowRun>, sqlx::Error>;

    /// Terminal success. Idempotent: re-applying to a finished run is a no-op.
    async fn mark_completed(&self, run_id: Uuid) -> Result<(), sqlx::Error>;

    /// Terminal failure after retries are exhausted; records the last error.
    /// Idempotent like `mark_completed`.
    async fn mark_failed(&self, run_id: Uuid, error: &str) -> Result<(), sqlx::Error>;

    /// Give the run back to the pending pool with an incremented retry count,
    /// eligible for claiming again once `next_attempt_at` passes.
    async fn mark_retrying(
        &self,
        run_id: Uuid,
        next_attempt_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error>;

    /// Heartbeat for a long-running execution; called between steps so the
    /// recovery sweep keeps its hands off a run that is still making progress.
    async fn renew_lease(
        &self,
        run_id: Uuid,
        worker_id: &str,
        lease_seconds: i32,
    ) -> Result<(), sqlx::Error>;

    /// Recovery sweep: requeue `active` runs whose lease expired (their
    /// worker died mid-run). Returns how many runs were requeued.
    async fn requeue_expired_leases(&self) -> Result<u64, sqlx::Error>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, sqlx::Error>;

    /// Newest-first listing for status reporting.
    async fn list_runs(
        &self,
        workflow_name: Option<String>,
        resource_id: Option<String>,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>, sqlx::Error>;

    /// Delete terminal runs older than the cutoff. Retention is an external
    /// policy; the engine never calls this on its own.
    async fn purge_finished_before(&self, cutoff: OffsetDateTime) -> Result<u64, sqlx::Error>;
}
