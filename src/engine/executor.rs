use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::engine::EngineContext;
use crate::error::{RunTimeoutError, StepExecutionError};
use crate::models::workflow_run::WorkflowRun;
use crate::registry::{StepContext, WorkflowDefinition};

const PERSISTENCE_MAX_ATTEMPTS: usize = 3;
#[cfg(test)]
const PERSISTENCE_INITIAL_BACKOFF: Duration = Duration::from_millis(5);
#[cfg(not(test))]
const PERSISTENCE_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(
        "executor persistence operation `{operation}` failed for run {run_id} after {attempts} attempts: {source}"
    )]
    Persistence {
        run_id: Uuid,
        operation: &'static str,
        attempts: usize,
        #[source]
        source: sqlx::Error,
    },
}

impl ExecutorError {
    pub fn run_id(&self) -> Uuid {
        match self {
            ExecutorError::Persistence { run_id, .. } => *run_id,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            ExecutorError::Persistence { operation, .. } => operation,
        }
    }

    pub fn attempts(&self) -> usize {
        match self {
            ExecutorError::Persistence { attempts, .. } => *attempts,
        }
    }
}

enum AttemptOutcome {
    /// Every step done; carries the final step's output.
    Completed(Value),
    /// A step raised or the attempt timed out; carries the recorded message.
    Failed(String),
    /// Shutdown arrived between steps. The run is left `active`; the lease
    /// sweep hands it to another worker to resume from the last checkpoint.
    Drained,
}

/// Execute one attempt of a claimed run: replay checkpointed steps from the
/// Step Store, run the remaining steps in order, then translate the outcome
/// into a run-level transition.
pub(crate) async fn execute_run(
    ctx: &EngineContext,
    shutdown: &CancellationToken,
    run: WorkflowRun,
) -> Result<(), ExecutorError> {
    let definition = match ctx.registry.lookup(&run.workflow_name) {
        Ok(definition) => definition,
        Err(_) => {
            // Registry drift: a persisted run references a workflow this
            // process does not know. Config-level problem, not retryable.
            warn!(
                run_id = %run.id,
                workflow = %run.workflow_name,
                "claimed run references an unregistered workflow; failing it"
            );
            mark_failed_with_retry(
                ctx,
                run.id,
                &format!("workflow `{}` is not registered", run.workflow_name),
            )
            .await?;
            return Ok(());
        }
    };

    let steps = ctx.steps.clone();
    let run_id = run.id;
    let records = retry_with_backoff(run.id, "list_steps", || {
        let steps = steps.clone();
        async move { steps.list_steps(run_id).await }
    })
    .await?;

    let mut outputs: Map<String, Value> = records
        .into_iter()
        .map(|record| (record.step_name, record.output))
        .collect();
    if !outputs.is_empty() {
        info!(
            run_id = %run.id,
            workflow = %run.workflow_name,
            checkpointed = outputs.len(),
            "resuming run past checkpointed steps"
        );
    }

    let budget = definition.timeout();
    let outcome = match timeout(
        budget,
        run_attempt(ctx, shutdown, &definition, &run, &mut outputs),
    )
    .await
    {
        Ok(result) => result?,
        Err(_) => AttemptOutcome::Failed(RunTimeoutError { budget }.to_string()),
    };

    match outcome {
        AttemptOutcome::Drained => {
            info!(
                run_id = %run.id,
                workflow = %run.workflow_name,
                "shutdown during run; leaving it active for lease recovery"
            );
            Ok(())
        }
        AttemptOutcome::Completed(_) => {
            mark_completed_with_retry(ctx, run.id).await?;
            info!(run_id = %run.id, workflow = %run.workflow_name, "run completed");
            Ok(())
        }
        AttemptOutcome::Failed(message) => {
            let failures = run.retry_count + 1;
            if failures < run.max_retries {
                let delay = definition.retry_policy().backoff_for(failures);
                let next_attempt_at =
                    OffsetDateTime::now_utc() + TimeDuration::seconds_f64(delay.as_secs_f64());
                mark_retrying_with_retry(ctx, run.id, next_attempt_at).await?;
                warn!(
                    run_id = %run.id,
                    workflow = %run.workflow_name,
                    failures,
                    max_retries = run.max_retries,
                    backoff_ms = delay.as_millis() as u64,
                    error = %message,
                    "run attempt failed; scheduled for retry"
                );
            } else {
                mark_failed_with_retry(ctx, run.id, &message).await?;
                error!(
                    run_id = %run.id,
                    workflow = %run.workflow_name,
                    failures,
                    error = %message,
                    "run failed; retries exhausted"
                );
            }
            Ok(())
        }
    }
}

async fn run_attempt(
    ctx: &EngineContext,
    shutdown: &CancellationToken,
    definition: &WorkflowDefinition,
    run: &WorkflowRun,
    outputs: &mut Map<String, Value>,
) -> Result<AttemptOutcome, ExecutorError> {
    let lease_refresh_interval =
        Duration::from_secs(((ctx.config.lease_seconds.max(1) as u64) / 2).max(1));
    let mut last_lease_refresh = Instant::now();
    let mut last_output = Value::Null;

    for step in definition.steps() {
        if shutdown.is_cancelled() {
            return Ok(AttemptOutcome::Drained);
        }

        if last_lease_refresh.elapsed() >= lease_refresh_interval {
            renew_lease_with_retry(ctx, run.id).await?;
            last_lease_refresh = Instant::now();
        }

        if let Some(existing) = outputs.get(step.name()) {
            debug!(
                run_id = %run.id,
                step = step.name(),
                "step already checkpointed; skipping"
            );
            last_output = existing.clone();
            continue;
        }

        let step_ctx = StepContext {
            input: run.input.clone(),
            outputs: outputs.clone(),
        };
        debug!(run_id = %run.id, step = step.name(), "executing step");

        match step.handler().run(step_ctx).await {
            Ok(value) => {
                let steps = ctx.steps.clone();
                let run_id = run.id;
                let step_name = step.name().to_string();
                let output = value.clone();
                retry_with_backoff(run.id, "save_step_output", move || {
                    let steps = steps.clone();
                    let step_name = step_name.clone();
                    let output = output.clone();
                    async move { steps.save_step_output(run_id, &step_name, output).await }
                })
                .await?;
                outputs.insert(step.name().to_string(), value.clone());
                last_output = value;
            }
            Err(err) => {
                let failure = StepExecutionError {
                    step: step.name().to_string(),
                    message: format!("{err:#}"),
                };
                return Ok(AttemptOutcome::Failed(failure.to_string()));
            }
        }
    }

    Ok(AttemptOutcome::Completed(last_output))
}

async fn retry_with_backoff<T, Fut, F>(
    run_id: Uuid,
    operation: &'static str,
    mut op: F,
) -> Result<T, ExecutorError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
{
    let mut attempt = 0usize;
    let mut backoff = PERSISTENCE_INITIAL_BACKOFF;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < PERSISTENCE_MAX_ATTEMPTS => {
                warn!(
                    %run_id,
                    operation,
                    attempt,
                    ?err,
                    "executor persistence operation failed; retrying"
                );
                sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(err) => {
                error!(
                    %run_id,
                    operation,
                    attempt,
                    ?err,
                    "executor persistence operation exhausted retries"
                );
                return Err(ExecutorError::Persistence {
                    run_id,
                    operation,
                    attempts: attempt,
                    source: err,
                });
            }
        }
    }
}

async fn mark_completed_with_retry(ctx: &EngineContext, run_id: Uuid) -> Result<(), ExecutorError> {
    let runs = ctx.runs.clone();
    retry_with_backoff(run_id, "mark_completed", move || {
        let runs = runs.clone();
        async move { runs.mark_completed(run_id).await }
    })
    .await
}

async fn mark_failed_with_retry(
    ctx: &EngineContext,
    run_id: Uuid,
    error: &str,
) -> Result<(), ExecutorError> {
    let runs = ctx.runs.clone();
    let error = error.to_string();
    retry_with_backoff(run_id, "mark_failed", move || {
        let runs = runs.clone();
        let error = error.clone();
        async move { runs.mark_failed(run_id, &error).await }
    })
    .await
}

async fn mark_retrying_with_retry(
    ctx: &EngineContext,
    run_id: Uuid,
    next_attempt_at: OffsetDateTime,
) -> Result<(), ExecutorError> {
    let runs = ctx.runs.clone();
    retry_with_backoff(run_id, "mark_retrying", move || {
        let runs = runs.clone();
        async move { runs.mark_retrying(run_id, next_attempt_at).await }
    })
    .await
}

async fn renew_lease_with_retry(ctx: &EngineContext, run_id: Uuid) -> Result<(), ExecutorError> {
    let runs = ctx.runs.clone();
    let worker_id = ctx.config.worker_id.clone();
    let lease_seconds = ctx.config.lease_seconds;
    retry_with_backoff(run_id, "renew_lease", move || {
        let runs = runs.clone();
        let worker_id = worker_id.clone();
        async move { runs.renew_lease(run_id, &worker_id, lease_seconds).await }
    })
    .await
}
