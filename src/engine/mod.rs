mod executor;

pub(crate) use executor::execute_run;
pub use executor::ExecutorError;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::db::run_store::RunStore;
use crate::db::step_store::StepStore;
use crate::error::EngineError;
use crate::registry::WorkflowRegistry;
use crate::worker;

/// Longest accepted resource key. The column is sized for natural keys, so
/// callers never need to truncate; anything past this is almost certainly a
/// bug on their side.
const MAX_RESOURCE_ID_LEN: usize = 128;

/// Everything a poller or executor needs, shared by cheap clone.
#[derive(Clone)]
pub(crate) struct EngineContext {
    pub registry: Arc<WorkflowRegistry>,
    pub runs: Arc<dyn RunStore>,
    pub steps: Arc<dyn StepStore>,
    pub config: Arc<EngineConfig>,
}

/// Result of `submit`: the durably created run, or the already in-flight run
/// for the same `(workflow, resource)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartOutcome {
    pub run_id: Uuid,
    pub created: bool,
}

/// The durable workflow engine. Explicitly constructed and dependency
/// injected; the embedding service owns its lifecycle and calls `start` once
/// workflows are registered and `shutdown` when the host process drains.
pub struct WorkflowEngine {
    ctx: EngineContext,
    shutdown: CancellationToken,
    pollers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkflowEngine {
    pub fn new(
        registry: WorkflowRegistry,
        runs: Arc<dyn RunStore>,
        steps: Arc<dyn StepStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            ctx: EngineContext {
                registry: Arc::new(registry),
                runs,
                steps,
                config: Arc::new(config),
            },
            shutdown: CancellationToken::new(),
            pollers: Mutex::new(Vec::new()),
        }
    }

    /// Convenience for stores that implement both traits (the Postgres and
    /// in-memory stores do).
    pub fn with_store<S>(registry: WorkflowRegistry, store: Arc<S>, config: EngineConfig) -> Self
    where
        S: RunStore + StepStore + 'static,
    {
        let runs: Arc<dyn RunStore> = store.clone();
        let steps: Arc<dyn StepStore> = store;
        Self::new(registry, runs, steps, config)
    }

    /// Submit a run for background execution. Returns as soon as the run row
    /// is durable; execution happens later on whichever poller claims it.
    /// A live run for the same `(workflow_name, resource_id)` is returned
    /// as-is with `created = false` instead of creating a duplicate.
    pub async fn submit(
        &self,
        workflow_name: &str,
        resource_id: &str,
        input: Value,
    ) -> Result<StartOutcome, EngineError> {
        let definition = self.ctx.registry.lookup(workflow_name)?;

        let resource_id = resource_id.trim();
        if resource_id.is_empty() {
            return Err(EngineError::InvalidInput(
                "resource id must not be empty".into(),
            ));
        }
        if resource_id.len() > MAX_RESOURCE_ID_LEN {
            return Err(EngineError::InvalidInput(format!(
                "resource id exceeds {MAX_RESOURCE_ID_LEN} characters"
            )));
        }
        definition.validate_input(&input)?;

        let outcome = self
            .ctx
            .runs
            .create_run(
                workflow_name,
                resource_id,
                input,
                definition.retry_policy().max_retries,
            )
            .await
            .map_err(|err| match &err {
                sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
                    EngineError::ResourceBusy {
                        workflow_name: workflow_name.to_string(),
                        resource_id: resource_id.to_string(),
                    }
                }
                _ => EngineError::Store(err),
            })?;

        if outcome.created {
            info!(
                run_id = %outcome.run.id,
                workflow = workflow_name,
                resource_id,
                "run accepted"
            );
        } else {
            info!(
                run_id = %outcome.run.id,
                workflow = workflow_name,
                resource_id,
                "resource busy; returning in-flight run"
            );
        }

        Ok(StartOutcome {
            run_id: outcome.run.id,
            created: outcome.created,
        })
    }

    /// Spawn the configured number of poller tasks and return immediately.
    pub async fn start(&self) {
        let mut pollers = self.pollers.lock().await;
        if !pollers.is_empty() {
            warn!("engine already started; ignoring start()");
            return;
        }
        for n in 0..self.ctx.config.pollers {
            let ctx = self.ctx.clone();
            let shutdown = self.shutdown.clone();
            pollers.push(tokio::spawn(async move {
                worker::run_poller(ctx, shutdown, n).await;
            }));
        }
        info!(
            pollers = self.ctx.config.pollers,
            worker_id = %self.ctx.config.worker_id,
            "workflow engine started"
        );
    }

    /// Stop claiming new runs immediately and wait for in-flight work to
    /// drain. An executor mid-run finishes its current step only; the run
    /// stays `active` and is resumed elsewhere via lease expiry.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut pollers = self.pollers.lock().await;
        for handle in pollers.drain(..) {
            if let Err(err) = handle.await {
                warn!(?err, "poller task ended abnormally during shutdown");
            }
        }
        info!("workflow engine stopped");
    }

    pub(crate) fn context(&self) -> &EngineContext {
        &self.ctx
    }
}
