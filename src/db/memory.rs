use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use time::{Duration as TimeDuration, OffsetDateTime};
use uuid::Uuid;

use crate::db::run_store::{CreateRunOutcome, RunStore};
use crate::db::step_store::StepStore;
use crate::models::step_record::StepRecord;
use crate::models::workflow_run::{RunStatus, WorkflowRun};

/// In-process implementation of both stores, for tests and for embedding the
/// engine without a database. A single mutex guards all state, so the
/// conditional insert and the claim are exactly as atomic as their Postgres
/// counterparts.
#[derive(Default)]
pub struct MemoryEngineStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<Uuid, WorkflowRun>,
    steps: Vec<StepRecord>,
}

impl MemoryEngineStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunStore for MemoryEngineStore {
    async fn create_run(
        &self,
        workflow_name: &str,
        resource_id: &str,
        input: Value,
        max_retries: i32,
    ) -> Result<CreateRunOutcome, sqlx::Error> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");

        if let Some(existing) = inner
            .runs
            .values()
            .find(|r| {
                r.workflow_name == workflow_name
                    && r.resource_id == resource_id
                    && matches!(
                        r.run_status(),
                        Some(RunStatus::Pending) | Some(RunStatus::Active)
                    )
            })
            .cloned()
        {
            return Ok(CreateRunOutcome {
                run: existing,
                created: false,
            });
        }

        let now = OffsetDateTime::now_utc();
        let run = WorkflowRun {
            id: Uuid::new_v4(),
            workflow_name: workflow_name.to_string(),
            resource_id: resource_id.to_string(),
            input,
            status: RunStatus::Pending.as_str().to_string(),
            retry_count: 0,
            max_retries,
            error: None,
            next_attempt_at: None,
            leased_by: None,
            lease_expires_at: None,
            heartbeat_at: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };
        inner.runs.insert(run.id, run.clone());
        Ok(CreateRunOutcome { run, created: true })
    }

    async fn claim_next_eligible(
        &self,
        worker_id: &str,
        lease_seconds: i32,
    ) -> Result<Option<WorkflowRun>, sqlx::Error> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let now = OffsetDateTime::now_utc();

        let candidate = inner
            .runs
            .values()
            .filter(|r| {
                r.run_status() == Some(RunStatus::Pending)
                    && r.next_attempt_at.map(|t| t <= now).unwrap_or(true)
            })
            .min_by_key(|r| r.created_at)
            .map(|r| r.id);

        let Some(id) = candidate else {
            return Ok(None);
        };
        let run = inner
            .runs
            .get_mut(&id)
            .expect("claimed run vanished under lock");
        run.status = RunStatus::Active.as_str().to_string();
        run.leased_by = Some(worker_id.to_string());
        run.heartbeat_at = Some(now);
        run.lease_expires_at = Some(now + TimeDuration::seconds(lease_seconds as i64));
        run.updated_at = now;
        Ok(Some(run.clone()))
    }

    async fn mark_completed(&self, run_id: Uuid) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if let Some(run) = inner.runs.get_mut(&run_id) {
            if run.run_status().map(|s| s.is_terminal()) != Some(true) {
                let now = OffsetDateTime::now_utc();
                run.status = RunStatus::Completed.as_str().to_string();
                run.completed_at.get_or_insert(now);
                run.leased_by = None;
                run.lease_expires_at = None;
                run.updated_at = now;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, run_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if let Some(run) = inner.runs.get_mut(&run_id) {
            if run.run_status().map(|s| s.is_terminal()) != Some(true) {
                let now = OffsetDateTime::now_utc();
                run.status = RunStatus::Failed.as_str().to_string();
                run.error = Some(error.to_string());
                run.completed_at.get_or_insert(now);
                run.leased_by = None;
                run.lease_expires_at = None;
                run.updated_at = now;
            }
        }
        Ok(())
    }

    async fn mark_retrying(
        &self,
        run_id: Uuid,
        next_attempt_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if let Some(run) = inner.runs.get_mut(&run_id) {
            if run.run_status() == Some(RunStatus::Active) {
                run.status = RunStatus::Pending.as_str().to_string();
                run.retry_count += 1;
                run.next_attempt_at = Some(next_attempt_at);
                run.leased_by = None;
                run.lease_expires_at = None;
                run.updated_at = OffsetDateTime::now_utc();
            }
        }
        Ok(())
    }

    async fn renew_lease(
        &self,
        run_id: Uuid,
        worker_id: &str,
        lease_seconds: i32,
    ) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        if let Some(run) = inner.runs.get_mut(&run_id) {
            if run.leased_by.as_deref() == Some(worker_id) {
                let now = OffsetDateTime::now_utc();
                run.heartbeat_at = Some(now);
                run.lease_expires_at = Some(now + TimeDuration::seconds(lease_seconds as i64));
                run.updated_at = now;
            }
        }
        Ok(())
    }

    async fn requeue_expired_leases(&self) -> Result<u64, sqlx::Error> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let now = OffsetDateTime::now_utc();
        let mut requeued = 0;
        for run in inner.runs.values_mut() {
            if run.run_status() == Some(RunStatus::Active)
                && run.lease_expires_at.map(|t| t < now).unwrap_or(false)
            {
                run.status = RunStatus::Pending.as_str().to_string();
                run.leased_by = None;
                run.lease_expires_at = None;
                run.updated_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, sqlx::Error> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner.runs.get(&run_id).cloned())
    }

    async fn list_runs(
        &self,
        workflow_name: Option<String>,
        resource_id: Option<String>,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>, sqlx::Error> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        let mut runs: Vec<WorkflowRun> = inner
            .runs
            .values()
            .filter(|r| {
                workflow_name
                    .as_deref()
                    .map(|w| r.workflow_name == w)
                    .unwrap_or(true)
            })
            .filter(|r| {
                resource_id
                    .as_deref()
                    .map(|rid| r.resource_id == rid)
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        runs.truncate(limit.max(0) as usize);
        Ok(runs)
    }

    async fn purge_finished_before(&self, cutoff: OffsetDateTime) -> Result<u64, sqlx::Error> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let doomed: Vec<Uuid> = inner
            .runs
            .values()
            .filter(|r| {
                r.run_status().map(|s| s.is_terminal()) == Some(true) && r.created_at < cutoff
            })
            .map(|r| r.id)
            .collect();
        let count = doomed.len() as u64;
        for id in &doomed {
            inner.runs.remove(id);
        }
        inner.steps.retain(|s| !doomed.contains(&s.run_id));
        Ok(count)
    }
}

#[async_trait]
impl StepStore for MemoryEngineStore {
    async fn get_step_output(
        &self,
        run_id: Uuid,
        step_name: &str,
    ) -> Result<Option<Value>, sqlx::Error> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner
            .steps
            .iter()
            .find(|s| s.run_id == run_id && s.step_name == step_name)
            .map(|s| s.output.clone()))
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, sqlx::Error> {
        let inner = self.inner.lock().expect("memory store lock poisoned");
        Ok(inner
            .steps
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn save_step_output(
        &self,
        run_id: Uuid,
        step_name: &str,
        output: Value,
    ) -> Result<(), sqlx::Error> {
        let mut inner = self.inner.lock().expect("memory store lock poisoned");
        let exists = inner
            .steps
            .iter()
            .any(|s| s.run_id == run_id && s.step_name == step_name);
        if !exists {
            inner.steps.push(StepRecord {
                run_id,
                step_name: step_name.to_string(),
                output,
                completed_at: OffsetDateTime::now_utc(),
            });
        }
        Ok(())
    }
}
