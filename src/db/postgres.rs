use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::db::run_store::{CreateRunOutcome, RunStore};
use crate::db::step_store::StepStore;
use crate::models::step_record::StepRecord;
use crate::models::workflow_run::WorkflowRun;

const RUN_COLUMNS: &str = "id, workflow_name, resource_id, input, status, retry_count, max_retries, \
     error, next_attempt_at, leased_by, lease_expires_at, heartbeat_at, \
     created_at, updated_at, completed_at";

/// Postgres-backed Run Store and Step Store.
///
/// The busy-resource invariant is enforced by a partial unique index on
/// `(workflow_name, resource_id)` over non-terminal rows, and claiming uses a
/// `FOR UPDATE SKIP LOCKED` CTE, so any number of engine processes can share
/// one database safely.
#[derive(Clone)]
pub struct PostgresEngineStore {
    pool: PgPool,
}

impl PostgresEngineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    /// Open a transaction that will commit a step's own database writes and
    /// its checkpoint atomically, for steps whose side effect is itself a
    /// write to this database. Returns `None` when the step is already
    /// checkpointed, in which case the caller must skip the side effect too.
    pub async fn begin_step(
        &self,
        run_id: Uuid,
        step_name: &str,
    ) -> Result<Option<StepTransaction<'_>>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let existing: Option<i32> = sqlx::query_scalar(
            r#"
            SELECT 1 FROM workflow_steps
            WHERE run_id = $1 AND step_name = $2
            "#,
        )
        .bind(run_id)
        .bind(step_name)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            tx.rollback().await?;
            return Ok(None);
        }

        Ok(Some(StepTransaction {
            tx,
            run_id,
            step_name: step_name.to_string(),
        }))
    }

    async fn find_live_run(
        &self,
        workflow_name: &str,
        resource_id: &str,
    ) -> Result<Option<WorkflowRun>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowRun>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM workflow_runs
            WHERE workflow_name = $1
              AND resource_id = $2
              AND status IN ('pending', 'active')
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(workflow_name)
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
    }
}

/// In-flight combined side-effect-plus-checkpoint transaction handed to a
/// step by [`PostgresEngineStore::begin_step`].
pub struct StepTransaction<'a> {
    tx: Transaction<'a, Postgres>,
    run_id: Uuid,
    step_name: String,
}

impl StepTransaction<'_> {
    /// Connection for the step's own writes.
    pub fn executor(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    /// Insert the checkpoint and commit everything in one shot. A crash
    /// before this point leaves neither the side effect nor the checkpoint.
    pub async fn commit(mut self, output: &Value) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO workflow_steps (run_id, step_name, output, completed_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (run_id, step_name) DO NOTHING
            "#,
        )
        .bind(self.run_id)
        .bind(&self.step_name)
        .bind(output)
        .execute(&mut *self.tx)
        .await?;
        self.tx.commit().await
    }
}

#[async_trait]
impl RunStore for PostgresEngineStore {
    async fn create_run(
        &self,
        workflow_name: &str,
        resource_id: &str,
        input: Value,
        max_retries: i32,
    ) -> Result<CreateRunOutcome, sqlx::Error> {
        // Insert, and on a unique violation against the live-run index fetch
        // the run that beat us. The existing run can finish between those two
        // statements, so loop a couple of times before giving up.
        let mut last_err = None;
        for _ in 0..3 {
            let insert_res = sqlx::query_as::<_, WorkflowRun>(&format!(
                r#"
                INSERT INTO workflow_runs
                    (id, workflow_name, resource_id, input, status, retry_count, max_retries,
                     created_at, updated_at)
                VALUES ($1, $2, $3, $4, 'pending', 0, $5, now(), now())
                RETURNING {RUN_COLUMNS}
                "#
            ))
            .bind(Uuid::new_v4())
            .bind(workflow_name)
            .bind(resource_id)
            .bind(&input)
            .bind(max_retries)
            .fetch_one(&self.pool)
            .await;

            match insert_res {
                Ok(run) => return Ok(CreateRunOutcome { run, created: true }),
                Err(e) => {
                    let is_unique = matches!(&e, sqlx::Error::Database(db)
                        if db.code().map(|c| c == "23505").unwrap_or(false));
                    if !is_unique {
                        return Err(e);
                    }
                    if let Some(run) = self.find_live_run(workflow_name, resource_id).await? {
                        return Ok(CreateRunOutcome {
                            run,
                            created: false,
                        });
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or(sqlx::Error::RowNotFound))
    }

    async fn claim_next_eligible(
        &self,
        worker_id: &str,
        lease_seconds: i32,
    ) -> Result<Option<WorkflowRun>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowRun>(
            r#"
            WITH sel AS (
              SELECT id
              FROM workflow_runs
              WHERE status = 'pending'
                AND (next_attempt_at IS NULL OR next_attempt_at <= now())
              ORDER BY created_at ASC
              LIMIT 1
              FOR UPDATE SKIP LOCKED
            )
            UPDATE workflow_runs wr
            SET status = 'active',
                leased_by = $1,
                heartbeat_at = now(),
                lease_expires_at = now() + ($2::int * INTERVAL '1 second'),
                updated_at = now()
            FROM sel
            WHERE wr.id = sel.id
            RETURNING wr.id, wr.workflow_name, wr.resource_id, wr.input, wr.status,
                      wr.retry_count, wr.max_retries, wr.error, wr.next_attempt_at,
                      wr.leased_by, wr.lease_expires_at, wr.heartbeat_at,
                      wr.created_at, wr.updated_at, wr.completed_at
            "#,
        )
        .bind(worker_id)
        .bind(lease_seconds)
        .fetch_optional(&self.pool)
        .await
    }

    async fn mark_completed(&self, run_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'completed',
                completed_at = COALESCE(completed_at, now()),
                leased_by = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(run_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, run_id: Uuid, error: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'failed',
                error = $2,
                completed_at = COALESCE(completed_at, now()),
                leased_by = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status NOT IN ('completed', 'failed')
            "#,
        )
        .bind(run_id)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_retrying(
        &self,
        run_id: Uuid,
        next_attempt_at: OffsetDateTime,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'pending',
                retry_count = retry_count + 1,
                next_attempt_at = $2,
                leased_by = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(run_id)
        .bind(next_attempt_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn renew_lease(
        &self,
        run_id: Uuid,
        worker_id: &str,
        lease_seconds: i32,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE workflow_runs
            SET heartbeat_at = now(),
                lease_expires_at = now() + ($3::int * INTERVAL '1 second'),
                updated_at = now()
            WHERE id = $1 AND leased_by = $2
            "#,
        )
        .bind(run_id)
        .bind(worker_id)
        .bind(lease_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn requeue_expired_leases(&self) -> Result<u64, sqlx::Error> {
        let res = sqlx::query(
            r#"
            UPDATE workflow_runs
            SET status = 'pending',
                leased_by = NULL,
                lease_expires_at = NULL,
                updated_at = now()
            WHERE status = 'active'
              AND lease_expires_at IS NOT NULL
              AND lease_expires_at < now()
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<WorkflowRun>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowRun>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM workflow_runs
            WHERE id = $1
            "#
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_runs(
        &self,
        workflow_name: Option<String>,
        resource_id: Option<String>,
        limit: i64,
    ) -> Result<Vec<WorkflowRun>, sqlx::Error> {
        sqlx::query_as::<_, WorkflowRun>(&format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM workflow_runs
            WHERE ($1::text IS NULL OR workflow_name = $1)
              AND ($2::text IS NULL OR resource_id = $2)
            ORDER BY created_at DESC
            LIMIT $3
            "#
        ))
        .bind(workflow_name)
        .bind(resource_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
    }

    async fn purge_finished_before(&self, cutoff: OffsetDateTime) -> Result<u64, sqlx::Error> {
        let res = sqlx::query(
            r#"
            DELETE FROM workflow_runs
            WHERE status IN ('completed', 'failed')
              AND created_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected())
    }
}

#[async_trait]
impl StepStore for PostgresEngineStore {
    async fn get_step_output(
        &self,
        run_id: Uuid,
        step_name: &str,
    ) -> Result<Option<Value>, sqlx::Error> {
        sqlx::query_scalar(
            r#"
            SELECT output FROM workflow_steps
            WHERE run_id = $1 AND step_name = $2
            "#,
        )
        .bind(run_id)
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_steps(&self, run_id: Uuid) -> Result<Vec<StepRecord>, sqlx::Error> {
        sqlx::query_as::<_, StepRecord>(
            r#"
            SELECT run_id, step_name, output, completed_at
            FROM workflow_steps
            WHERE run_id = $1
            ORDER BY completed_at ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await
    }

    async fn save_step_output(
        &self,
        run_id: Uuid,
        step_name: &str,
        output: Value,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO workflow_steps (run_id, step_name, output, completed_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (run_id, step_name) DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(step_name)
        .bind(&output)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
