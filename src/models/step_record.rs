use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Durable checkpoint of one completed step within a run.
///
/// Presence of a record for `(run_id, step_name)` means the step must never
/// execute again for that run; resumption returns the stored output instead.
#[derive(Debug, FromRow, Serialize, Deserialize, Clone)]
pub struct StepRecord {
    pub run_id: Uuid,
    pub step_name: String,
    pub output: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub completed_at: OffsetDateTime,
}
