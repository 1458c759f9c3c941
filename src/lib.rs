//! Durable workflow execution engine.
//!
//! Register linear sequences of named steps, submit runs keyed by a resource
//! id, and let one or more pollers (in any number of processes sharing one
//! store) execute them. Every completed step is checkpointed, so a crash or
//! restart resumes a run without repeating side-effecting work; failed
//! attempts retry with bounded exponential backoff; a resource never has two
//! live runs at once.
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use stagehand::{
//!     EngineConfig, PostgresEngineStore, WorkflowDefinition, WorkflowEngine, WorkflowRegistry,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut registry = WorkflowRegistry::new();
//! registry.register(
//!     WorkflowDefinition::builder("analyze-session")
//!         .step("fetch", |ctx| async move { Ok(json!({"transcript": ctx.input["session_id"].clone()})) })
//!         .step("generate", |ctx| async move { Ok(json!({"analysis": ctx.output("fetch")})) })
//!         .step("save", |ctx| async move { Ok(ctx.output("generate").cloned().unwrap()) })
//!         .build()?,
//! )?;
//!
//! let store = Arc::new(PostgresEngineStore::connect("postgres://localhost/app").await?);
//! store.migrate().await?;
//!
//! let engine = WorkflowEngine::with_store(registry, store, EngineConfig::from_env());
//! engine.start().await;
//! let outcome = engine.submit("analyze-session", "sess-42", json!({"session_id": "sess-42"})).await?;
//! let progress = engine.check_progress(outcome.run_id).await?;
//! # engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod models;
pub mod progress;
pub mod registry;
mod worker;

pub use config::EngineConfig;
pub use db::{CreateRunOutcome, MemoryEngineStore, PostgresEngineStore, RunStore, StepStore};
pub use engine::{ExecutorError, StartOutcome, WorkflowEngine};
pub use error::{EngineError, RunTimeoutError, StepExecutionError};
pub use models::{RunStatus, StepRecord, WorkflowRun};
pub use progress::{RunFilter, RunProgress};
pub use registry::{
    RetryPolicy, Step, StepContext, StepHandler, WorkflowDefinition, WorkflowDefinitionBuilder,
    WorkflowRegistry,
};
