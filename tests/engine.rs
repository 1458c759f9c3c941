//! Behavioral tests of the full engine loop (submit -> claim -> execute ->
//! checkpoint -> retry/complete) over the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::time::sleep;
use uuid::Uuid;

use stagehand::{
    EngineConfig, EngineError, MemoryEngineStore, RetryPolicy, RunFilter, RunStore, StepStore,
    WorkflowDefinition, WorkflowEngine, WorkflowRegistry, WorkflowRun,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        worker_id: "worker-test".into(),
        poll_interval: Duration::from_millis(10),
        lease_seconds: 30,
        sweep_interval: Duration::from_millis(20),
        pollers: 1,
    }
}

fn fast_retries(max_retries: i32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        base_backoff: Duration::from_millis(10),
        max_backoff: Duration::from_millis(50),
    }
}

async fn wait_for_status(engine: &WorkflowEngine, run_id: Uuid, want: &str) -> WorkflowRun {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let run = engine.get_run(run_id).await.expect("run should exist");
        if run.status == want {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} stuck in status `{}` waiting for `{want}`",
            run.status
        );
        sleep(Duration::from_millis(10)).await;
    }
}

struct Counters {
    fetch: Arc<AtomicUsize>,
    generate: Arc<AtomicUsize>,
    save: Arc<AtomicUsize>,
}

/// The analyze-session workflow from the session backend: fetch transcript,
/// call the model, persist the result. `generate` fails its first
/// `failures_before_success` invocations.
fn analyze_session(failures_before_success: usize, max_retries: i32) -> (WorkflowDefinition, Counters) {
    let counters = Counters {
        fetch: Arc::new(AtomicUsize::new(0)),
        generate: Arc::new(AtomicUsize::new(0)),
        save: Arc::new(AtomicUsize::new(0)),
    };

    let fetch = counters.fetch.clone();
    let generate = counters.generate.clone();
    let save = counters.save.clone();

    let definition = WorkflowDefinition::builder("analyze-session")
        .step("fetch", move |ctx| {
            let fetch = fetch.clone();
            async move {
                fetch.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"transcript": format!("transcript for {}", ctx.input["session_id"])}))
            }
        })
        .step("generate", move |ctx| {
            let generate = generate.clone();
            async move {
                let call = generate.fetch_add(1, Ordering::SeqCst);
                assert!(ctx.output("fetch").is_some(), "generate ran before fetch");
                if call < failures_before_success {
                    anyhow::bail!("model endpoint returned 503");
                }
                Ok(json!({"analysis": "the scene went well"}))
            }
        })
        .step("save", move |ctx| {
            let save = save.clone();
            async move {
                save.fetch_add(1, Ordering::SeqCst);
                Ok(ctx.output("generate").cloned().unwrap_or(Value::Null))
            }
        })
        .retry_policy(fast_retries(max_retries))
        .build()
        .expect("definition should build");

    (definition, counters)
}

fn engine_with(definition: WorkflowDefinition) -> (Arc<WorkflowEngine>, Arc<MemoryEngineStore>) {
    init_tracing();
    let mut registry = WorkflowRegistry::new();
    registry.register(definition).expect("register workflow");
    let store = Arc::new(MemoryEngineStore::new());
    let engine = Arc::new(WorkflowEngine::with_store(
        registry,
        store.clone(),
        fast_config(),
    ));
    (engine, store)
}

#[tokio::test]
async fn generate_fails_twice_then_run_completes() {
    let (definition, counters) = analyze_session(2, 3);
    let (engine, _store) = engine_with(definition);

    let outcome = engine
        .submit("analyze-session", "sess-42", json!({"session_id": "sess-42"}))
        .await
        .unwrap();
    assert!(outcome.created);

    engine.start().await;
    let run = wait_for_status(&engine, outcome.run_id, "completed").await;
    engine.shutdown().await;

    assert_eq!(run.retry_count, 2);
    assert!(run.error.is_none());
    assert!(run.completed_at.is_some());
    assert_eq!(counters.fetch.load(Ordering::SeqCst), 1, "fetch re-executed");
    assert_eq!(counters.generate.load(Ordering::SeqCst), 3);
    assert_eq!(counters.save.load(Ordering::SeqCst), 1, "save re-executed");

    let progress = engine.check_progress(outcome.run_id).await.unwrap();
    assert_eq!(progress.completed_steps, 3);
    assert_eq!(progress.total_steps, 3);
    assert!((progress.completion_percentage - 100.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn retries_exhausted_leaves_run_failed_with_last_error() {
    let (definition, counters) = analyze_session(usize::MAX, 2);
    let (engine, _store) = engine_with(definition);

    let outcome = engine
        .submit("analyze-session", "sess-9", json!({"session_id": "sess-9"}))
        .await
        .unwrap();

    engine.start().await;
    let run = wait_for_status(&engine, outcome.run_id, "failed").await;
    engine.shutdown().await;

    assert_eq!(run.retry_count, 1, "two attempts for max_retries = 2");
    assert_eq!(counters.generate.load(Ordering::SeqCst), 2);
    assert_eq!(counters.save.load(Ordering::SeqCst), 0);
    let error = run.error.expect("failed run records its last error");
    assert!(error.contains("generate"), "error names the step: {error}");
    assert!(error.contains("503"), "error keeps the cause: {error}");

    let progress = engine.check_progress(outcome.run_id).await.unwrap();
    assert_eq!(progress.status, "failed");
    assert_eq!(progress.completed_steps, 1, "only fetch checkpointed");
}

#[tokio::test]
async fn duplicate_submit_returns_in_flight_run() {
    let (definition, _counters) = analyze_session(0, 3);
    let (engine, _store) = engine_with(definition);

    let first = engine
        .submit("analyze-session", "sess-7", json!({"session_id": "sess-7"}))
        .await
        .unwrap();
    let second = engine
        .submit("analyze-session", "sess-7", json!({"session_id": "sess-7"}))
        .await
        .unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.run_id, second.run_id);

    let runs = engine
        .get_runs(&RunFilter {
            resource_id: Some("sess-7".into()),
            ..RunFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(runs.len(), 1, "never a second live row for a busy resource");
}

#[tokio::test]
async fn near_simultaneous_submits_create_one_run() {
    let (definition, _counters) = analyze_session(0, 3);
    let (engine, _store) = engine_with(definition);

    let a = engine.submit("analyze-session", "sess-1", json!({"session_id": "sess-1"}));
    let b = engine.submit("analyze-session", "sess-1", json!({"session_id": "sess-1"}));
    let (a, b) = tokio::join!(a, b);
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.run_id, b.run_id);
    assert_eq!(
        [a.created, b.created].iter().filter(|c| **c).count(),
        1,
        "exactly one submit wins"
    );
}

#[tokio::test]
async fn completed_run_frees_the_resource_for_resubmission() {
    let (definition, _counters) = analyze_session(0, 3);
    let (engine, _store) = engine_with(definition);

    let first = engine
        .submit("analyze-session", "sess-5", json!({"session_id": "sess-5"}))
        .await
        .unwrap();
    engine.start().await;
    wait_for_status(&engine, first.run_id, "completed").await;
    engine.shutdown().await;

    let second = engine
        .submit("analyze-session", "sess-5", json!({"session_id": "sess-5"}))
        .await
        .unwrap();
    assert!(second.created);
    assert_ne!(second.run_id, first.run_id);
}

#[tokio::test]
async fn recovery_resumes_past_checkpoint_without_replaying_it() {
    let (definition, counters) = analyze_session(0, 3);
    let (engine, store) = engine_with(definition);

    let outcome = engine
        .submit("analyze-session", "sess-3", json!({"session_id": "sess-3"}))
        .await
        .unwrap();

    // Simulate a worker that claimed the run, checkpointed `fetch`, then
    // died: the run is active under an already-expired lease.
    let claimed = store
        .claim_next_eligible("dead-worker", 0)
        .await
        .unwrap()
        .expect("pending run should be claimable");
    assert_eq!(claimed.id, outcome.run_id);
    store
        .save_step_output(
            outcome.run_id,
            "fetch",
            json!({"transcript": "written before the crash"}),
        )
        .await
        .unwrap();
    sleep(Duration::from_millis(5)).await;

    engine.start().await;
    let run = wait_for_status(&engine, outcome.run_id, "completed").await;
    engine.shutdown().await;

    assert_eq!(run.retry_count, 0, "recovery is not a retry");
    assert_eq!(
        counters.fetch.load(Ordering::SeqCst),
        0,
        "checkpointed fetch must not re-execute"
    );
    assert_eq!(counters.generate.load(Ordering::SeqCst), 1);
    assert_eq!(counters.save.load(Ordering::SeqCst), 1);
    assert_eq!(
        store
            .get_step_output(outcome.run_id, "fetch")
            .await
            .unwrap(),
        Some(json!({"transcript": "written before the crash"})),
        "original checkpoint output preserved"
    );
}

#[tokio::test]
async fn progress_mid_run_counts_checkpoints() {
    let (definition, _counters) = analyze_session(0, 3);
    let (engine, store) = engine_with(definition);

    let outcome = engine
        .submit("analyze-session", "sess-8", json!({"session_id": "sess-8"}))
        .await
        .unwrap();

    store
        .save_step_output(outcome.run_id, "fetch", json!({}))
        .await
        .unwrap();
    store
        .save_step_output(outcome.run_id, "generate", json!({}))
        .await
        .unwrap();

    let progress = engine.check_progress(outcome.run_id).await.unwrap();
    assert_eq!(progress.status, "pending");
    assert_eq!(progress.completed_steps, 2);
    assert_eq!(progress.total_steps, 3);
    assert!((progress.completion_percentage - (200.0 / 3.0)).abs() < 0.01);

    let missing = engine.check_progress(Uuid::new_v4()).await;
    assert!(matches!(missing, Err(EngineError::RunNotFound(_))));
}

#[tokio::test]
async fn submit_validates_workflow_and_resource_id() {
    let (definition, _counters) = analyze_session(0, 3);
    let (engine, _store) = engine_with(definition);

    let unknown = engine.submit("transcribe", "sess-1", json!({})).await;
    assert!(matches!(unknown, Err(EngineError::UnknownWorkflow(_))));

    let empty = engine.submit("analyze-session", "   ", json!({})).await;
    assert!(matches!(empty, Err(EngineError::InvalidInput(_))));

    let long_id = "x".repeat(200);
    let too_long = engine.submit("analyze-session", &long_id, json!({})).await;
    assert!(matches!(too_long, Err(EngineError::InvalidInput(_))));
}

#[tokio::test]
async fn submit_runs_the_input_validator() {
    let definition = WorkflowDefinition::builder("analyze-session")
        .step("only", |_ctx| async { Ok(json!({})) })
        .input_validator(|input| {
            input
                .get("session_id")
                .and_then(Value::as_str)
                .map(|_| ())
                .ok_or_else(|| "missing `session_id`".to_string())
        })
        .build()
        .unwrap();
    let (engine, _store) = engine_with(definition);

    let bad = engine
        .submit("analyze-session", "sess-1", json!({"wrong": true}))
        .await;
    assert!(matches!(bad, Err(EngineError::InvalidInput(msg)) if msg.contains("session_id")));

    let good = engine
        .submit("analyze-session", "sess-1", json!({"session_id": "sess-1"}))
        .await;
    assert!(good.is_ok());
}

#[tokio::test]
async fn shutdown_drains_current_step_and_leaves_run_recoverable() {
    let entered = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());
    let second_step = Arc::new(AtomicUsize::new(0));

    let entered_step = entered.clone();
    let release_step = release.clone();
    let second = second_step.clone();
    let definition = WorkflowDefinition::builder("long-haul")
        .step("first", move |_ctx| {
            let entered = entered_step.clone();
            let release = release_step.clone();
            async move {
                entered.notify_one();
                release.notified().await;
                Ok(json!({"phase": "one"}))
            }
        })
        .step("second", move |_ctx| {
            let second = second.clone();
            async move {
                second.fetch_add(1, Ordering::SeqCst);
                Ok(json!({}))
            }
        })
        .build()
        .unwrap();

    let (engine, store) = engine_with(definition);
    let outcome = engine
        .submit("long-haul", "sess-2", json!({}))
        .await
        .unwrap();

    engine.start().await;
    entered.notified().await;

    // Shutdown while the first step is mid-flight, then let the step finish.
    let engine_for_shutdown = engine.clone();
    let shutdown = tokio::spawn(async move { engine_for_shutdown.shutdown().await });
    sleep(Duration::from_millis(20)).await;
    release.notify_one();
    shutdown.await.unwrap();

    let run = engine.get_run(outcome.run_id).await.unwrap();
    assert_eq!(run.status, "active", "drained run awaits lease recovery");
    assert_eq!(second_step.load(Ordering::SeqCst), 0, "second step must not start");
    assert_eq!(
        store.list_steps(outcome.run_id).await.unwrap().len(),
        1,
        "in-flight step still checkpointed"
    );
}
